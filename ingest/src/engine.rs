//! Wire a [Fetcher], a [Store], a [Writer] and an [Output] into a single ingestion run.

use crate::{
    block::Store,
    dispatcher::{self, Dispatcher},
    output::Output,
    resume::start_index,
    signal::Signal,
    writer::{self, Report, Writer},
    Error, Fetcher, Metrics, Payload, NZU64,
};
use futures::channel::mpsc;
use prometheus_client::registry::Registry;
use std::{num::NonZeroU64, sync::Arc};
use tracing::{info, warn};

/// Configuration for the [Engine].
#[derive(Clone)]
pub struct Config {
    /// Number of consecutive indices grouped into a block.
    pub block_size: NonZeroU64,

    /// Index to start from. If `None`, ingestion resumes after the highest persisted index.
    pub start: Option<u64>,

    /// Configuration of the dispatch loop.
    pub dispatcher: dispatcher::Config,

    /// Configuration of the background writer.
    ///
    /// Its metrics are replaced with the ones registered by the [Engine].
    pub writer: writer::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: NZU64!(4000),
            start: None,
            dispatcher: dispatcher::Config::default(),
            writer: writer::Config::default(),
        }
    }
}

/// Outcome of an [Engine::run].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Totals of the dispatch loop.
    pub dispatch: dispatcher::Summary,

    /// Number of blocks persisted.
    pub flushed: usize,

    /// Blocks that were still filling at shutdown (and were never persisted).
    pub discarded: Vec<u64>,
}

/// Ingests records from a [Fetcher] into an [Output].
pub struct Engine<P: Payload, F: Fetcher<P>, O: Output<P>> {
    store: Arc<Store<P, Writer<P, O>>>,
    writer: Writer<P, O>,
    reports: mpsc::UnboundedReceiver<Report>,
    dispatcher: Dispatcher<P, F, Writer<P, O>>,
}

impl<P: Payload, F: Fetcher<P>, O: Output<P>> Engine<P, F, O> {
    /// Prepare an ingestion run, registering its metrics with `registry`.
    ///
    /// Reads `output` to determine the start index (unless [Config::start] is set). Must be called
    /// from within a tokio runtime.
    pub async fn new(
        mut cfg: Config,
        fetcher: F,
        output: O,
        registry: &mut Registry,
    ) -> Result<Self, Error> {
        let persisted = output.load().await?;
        let start = start_index(cfg.start, &persisted);
        info!(
            output = %output.target(),
            persisted = persisted.len(),
            start,
            "loaded output"
        );
        drop(persisted);

        let metrics = Metrics::init(registry);
        cfg.writer.metrics = metrics.clone();
        let (writer, reports) = Writer::new(output, cfg.writer);
        let store = Arc::new(Store::new(
            cfg.block_size,
            start,
            writer.clone(),
            metrics.clone(),
        ));
        let dispatcher = Dispatcher::new(cfg.dispatcher, fetcher, store.clone(), metrics);
        Ok(Self {
            store,
            writer,
            reports,
            dispatcher,
        })
    }

    /// Index the run starts from.
    pub fn start(&self) -> u64 {
        self.store.start()
    }

    /// Dispatch until the configured limit is reached or `stop` resolves, then wait for every
    /// completed block to be persisted.
    ///
    /// Blocks that failed every flush attempt are retried once more. If any of them still cannot
    /// be persisted, [Error::Unflushed] is returned.
    pub async fn run(mut self, stop: Signal) -> Result<Summary, Error> {
        let dispatch = self.dispatcher.run(stop).await;
        self.writer.idle().await;
        if !self.writer.retained().is_empty() {
            let scheduled = self.writer.retry();
            info!(scheduled, "retrying retained blocks");
            self.writer.idle().await;
        }

        let mut flushed = 0;
        while let Ok(Some(report)) = self.reports.try_next() {
            if matches!(report, Report::Flushed { .. }) {
                flushed += 1;
            }
        }
        let retained = self.writer.retained();
        if !retained.is_empty() {
            return Err(Error::Unflushed(retained));
        }

        let discarded = self.store.pending();
        if !discarded.is_empty() {
            warn!(?discarded, "discarding incomplete blocks");
        }
        info!(next = dispatch.next, flushed, "ingestion stopped");
        Ok(Summary {
            dispatch,
            flushed,
            discarded,
        })
    }
}
