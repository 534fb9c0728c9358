//! Rate-limited, concurrent dispatch of fetches.
//!
//! # Overview
//!
//! The [Dispatcher] walks indices upward from the start index of its [Store], issuing one fetch per
//! index. Every fetch must first take a permit from a counting gate sized by [Config::concurrency];
//! a fetch that cannot get a permit is simply not started yet.
//!
//! # Pacing
//!
//! Fetches are grouped into batches of [Config::requests_per_second] indices. Once every fetch of a
//! batch has completed, the dispatcher sleeps for whatever remains of the second that began with the
//! batch. This bounds the average request rate across batches (bursts within a batch may exceed it).
//!
//! # Stopping
//!
//! Dispatch continues until [Config::limit] indices were dispatched or the [Signal] resolves. The
//! signal is observed between batches, while waiting for a permit and while sleeping. Fetches that
//! were already started are always awaited (and their results recorded).

use crate::{
    block::{Insertion, Store},
    signal::Signal,
    Fetcher, Flush, Metrics, Payload, NZU32, NZUsize,
};
use futures::{stream::FuturesUnordered, StreamExt};
use std::{
    marker::PhantomData,
    num::{NonZeroU32, NonZeroUsize},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, error, info};

/// Duration of the window each batch is paced against.
const WINDOW: Duration = Duration::from_secs(1);

/// Configuration for the [Dispatcher].
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of fetches in flight.
    pub concurrency: NonZeroUsize,

    /// Target ceiling on the average number of fetches started per second (also the batch size).
    ///
    /// Values above what the remote tolerates risk being rate limited by it.
    pub requests_per_second: NonZeroU32,

    /// Maximum number of indices to dispatch (unbounded if `None`).
    pub limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: NZUsize!(20),
            requests_per_second: NZU32!(20),
            limit: None,
        }
    }
}

/// Totals of a dispatch run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    /// Next index that would have been dispatched.
    pub next: u64,
    /// Number of indices dispatched.
    pub dispatched: u64,
    /// Number of fetches that returned a record.
    pub found: u64,
    /// Number of fetches that returned no record.
    pub absent: u64,
    /// Number of blocks completed.
    pub completed: u64,
    /// Number of pacing sleeps between batches.
    pub pacing_sleeps: u64,
}

/// Outcome of a single fetch task.
struct Outcome {
    found: bool,
    completed: bool,
}

/// Issues fetches for consecutive indices and records their results.
pub struct Dispatcher<P: Payload, F: Fetcher<P>, S: Flush<P>> {
    cfg: Config,
    fetcher: F,
    store: Arc<Store<P, S>>,
    gate: Arc<Semaphore>,
    metrics: Metrics,
    _payload: PhantomData<P>,
}

impl<P: Payload, F: Fetcher<P>, S: Flush<P>> Dispatcher<P, F, S> {
    /// Create a dispatcher that records the results of `fetcher` in `store`.
    pub fn new(cfg: Config, fetcher: F, store: Arc<Store<P, S>>, metrics: Metrics) -> Self {
        let gate = Arc::new(Semaphore::new(cfg.concurrency.get()));
        Self {
            cfg,
            fetcher,
            store,
            gate,
            metrics,
            _payload: PhantomData,
        }
    }

    /// Dispatch fetches until the limit is reached or `stop` resolves.
    pub async fn run(self, mut stop: Signal) -> Summary {
        let batch_size = u64::from(self.cfg.requests_per_second.get());
        let mut summary = Summary {
            next: self.store.start(),
            ..Default::default()
        };
        info!(
            start = summary.next,
            requests_per_second = batch_size,
            concurrency = self.cfg.concurrency.get(),
            "dispatching"
        );

        loop {
            if stop.is_signaled() {
                debug!(next = summary.next, "stop requested");
                break;
            }
            let remaining = self
                .cfg
                .limit
                .map_or(batch_size, |limit| limit.saturating_sub(summary.dispatched));
            if remaining == 0 {
                break;
            }

            // Start a batch, waiting for a permit before each fetch
            let began = Instant::now();
            let mut batch = FuturesUnordered::new();
            let mut stopped = false;
            for _ in 0..batch_size.min(remaining) {
                // A stop takes precedence over a permit that frees up at the same time
                let permit = tokio::select! {
                    biased;
                    _ = &mut stop => {
                        stopped = true;
                        break;
                    },
                    permit = self.gate.clone().acquire_owned() => permit,
                };
                let Ok(permit) = permit else {
                    stopped = true;
                    break;
                };
                let index = summary.next;
                let fetcher = self.fetcher.clone();
                let store = self.store.clone();
                let metrics = self.metrics.clone();
                batch.push(tokio::spawn(async move {
                    let _permit = permit;
                    metrics.in_flight.inc();
                    let result = fetcher.fetch(index).await;
                    metrics.in_flight.dec();
                    let found = result.is_some();
                    if found {
                        metrics.found.inc();
                    } else {
                        metrics.absent.inc();
                    }

                    // Rejections are logged by the store
                    let completed =
                        matches!(store.insert(index, result), Ok(Insertion::Completed(_)));
                    Outcome { found, completed }
                }));
                self.metrics.dispatched.inc();
                summary.next += 1;
                summary.dispatched += 1;
            }

            // Wait for the batch to complete
            while let Some(joined) = batch.next().await {
                match joined {
                    Ok(outcome) => {
                        if outcome.found {
                            summary.found += 1;
                        } else {
                            summary.absent += 1;
                        }
                        if outcome.completed {
                            summary.completed += 1;
                        }
                    }
                    Err(err) => error!(?err, "fetch task failed"),
                }
            }
            if stopped {
                debug!(next = summary.next, "stop requested");
                break;
            }
            if self.cfg.limit == Some(summary.dispatched) {
                break;
            }

            // Pace the next batch
            let elapsed = began.elapsed();
            if elapsed < WINDOW {
                summary.pacing_sleeps += 1;
                self.metrics.pacing_sleeps.inc();
                tokio::select! {
                    biased;
                    _ = &mut stop => {
                        debug!(next = summary.next, "stop requested");
                        break;
                    },
                    _ = tokio::time::sleep(WINDOW - elapsed) => {},
                }
            }
        }
        info!(
            next = summary.next,
            dispatched = summary.dispatched,
            found = summary.found,
            absent = summary.absent,
            completed = summary.completed,
            "dispatch stopped"
        );
        summary
    }
}
