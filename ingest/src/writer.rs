//! Persist completed blocks in the background.
//!
//! [Writer::flush] returns immediately: each block is persisted by a background task that waits
//! for one of a fixed number of worker slots, then performs a read-merge-rewrite of the
//! [Output] while holding the output's lock from the [Locks] registry. Rewrites of the same target
//! therefore never interleave, while different targets proceed independently.
//!
//! # Merging
//!
//! A block's records are appended to the persisted records in insertion order. Records that carry
//! an identity ([Payload::index]) are skipped if a record with the same identity is already
//! persisted, which makes flushing the same block twice harmless. Records without an identity are
//! always appended.
//!
//! # Failures
//!
//! A failed rewrite is attempted again after [Config::retry_delay], up to [Config::retries] times.
//! If every attempt fails, the block is retained in memory until [Writer::retry] is called and a
//! [Report::Failed] is emitted.

use crate::{output::Output, Block, Error, Flush, Metrics, Payload, NZUsize};
use futures::channel::mpsc;
use std::{
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{Mutex as AsyncMutex, Notify, Semaphore},
};
use tracing::{debug, error, info, warn};

/// Registry of one lock per output target.
#[derive(Default)]
pub struct Locks {
    targets: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Locks {
    /// Return the lock of `target`, creating it on first use.
    pub fn get(&self, target: &str) -> Arc<AsyncMutex<()>> {
        self.targets
            .lock()
            .unwrap()
            .entry(target.to_string())
            .or_default()
            .clone()
    }

    /// Number of targets with a lock.
    pub fn len(&self) -> usize {
        self.targets.lock().unwrap().len()
    }

    /// Whether no lock was created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Configuration for the [Writer].
#[derive(Clone)]
pub struct Config {
    /// Maximum number of flushes executing at once.
    pub workers: NonZeroUsize,

    /// Number of additional attempts after a failed flush.
    pub retries: usize,

    /// Delay between attempts of a failed flush.
    pub retry_delay: Duration,

    /// Locks shared by every writer of the process.
    pub locks: Arc<Locks>,

    /// Metrics to update.
    pub metrics: Metrics,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: NZUsize!(5),
            retries: 3,
            retry_delay: Duration::from_secs(1),
            locks: Arc::default(),
            metrics: Metrics::default(),
        }
    }
}

/// Outcome of a flush.
#[derive(Debug)]
pub enum Report {
    /// The block was persisted and `written` records were appended.
    Flushed { block_id: u64, written: usize },
    /// Every attempt failed and the block was retained.
    Failed { block_id: u64, error: Error },
}

/// Append the records of `block` to `payloads`, returning how many were appended.
///
/// Records whose identity is already present are skipped.
pub fn merge<P: Payload>(payloads: &mut Vec<P>, block: &Block<P>) -> usize {
    let mut known: HashSet<u64> = payloads
        .iter()
        .filter_map(|payload| payload.index())
        .collect();
    let mut written = 0;
    for payload in block.payloads() {
        if let Some(index) = payload.index() {
            if !known.insert(index) {
                continue;
            }
        }
        payloads.push(payload.clone());
        written += 1;
    }
    written
}

struct Inner<P: Payload, O: Output<P>> {
    output: O,
    target: Arc<AsyncMutex<()>>,
    workers: Semaphore,
    retries: usize,
    retry_delay: Duration,
    runtime: Handle,

    retained: Mutex<Vec<Block<P>>>,
    in_flight: AtomicUsize,
    idle: Notify,

    reports: mpsc::UnboundedSender<Report>,
    metrics: Metrics,
}

/// Persists completed blocks to an [Output] in the background.
pub struct Writer<P: Payload, O: Output<P>> {
    inner: Arc<Inner<P, O>>,
}

impl<P: Payload, O: Output<P>> Clone for Writer<P, O> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Payload, O: Output<P>> Writer<P, O> {
    /// Create a writer for `output`, along with the stream of flush outcomes.
    ///
    /// Must be called from within a tokio runtime (flushes are spawned onto it).
    pub fn new(output: O, cfg: Config) -> (Self, mpsc::UnboundedReceiver<Report>) {
        let (reports, receiver) = mpsc::unbounded();
        let target = cfg.locks.get(&output.target());
        let inner = Inner {
            output,
            target,
            workers: Semaphore::new(cfg.workers.get()),
            retries: cfg.retries,
            retry_delay: cfg.retry_delay,
            runtime: Handle::current(),
            retained: Mutex::default(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            reports,
            metrics: cfg.metrics,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Wait until no flush is in flight.
    pub async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Identifiers of the blocks retained after failing to flush.
    pub fn retained(&self) -> Vec<u64> {
        let retained = self.inner.retained.lock().unwrap();
        retained.iter().map(|block| block.id).collect()
    }

    /// Flush every retained block again.
    ///
    /// Returns the number of blocks scheduled.
    pub fn retry(&self) -> usize {
        let blocks = std::mem::take(&mut *self.inner.retained.lock().unwrap());
        self.inner.metrics.retained_blocks.set(0);
        let scheduled = blocks.len();
        for block in blocks {
            debug!(block_id = block.id, "retrying retained block");
            self.flush(block);
        }
        scheduled
    }
}

impl<P: Payload, O: Output<P>> Inner<P, O> {
    async fn persist(&self, block: Block<P>) {
        let Ok(_worker) = self.workers.acquire().await else {
            return;
        };
        let mut attempt = 0;
        loop {
            let result = {
                let _target = self.target.lock().await;
                self.rewrite(&block).await
            };
            match result {
                Ok(written) => {
                    info!(block_id = block.id, written, "flushed block");
                    self.metrics.flushed_blocks.inc();
                    let _ = self.reports.unbounded_send(Report::Flushed {
                        block_id: block.id,
                        written,
                    });
                    return;
                }
                Err(err) if attempt < self.retries => {
                    attempt += 1;
                    warn!(block_id = block.id, attempt, ?err, "flush failed, retrying");
                    self.metrics.flush_failures.inc();
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => {
                    error!(block_id = block.id, ?err, "flush failed, retaining block");
                    self.metrics.flush_failures.inc();
                    let block_id = block.id;
                    {
                        let mut retained = self.retained.lock().unwrap();
                        retained.push(block);
                        self.metrics.retained_blocks.set(retained.len() as i64);
                    }
                    let _ = self
                        .reports
                        .unbounded_send(Report::Failed { block_id, error: err });
                    return;
                }
            }
        }
    }

    async fn rewrite(&self, block: &Block<P>) -> Result<usize, Error> {
        let mut payloads = self.output.load().await?;
        let written = merge(&mut payloads, block);
        self.output.replace(payloads).await?;
        Ok(written)
    }
}

impl<P: Payload, O: Output<P>> Flush<P> for Writer<P, O> {
    fn flush(&self, block: Block<P>) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner.persist(block).await;
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.idle.notify_waiters();
            }
        });
    }
}
