//! Mock implementations of the traits used by the ingestion pipeline.

use crate::{output::Output, signal::Signaler, Block, Error, Fetcher, Flush, Payload};
use serde_json::{json, Value};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Records every block it is asked to flush.
#[derive(Clone)]
pub struct Collector<P> {
    blocks: Arc<Mutex<Vec<Block<P>>>>,
}

impl<P> Default for Collector<P> {
    fn default() -> Self {
        Self {
            blocks: Arc::default(),
        }
    }
}

impl<P: Clone> Collector<P> {
    pub fn blocks(&self) -> Vec<Block<P>> {
        self.blocks.lock().unwrap().clone()
    }
}

impl<P: Send + 'static> Flush<P> for Collector<P> {
    fn flush(&self, block: Block<P>) {
        self.blocks.lock().unwrap().push(block);
    }
}

/// Serves `{"id": index}` for every index except those configured as absent.
///
/// Optionally delays each response (to exercise out-of-order completion).
#[derive(Clone, Default)]
pub struct Records {
    absent: Arc<HashSet<u64>>,
    delays: Arc<HashMap<u64, Duration>>,
    delay: Duration,
    requests: Arc<Mutex<Vec<u64>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    stop: Arc<Mutex<Option<(u64, Signaler)>>>,
}

impl Records {
    pub fn new(absent: impl IntoIterator<Item = u64>) -> Self {
        Self {
            absent: Arc::new(absent.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn with_delays(mut self, delays: impl IntoIterator<Item = (u64, Duration)>) -> Self {
        self.delays = Arc::new(delays.into_iter().collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Signal `signaler` from within the fetch of `index`.
    pub fn with_stop(mut self, index: u64, signaler: Signaler) -> Self {
        self.stop = Arc::new(Mutex::new(Some((index, signaler))));
        self
    }

    /// Highest number of fetches observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Indices requested so far, in request order.
    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().unwrap().clone()
    }
}

impl Fetcher<Value> for Records {
    async fn fetch(&self, index: u64) -> Option<Value> {
        self.requests.lock().unwrap().push(index);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        let delay = self.delays.get(&index).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        let stop = {
            let mut stop = self.stop.lock().unwrap();
            match stop.take() {
                Some((at, signaler)) if at == index => Some(signaler),
                other => {
                    *stop = other;
                    None
                }
            }
        };
        if let Some(signaler) = stop {
            signaler.signal();
        }
        if self.absent.contains(&index) {
            return None;
        }
        Some(json!({ "id": index }))
    }
}

/// An in-memory output that fails the next `failures` replaces.
#[derive(Clone)]
pub struct Flaky<P> {
    target: String,
    failures: Arc<AtomicUsize>,
    payloads: Arc<Mutex<Vec<P>>>,
    replaces: Arc<AtomicUsize>,
}

impl<P: Payload> Flaky<P> {
    pub fn new(target: &str, failures: usize) -> Self {
        Self {
            target: target.to_string(),
            failures: Arc::new(AtomicUsize::new(failures)),
            payloads: Arc::default(),
            replaces: Arc::default(),
        }
    }

    /// Fail the next `failures` replaces.
    pub fn fail(&self, failures: usize) {
        self.failures.store(failures, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<P> {
        self.payloads.lock().unwrap().clone()
    }

    /// Number of successful replaces.
    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

impl<P: Payload> Output<P> for Flaky<P> {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn load(&self) -> Result<Vec<P>, Error> {
        Ok(self.snapshot())
    }

    async fn replace(&self, payloads: Vec<P>) -> Result<(), Error> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Unavailable(self.target.clone()));
        }

        // Yield between the read and the write to widen any race between concurrent rewrites
        tokio::task::yield_now().await;
        *self.payloads.lock().unwrap() = payloads;
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
