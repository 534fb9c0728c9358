use super::Output;
use crate::{Error, Payload};
use std::sync::{Arc, Mutex};

/// An in-memory [Output].
///
/// Clones share the same payloads (and target).
#[derive(Clone)]
pub struct Memory<P> {
    target: String,
    payloads: Arc<Mutex<Vec<P>>>,
}

impl<P: Payload> Memory<P> {
    /// Create an empty output named `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            payloads: Arc::default(),
        }
    }

    /// Copy of the current payloads.
    pub fn snapshot(&self) -> Vec<P> {
        self.payloads.lock().unwrap().clone()
    }
}

impl<P: Payload> Output<P> for Memory<P> {
    fn target(&self) -> String {
        self.target.clone()
    }

    async fn load(&self) -> Result<Vec<P>, Error> {
        Ok(self.snapshot())
    }

    async fn replace(&self, payloads: Vec<P>) -> Result<(), Error> {
        *self.payloads.lock().unwrap() = payloads;
        Ok(())
    }
}
