//! Cooperative cancellation.
//!
//! A [Signaler] resolves every clone of its [Signal] at once. Long-running loops select on the
//! [Signal] (or poll [Signal::is_signaled] between steps) to stop starting new work.

use futures::{
    channel::oneshot,
    future::{FutureExt, Shared},
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

/// A one-time broadcast that can be awaited by many tasks.
///
/// Resolves once [Signaler::signal] is called or the [Signaler] is dropped.
#[derive(Clone)]
pub struct Signal {
    inner: Shared<oneshot::Receiver<()>>,
    resolved: bool,

    // Keeps the sender of a signal that never resolves alive
    _sender: Option<Arc<oneshot::Sender<()>>>,
}

impl Signal {
    /// A signal that never resolves.
    pub fn never() -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: rx.shared(),
            resolved: false,
            _sender: Some(Arc::new(tx)),
        }
    }

    /// Whether the signal has already resolved.
    pub fn is_signaled(&self) -> bool {
        self.resolved || self.inner.clone().now_or_never().is_some()
    }
}

impl Future for Signal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The shared receiver must not be polled again once it resolved
        if self.resolved {
            return Poll::Ready(());
        }

        // A dropped signaler counts as a signal
        let resolved = Pin::new(&mut self.inner).poll(cx).is_ready();
        if !resolved {
            return Poll::Pending;
        }
        self.resolved = true;
        Poll::Ready(())
    }
}

/// Coordinates a one-time signal across many tasks.
pub struct Signaler {
    tx: oneshot::Sender<()>,
}

impl Signaler {
    /// Create a new [Signaler].
    ///
    /// Returns a [Signaler] and a [Signal] that will resolve when [Signaler::signal] is called.
    pub fn new() -> (Self, Signal) {
        let (tx, rx) = oneshot::channel();
        let signal = Signal {
            inner: rx.shared(),
            resolved: false,
            _sender: None,
        };
        (Self { tx }, signal)
    }

    /// Resolve every clone of the [Signal].
    pub fn signal(self) {
        let _ = self.tx.send(());
    }
}
