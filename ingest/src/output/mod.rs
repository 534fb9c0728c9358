//! Durable destinations for flushed payloads.
//!
//! An [Output] is a sequence of payloads that is read in full and rewritten in full. Callers are
//! expected to serialize rewrites of the same [Output::target] (see [crate::writer::Locks]).

use crate::{Error, Payload};
use std::future::Future;

mod json;
pub use json::Json;
mod memory;
pub use memory::Memory;

/// A durable sequence of payloads.
pub trait Output<P: Payload>: Clone + Send + Sync + 'static {
    /// Identity of the underlying storage. Two outputs with the same target refer to the same data.
    fn target(&self) -> String;

    /// Read every persisted payload, in order. A target that does not exist yet is empty.
    fn load(&self) -> impl Future<Output = Result<Vec<P>, Error>> + Send;

    /// Atomically replace the persisted payloads with `payloads`.
    fn replace(&self, payloads: Vec<P>) -> impl Future<Output = Result<(), Error>> + Send;
}
