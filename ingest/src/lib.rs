//! Fetch numerically indexed records at a bounded rate and persist them in complete blocks.
//!
//! # Overview
//!
//! Records are identified by a `u64` index and fetched one request per index. Results arrive out of
//! order and are buffered in fixed-size, contiguous blocks (see [block]). A block is handed to the
//! [writer] only once every index of its range has been accounted for: fetched, reported missing by
//! the remote, or failed. The [writer] merges the block into the durable [output] off of the
//! dispatch path.
//!
//! The [dispatcher] generates indices starting from the lowest index that is not yet persisted (see
//! [resume]), bounds the number of in-flight fetches, and paces batches of requests to a target
//! requests-per-second ceiling. [engine] wires all of the above together.
//!
//! # Data Loss
//!
//! Blocks that are still filling when the process stops are discarded. On restart, ingestion
//! resumes after the highest persisted index, so at most the in-memory blocks are fetched again.

use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;

pub mod block;
pub mod dispatcher;
pub mod engine;
mod error;
pub use error::Error;
pub mod gaps;
mod metrics;
pub use metrics::Metrics;
pub mod output;
pub mod resume;
pub mod signal;
pub mod writer;

#[cfg(test)]
pub mod mocks;

/// Create a [std::num::NonZeroUsize], panicking if the value is zero.
#[macro_export]
macro_rules! NZUsize {
    ($val:expr) => {
        ::std::num::NonZeroUsize::new($val).expect("value must be non-zero")
    };
}

/// Create a [std::num::NonZeroU64], panicking if the value is zero.
#[macro_export]
macro_rules! NZU64 {
    ($val:expr) => {
        ::std::num::NonZeroU64::new($val).expect("value must be non-zero")
    };
}

/// Create a [std::num::NonZeroU32], panicking if the value is zero.
#[macro_export]
macro_rules! NZU32 {
    ($val:expr) => {
        ::std::num::NonZeroU32::new($val).expect("value must be non-zero")
    };
}

/// Index reserved by the remote. It is never issued and so never counted as missing.
pub const RESERVED_INDEX: u64 = 1;

/// A record that can be persisted.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Stable identity of the record, if it carries one.
    ///
    /// When present, it is used to compute the resume index and to skip records that are already
    /// persisted when a block is flushed more than once.
    fn index(&self) -> Option<u64>;
}

/// Records are identified by their `"id"` field, which some remotes serialize as a string.
impl Payload for serde_json::Value {
    fn index(&self) -> Option<u64> {
        match self.get("id")? {
            serde_json::Value::Number(id) => id.as_u64(),
            serde_json::Value::String(id) => id.parse().ok(),
            _ => None,
        }
    }
}

/// Retrieves the record stored at an index.
pub trait Fetcher<P: Payload>: Clone + Send + Sync + 'static {
    /// Fetch the record at `index`.
    ///
    /// Returns `None` if the record does not exist or could not be retrieved. Implementations are
    /// responsible for bounding the duration of each call and must not retry.
    fn fetch(&self, index: u64) -> impl Future<Output = Option<P>> + Send;
}

/// A block whose range has been fully accounted for.
#[derive(Clone, Debug, PartialEq)]
pub struct Block<P> {
    /// Identifier of the block (the largest index of its range).
    pub id: u64,

    /// Every `(index, result)` recorded for the block, in insertion order.
    pub entries: Vec<(u64, Option<P>)>,
}

impl<P> Block<P> {
    /// Iterate over the records that were found, in insertion order.
    pub fn payloads(&self) -> impl Iterator<Item = &P> {
        self.entries.iter().filter_map(|(_, result)| result.as_ref())
    }
}

/// Receives completed blocks.
pub trait Flush<P>: Send + Sync + 'static {
    /// Persist `block` in the background.
    ///
    /// Must return without waiting for the block to be persisted.
    fn flush(&self, block: Block<P>);
}
