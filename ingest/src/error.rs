use std::io::Error as IoError;
use thiserror::Error;

/// Errors that can occur while ingesting records.
#[derive(Error, Debug)]
pub enum Error {
    #[error("index {index} belongs to block {block_id}, which was already flushed")]
    Stale { index: u64, block_id: u64 },
    #[error("index {index} was already recorded in block {block_id}")]
    Duplicate { index: u64, block_id: u64 },
    #[error("index {index} is below the start index {start}")]
    BelowStart { index: u64, start: u64 },
    #[error("output {target} io error: {source}")]
    Io {
        target: String,
        #[source]
        source: IoError,
    },
    #[error("output {target} is corrupt: {source}")]
    Corrupt {
        target: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("output {0} unavailable")]
    Unavailable(String),
    #[error("blocks {0:?} could not be flushed")]
    Unflushed(Vec<u64>),
}
