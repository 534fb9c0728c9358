//! Determine where ingestion picks up after a restart.

use crate::{Payload, RESERVED_INDEX};

/// Lowest index that is not yet represented in `payloads`.
///
/// This is one past the highest persisted identity, and never less than the index that follows
/// [RESERVED_INDEX]. Payloads without an identity are ignored.
pub fn resume_index<'a, P, I>(payloads: I) -> u64
where
    P: Payload + 'a,
    I: IntoIterator<Item = &'a P>,
{
    let highest = payloads
        .into_iter()
        .filter_map(|payload| payload.index())
        .fold(RESERVED_INDEX, u64::max);
    highest + 1
}

/// Index to start dispatching from: `configured` if set, otherwise the [resume_index] of `payloads`.
pub fn start_index<'a, P, I>(configured: Option<u64>, payloads: I) -> u64
where
    P: Payload + 'a,
    I: IntoIterator<Item = &'a P>,
{
    configured.unwrap_or_else(|| resume_index(payloads))
}
