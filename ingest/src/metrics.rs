use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

/// Metrics for the ingestion pipeline.
///
/// Clones share the same underlying values.
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of indices dispatched to the fetcher
    pub dispatched: Counter,
    /// Number of fetches that returned a record
    pub found: Counter,
    /// Number of fetches that returned no record
    pub absent: Counter,
    /// Number of insertions rejected by the block store
    pub rejected: Counter,
    /// Number of fetches in flight
    pub in_flight: Gauge,
    /// Number of pacing sleeps between batches
    pub pacing_sleeps: Counter,
    /// Number of blocks still filling
    pub pending_blocks: Gauge,
    /// Number of blocks completed
    pub completed_blocks: Counter,
    /// Number of blocks persisted
    pub flushed_blocks: Counter,
    /// Number of failed flush attempts
    pub flush_failures: Counter,
    /// Number of completed blocks waiting to be flushed again
    pub retained_blocks: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        let registry = registry.sub_registry_with_prefix("ingest");
        registry.register(
            "dispatched",
            "Number of indices dispatched to the fetcher",
            metrics.dispatched.clone(),
        );
        registry.register(
            "found",
            "Number of fetches that returned a record",
            metrics.found.clone(),
        );
        registry.register(
            "absent",
            "Number of fetches that returned no record",
            metrics.absent.clone(),
        );
        registry.register(
            "rejected",
            "Number of insertions rejected by the block store",
            metrics.rejected.clone(),
        );
        registry.register(
            "in_flight",
            "Number of fetches in flight",
            metrics.in_flight.clone(),
        );
        registry.register(
            "pacing_sleeps",
            "Number of pacing sleeps between batches",
            metrics.pacing_sleeps.clone(),
        );
        registry.register(
            "pending_blocks",
            "Number of blocks still filling",
            metrics.pending_blocks.clone(),
        );
        registry.register(
            "completed_blocks",
            "Number of blocks completed",
            metrics.completed_blocks.clone(),
        );
        registry.register(
            "flushed_blocks",
            "Number of blocks persisted",
            metrics.flushed_blocks.clone(),
        );
        registry.register(
            "flush_failures",
            "Number of failed flush attempts",
            metrics.flush_failures.clone(),
        );
        registry.register(
            "retained_blocks",
            "Number of completed blocks waiting to be flushed again",
            metrics.retained_blocks.clone(),
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus_client::encoding::text::encode;

    #[test]
    fn test_registered_metrics_are_shared() {
        let mut registry = Registry::default();
        let metrics = Metrics::init(&mut registry);
        metrics.clone().found.inc();
        metrics.pending_blocks.set(3);

        let mut buffer = String::new();
        encode(&mut buffer, &registry).unwrap();
        assert!(buffer.contains("ingest_found_total 1"));
        assert!(buffer.contains("ingest_pending_blocks 3"));
    }
}
