//! Opaque observability sink, grounded on the teacher's `msg_publisher`/metrics-registry trait
//! split between a business-logic-facing trait and a concrete transport.

use std::time::Instant;

/// Injected into the executor so it can record a duration per operation without depending on a
/// concrete metrics backend.
pub trait Metrics: Send + Sync {
    fn record_duration(&self, operation: &str, started_at: Instant, attrs: &[(&str, &str)]);
}

/// No-op implementation used by default and by tests.
#[derive(Clone, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn record_duration(&self, _operation: &str, _started_at: Instant, _attrs: &[(&str, &str)]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct RecordingMetrics {
        pub records: Arc<Mutex<Vec<String>>>,
    }

    impl Metrics for RecordingMetrics {
        fn record_duration(&self, operation: &str, _started_at: Instant, _attrs: &[(&str, &str)]) {
            self.records.lock().unwrap().push(operation.to_string());
        }
    }

    #[test]
    fn records_operation_name() {
        let metrics = RecordingMetrics::default();
        metrics.record_duration("deploy", Instant::now(), &[("resource_id", "abc")]);
        assert_eq!(metrics.records.lock().unwrap().as_slice(), &["deploy".to_string()]);
    }
}
