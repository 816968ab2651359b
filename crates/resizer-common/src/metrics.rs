//! Resize metrics
//!
//! Instruments are built from an injected [`Meter`] so the entry point
//! decides where they are exported. Every recording is labeled with the
//! claim's `namespace` and `storage_class` (empty when the claim names none).
//!
//! - `resize_controller_pvc_resize_total`: claims resized
//! - `resize_controller_pvc_resize_failed`: failed resize attempts
//! - `resize_controller_pvc_resize_duration_seconds`: latency of a full resize
//!   (mark in progress, backend call, volume and claim updates)

use std::time::Instant;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Prefix shared by all resize metric names
pub const METRIC_SUBSYSTEM: &str = "resize_controller";

/// Counters and histogram recorded around each resize attempt
#[derive(Clone, Debug)]
pub struct ResizeMetrics {
    resize_total: Counter<u64>,
    resize_failed: Counter<u64>,
    resize_duration: Histogram<f64>,
}

impl ResizeMetrics {
    /// Build the instruments on `meter`
    pub fn new(meter: &Meter) -> Self {
        Self {
            resize_total: meter
                .u64_counter(format!("{METRIC_SUBSYSTEM}_pvc_resize_total"))
                .with_description("Total number of persistent volume claims resized")
                .build(),
            resize_failed: meter
                .u64_counter(format!("{METRIC_SUBSYSTEM}_pvc_resize_failed"))
                .with_description("Total number of persistent volume claim resize failed attempts")
                .build(),
            resize_duration: meter
                .f64_histogram(format!("{METRIC_SUBSYSTEM}_pvc_resize_duration_seconds"))
                .with_description("Latency in seconds to resize persistent volume claims")
                .build(),
        }
    }

    /// Start timing a resize attempt for a claim
    pub fn start(&self, namespace: &str, storage_class: &str) -> ResizeTimer<'_> {
        ResizeTimer {
            metrics: self,
            labels: labels(namespace, storage_class),
            start: Instant::now(),
        }
    }
}

/// Timer for one resize attempt
///
/// Dropping the timer without calling [`success`](Self::success) or
/// [`failure`](Self::failure) records nothing.
pub struct ResizeTimer<'a> {
    metrics: &'a ResizeMetrics,
    labels: [KeyValue; 2],
    start: Instant,
}

impl ResizeTimer<'_> {
    /// Record a completed resize and its latency
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metrics.resize_total.add(1, &self.labels);
        self.metrics.resize_duration.record(duration, &self.labels);
    }

    /// Record a failed resize
    pub fn failure(self) {
        self.metrics.resize_failed.add(1, &self.labels);
    }
}

fn labels(namespace: &str, storage_class: &str) -> [KeyValue; 2] {
    [
        KeyValue::new("namespace", namespace.to_string()),
        KeyValue::new("storage_class", storage_class.to_string()),
    ]
}
