//! Metrics collection for EngineLink
//!
//! This module provides Prometheus metrics for observability.
//! Counters are process-wide; each process (front-end or engine) exposes
//! its own view.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for EngineLink
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub dispatch: DispatchMetrics,
    pub engine: EngineMetrics,
    pub shm: ShmMetrics,
}

/// Dispatch front-end metrics
#[derive(Debug, Clone)]
pub struct DispatchMetrics {
    /// Total number of predict requests
    pub requests_total: IntCounter,

    /// Total number of successful requests
    pub requests_success: IntCounter,

    /// Total number of failed requests
    pub requests_failed: IntCounter,

    /// Requests that hit the reply deadline
    pub requests_timed_out: IntCounter,

    /// End-to-end predict duration
    pub request_duration: Histogram,

    /// Current predict exchanges in progress
    pub active_requests: IntGauge,
}

/// Engine process metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Predict requests accepted for inference
    pub requests_accepted: IntCounter,

    /// Requests rejected before a slot was taken
    pub requests_rejected: IntCounter,

    /// Inferences that completed with a backend error
    pub inference_failures: IntCounter,

    /// Inference duration from submission to completion
    pub inference_duration: Histogram,

    /// Inference slots currently in use
    pub inflight: IntGauge,

    /// Network reshapes performed
    pub reshapes: IntCounter,

    /// Replies that could not be delivered
    pub reply_failures: IntCounter,
}

/// Shared-memory metrics
#[derive(Debug, Clone)]
pub struct ShmMetrics {
    /// Segments created by this process
    pub buffers_created: IntCounter,

    /// Segments unlinked by this process
    pub buffers_unlinked: IntCounter,

    /// Failed unlinks (double unlink, permission)
    pub unlink_errors: IntCounter,

    /// Bytes allocated in created segments
    pub bytes_allocated: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let metric = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("counter registered once");
    metric
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let metric = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("gauge registered once");
    metric
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let metric = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(metric.clone()))
        .expect("histogram registered once");
    metric
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Registry::new();
        let latency = vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

        let dispatch = DispatchMetrics {
            requests_total: counter(
                &registry,
                "dispatch_requests_total",
                "Total number of predict requests",
            ),
            requests_success: counter(
                &registry,
                "dispatch_requests_success_total",
                "Total number of successful predict requests",
            ),
            requests_failed: counter(
                &registry,
                "dispatch_requests_failed_total",
                "Total number of failed predict requests",
            ),
            requests_timed_out: counter(
                &registry,
                "dispatch_requests_timed_out_total",
                "Predict requests that exceeded the reply deadline",
            ),
            request_duration: histogram(
                &registry,
                "dispatch_request_duration_seconds",
                "Predict request duration in seconds",
                latency.clone(),
            ),
            active_requests: gauge(
                &registry,
                "dispatch_active_requests",
                "Current number of predict exchanges in progress",
            ),
        };

        let engine = EngineMetrics {
            requests_accepted: counter(
                &registry,
                "engine_requests_accepted_total",
                "Predict requests submitted for inference",
            ),
            requests_rejected: counter(
                &registry,
                "engine_requests_rejected_total",
                "Predict requests rejected before inference",
            ),
            inference_failures: counter(
                &registry,
                "engine_inference_failures_total",
                "Inferences completed with a backend error",
            ),
            inference_duration: histogram(
                &registry,
                "engine_inference_duration_seconds",
                "Inference duration in seconds",
                latency,
            ),
            inflight: gauge(
                &registry,
                "engine_inflight_requests",
                "Inference slots currently in use",
            ),
            reshapes: counter(&registry, "engine_reshapes_total", "Network reshapes performed"),
            reply_failures: counter(
                &registry,
                "engine_reply_failures_total",
                "Replies that could not be delivered",
            ),
        };

        let shm = ShmMetrics {
            buffers_created: counter(
                &registry,
                "shm_buffers_created_total",
                "Shared-memory segments created",
            ),
            buffers_unlinked: counter(
                &registry,
                "shm_buffers_unlinked_total",
                "Shared-memory segments unlinked",
            ),
            unlink_errors: counter(
                &registry,
                "shm_unlink_errors_total",
                "Failed shared-memory unlinks",
            ),
            bytes_allocated: counter(
                &registry,
                "shm_bytes_allocated_total",
                "Bytes allocated in shared-memory segments",
            ),
        };

        MetricsRegistry {
            registry: Arc::new(registry),
            dispatch,
            engine,
            shm,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        metrics.dispatch.requests_total.inc();
        metrics.engine.inflight.set(3);
        metrics.shm.bytes_allocated.inc_by(1024);

        let output = metrics.gather();
        assert!(output.contains("dispatch_requests_total 1"));
        assert!(output.contains("engine_inflight_requests 3"));
        assert!(output.contains("shm_bytes_allocated_total 1024"));
    }
}
