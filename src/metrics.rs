//! Prometheus metrics for the generation protocol and gossip transport.
//!
//! Metrics cover:
//! - Outbound gossip calls (count and latency per operation and outcome)
//! - Inbound gossip requests per route and HTTP status
//! - Generation transitions and compare-and-swap conflicts
//! - Leader-side transition attempts
//! - Live peer connections
//!
//! All metrics are registered to a custom registry with the "ringbroker" prefix.
//! Registration errors are logged and an unregistered fallback metric is used
//! instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for ringbroker metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("ringbroker".to_string()), None).unwrap_or_else(|_| Registry::new())
});

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Gossip transport
// =============================================================================

define_counter_vec!(
    GOSSIP_REQUESTS,
    "gossip_requests_total",
    "Outbound gossip calls by operation and outcome",
    ["operation", "outcome"]
);
define_histogram_vec!(
    GOSSIP_REQUEST_DURATION,
    "gossip_request_duration_seconds",
    "Outbound gossip call duration in seconds",
    ["operation"],
    [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
);
define_counter_vec!(
    INBOUND_REQUESTS,
    "inbound_requests_total",
    "Inbound peer requests by route and HTTP status",
    ["route", "status"]
);
define_gauge!(
    PEER_CONNECTIONS,
    "peer_connections",
    "Number of established peer connections"
);

// =============================================================================
// Generations
// =============================================================================

define_counter_vec!(
    GENERATION_TRANSITIONS,
    "generation_transitions_total",
    "Generation records written by resulting status",
    ["status"]
);
define_counter!(
    CAS_CONFLICTS,
    "cas_conflicts_total",
    "Generation writes refused by a transaction mismatch"
);
define_counter_vec!(
    TRANSITION_ATTEMPTS,
    "transition_attempts_total",
    "Leader-side transition attempts by outcome",
    ["outcome"]
);
define_counter!(
    PROPOSALS_EXPIRED,
    "proposals_expired_total",
    "Stale proposals cancelled by the sweep"
);

// =============================================================================
// Retries
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);

/// Record the outcome of an outbound gossip call.
pub fn record_gossip_call(operation: &str, outcome: &str, duration_secs: f64) {
    GOSSIP_REQUESTS
        .with_label_values(&[operation, outcome])
        .inc();
    GOSSIP_REQUEST_DURATION
        .with_label_values(&[operation])
        .observe(duration_secs);
}

/// Record an inbound request served by the gossip server.
pub fn record_inbound(route: &str, status: u16) {
    INBOUND_REQUESTS
        .with_label_values(&[route, &status.to_string()])
        .inc();
}

pub fn record_transition(status: &str) {
    GENERATION_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn record_attempt(outcome: &str) {
    TRANSITION_ATTEMPTS.with_label_values(&[outcome]).inc();
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_recorded_metrics() {
        record_transition("committed");
        record_gossip_call("get_generations", "ok", 0.002);
        CAS_CONFLICTS.inc();

        let text = encode_metrics().unwrap();
        assert!(text.contains("ringbroker_generation_transitions_total"));
        assert!(text.contains("ringbroker_gossip_requests_total"));
        assert!(text.contains("ringbroker_cas_conflicts_total"));
    }
}
