//! Metrics for monitoring the router.
//!
//! - Counters for calls, retries (by reason) and discovery sweeps
//! - Gauges for topology size and cache fill
//! - Histograms for call latency, split by call kind
//!
//! # Example
//!
//! ```rust,ignore
//! let snapshot = router.metrics().snapshot();
//! println!("retries on migration: {}", snapshot.retries_by_reason["bucket_migrate"]);
//! ```

mod counters;
mod histograms;

pub use counters::{Counter, Gauge, LabeledCounter};
pub use histograms::{Histogram, HistogramSnapshot, CALL_LATENCY_BUCKETS};

use std::collections::HashMap;
use std::time::Duration;

/// Metrics collected by one router instance.
#[derive(Debug)]
pub struct RouterMetrics {
    /// Single-bucket calls that succeeded.
    pub call_success: Counter,
    /// Single-bucket calls that failed or timed out.
    pub call_failures: Counter,
    /// Single-bucket call latency.
    pub call_latency: Histogram,

    /// Broadcast calls that succeeded.
    pub map_call_success: Counter,
    /// Broadcast calls that failed.
    pub map_call_failures: Counter,
    /// Broadcast call latency.
    pub map_call_latency: Histogram,

    /// Retries inside the call loop by reason.
    pub retries: LabeledCounter<1>,

    /// Discovery sweeps by outcome (`ok`/`error`).
    pub discovery_sweeps: LabeledCounter<1>,
    /// Per-replicaset discovery failures.
    pub discovery_failures: Counter,

    /// Replicasets in the topology.
    pub replicasets: Gauge,
    /// Buckets with a known owner.
    pub known_buckets: Gauge,
}

impl RouterMetrics {
    pub fn new() -> Self {
        Self {
            call_success: Counter::new("router_call_success_total", "Successful bucket calls"),
            call_failures: Counter::new("router_call_failures_total", "Failed bucket calls"),
            call_latency: Histogram::with_buckets(
                "router_call_duration_seconds",
                "Bucket call latency",
                CALL_LATENCY_BUCKETS.to_vec(),
            ),
            map_call_success: Counter::new(
                "router_map_call_success_total",
                "Successful map_callrw operations",
            ),
            map_call_failures: Counter::new(
                "router_map_call_failures_total",
                "Failed map_callrw operations",
            ),
            map_call_latency: Histogram::with_buckets(
                "router_map_call_duration_seconds",
                "map_callrw latency",
                CALL_LATENCY_BUCKETS.to_vec(),
            ),
            retries: LabeledCounter::new("router_retries_total", "Call retries", ["reason"]),
            discovery_sweeps: LabeledCounter::new(
                "router_discovery_sweeps_total",
                "Discovery sweeps",
                ["status"],
            ),
            discovery_failures: Counter::new(
                "router_discovery_replicaset_failures_total",
                "Replicasets that failed to answer a discovery sweep",
            ),
            replicasets: Gauge::new("router_replicasets", "Replicasets in topology"),
            known_buckets: Gauge::new("router_known_buckets", "Buckets with a known owner"),
        }
    }

    /// Record the end of a call.
    pub fn record_request(&self, duration: Duration, ok: bool, map_reduce: bool) {
        let (success, failures, latency) = if map_reduce {
            (&self.map_call_success, &self.map_call_failures, &self.map_call_latency)
        } else {
            (&self.call_success, &self.call_failures, &self.call_latency)
        };

        if ok {
            success.inc();
        } else {
            failures.inc();
        }
        latency.observe_duration(duration);
    }

    /// Record a retry inside the call loop.
    pub fn record_retry(&self, reason: &str) {
        self.retries.inc([reason]);
    }

    /// Record the outcome of a discovery sweep.
    pub fn record_discovery(&self, ok: bool, failed_replicasets: usize) {
        self.discovery_sweeps
            .inc([if ok { "ok" } else { "error" }]);
        self.discovery_failures.inc_by(failed_replicasets as u64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            call_success: self.call_success.get(),
            call_failures: self.call_failures.get(),
            map_call_success: self.map_call_success.get(),
            map_call_failures: self.map_call_failures.get(),
            retries_by_reason: self
                .retries
                .get_all()
                .into_iter()
                .map(|([reason], n)| (reason, n))
                .collect(),
            discovery_failures: self.discovery_failures.get(),
            replicasets: self.replicasets.get(),
            known_buckets: self.known_buckets.get(),
            call_latency: self.call_latency.snapshot(),
            map_call_latency: self.map_call_latency.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.call_success,
            &self.call_failures,
            &self.map_call_success,
            &self.map_call_failures,
            &self.discovery_failures,
        ] {
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            ));
        }

        for gauge in [&self.replicasets, &self.known_buckets] {
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
                gauge.help(),
                gauge.get(),
                name = gauge.name(),
            ));
        }

        for labeled in [&self.retries, &self.discovery_sweeps] {
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} counter\n",
                labeled.help(),
                name = labeled.name(),
            ));
            let [label] = labeled.label_names();
            for ([value], n) in labeled.get_all() {
                output.push_str(&format!("{}{{{}=\"{}\"}} {}\n", labeled.name(), label, value, n));
            }
        }

        for hist in [&self.call_latency, &self.map_call_latency] {
            let snap = hist.snapshot();
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} histogram\n",
                hist.help(),
                name = hist.name(),
            ));
            for (upper, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                output.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", hist.name(), upper, count));
            }
            output.push_str(&format!(
                "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {}\n{name}_count {count}\n",
                snap.sum,
                name = hist.name(),
                count = snap.count,
            ));
        }

        output
    }
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the router metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub call_success: u64,
    pub call_failures: u64,
    pub map_call_success: u64,
    pub map_call_failures: u64,
    pub retries_by_reason: HashMap<String, u64>,
    pub discovery_failures: u64,
    pub replicasets: i64,
    pub known_buckets: i64,
    pub call_latency: HistogramSnapshot,
    pub map_call_latency: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Retries recorded for `reason`.
    pub fn retries(&self, reason: &str) -> u64 {
        self.retries_by_reason.get(reason).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request_splits_call_kinds() {
        let metrics = RouterMetrics::new();

        metrics.record_request(Duration::from_millis(3), true, false);
        metrics.record_request(Duration::from_millis(600), false, false);
        metrics.record_request(Duration::from_millis(40), true, true);

        let snap = metrics.snapshot();
        assert_eq!(snap.call_success, 1);
        assert_eq!(snap.call_failures, 1);
        assert_eq!(snap.map_call_success, 1);
        assert_eq!(snap.map_call_failures, 0);
        assert_eq!(snap.call_latency.count, 2);
        assert_eq!(snap.map_call_latency.count, 1);
    }

    #[test]
    fn test_retries_by_reason() {
        let metrics = RouterMetrics::new();
        metrics.record_retry("bucket_migrate");
        metrics.record_retry("bucket_migrate");
        metrics.record_retry("bucket_resolve_error");

        let snap = metrics.snapshot();
        assert_eq!(snap.retries("bucket_migrate"), 2);
        assert_eq!(snap.retries("bucket_resolve_error"), 1);
        assert_eq!(snap.retries("future_get_error"), 0);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = RouterMetrics::new();
        metrics.record_request(Duration::from_millis(1), true, false);
        metrics.record_retry("bucket_migrate");
        metrics.record_discovery(false, 2);
        metrics.replicasets.set(2);

        let output = metrics.to_prometheus();
        assert!(output.contains("router_call_success_total 1"));
        assert!(output.contains("router_retries_total{reason=\"bucket_migrate\"} 1"));
        assert!(output.contains("router_discovery_sweeps_total{status=\"error\"} 1"));
        assert!(output.contains("router_discovery_replicaset_failures_total 2"));
        assert!(output.contains("router_replicasets 2"));
        assert!(output.contains("router_call_duration_seconds_count 1"));
    }
}
