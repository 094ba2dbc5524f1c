//! Prometheus metrics for the comparison pipeline

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::FailureKind;

/// Cumulative latency histogram (milliseconds)
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    counts: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        let buckets = vec![5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn record(&self, value_ms: u64) {
        if let Some(i) = self.buckets.iter().position(|&b| value_ms <= b) {
            self.counts[i].fetch_add(1, Ordering::Relaxed);
        }
        self.sum.fetch_add(value_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Render as a Prometheus histogram in seconds
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut output = String::new();
        let mut cumulative = 0u64;

        for (i, &boundary) in self.buckets.iter().enumerate() {
            cumulative += self.counts[i].load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "{}_bucket{{le=\"{}\"}} {}",
                name,
                boundary as f64 / 1_000.0,
                cumulative
            );
        }

        let total = self.count();
        let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", name, total);
        let _ = writeln!(
            output,
            "{}_sum {}",
            name,
            self.sum.load(Ordering::Relaxed) as f64 / 1_000.0
        );
        let _ = writeln!(output, "{}_count {}", name, total);
        output
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline counters, shared by the engine, aggregator, workers and API
#[derive(Debug, Default)]
pub struct ComparisonMetrics {
    pub events_received: AtomicU64,
    pub events_rejected: AtomicU64,
    pub records_persisted: AtomicU64,
    pub duplicates: AtomicU64,
    pub persistence_retries: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub status_mismatches: AtomicU64,
    pub body_mismatches: AtomicU64,
    pub aggregations_applied: AtomicU64,
    pub aggregation_failures: AtomicU64,
    /// (shadow, failure kind) -> count
    shadow_failures: RwLock<BTreeMap<(String, FailureKind), u64>>,
    /// Received to persisted
    pub comparison_latency: LatencyHistogram,
}

impl ComparisonMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shadow_failure(&self, shadow: &str, kind: FailureKind) {
        *self
            .shadow_failures
            .write()
            .entry((shadow.to_string(), kind))
            .or_insert(0) += 1;
    }

    pub fn shadow_failures(&self, shadow: &str, kind: FailureKind) -> u64 {
        self.shadow_failures
            .read()
            .get(&(shadow.to_string(), kind))
            .copied()
            .unwrap_or(0)
    }

    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &AtomicU64); 10] = [
            ("doppelganger_events_received_total", "Events delivered to the engine", &self.events_received),
            ("doppelganger_events_rejected_total", "Events rejected by validation", &self.events_rejected),
            ("doppelganger_records_persisted_total", "Comparison records written", &self.records_persisted),
            ("doppelganger_duplicates_total", "Redelivered events resolved to an existing record", &self.duplicates),
            ("doppelganger_persistence_retries_total", "Transient storage failures retried", &self.persistence_retries),
            ("doppelganger_persistence_failures_total", "Comparisons that exhausted persistence retries", &self.persistence_failures),
            ("doppelganger_status_mismatches_total", "Records with statusMatch=false", &self.status_mismatches),
            ("doppelganger_body_mismatches_total", "Records with bodyMatch=false", &self.body_mismatches),
            ("doppelganger_aggregations_applied_total", "Records folded into daily aggregates", &self.aggregations_applied),
            ("doppelganger_aggregation_failures_total", "Aggregate updates left for reconciliation", &self.aggregation_failures),
        ];

        for (name, help, counter) in counters {
            let _ = writeln!(output, "# HELP {} {}", name, help);
            let _ = writeln!(output, "# TYPE {} counter", name);
            let _ = writeln!(output, "{} {}\n", name, counter.load(Ordering::Relaxed));
        }

        output.push_str("# HELP doppelganger_shadow_failures_total Shadow failures by kind\n");
        output.push_str("# TYPE doppelganger_shadow_failures_total counter\n");
        for ((shadow, kind), count) in self.shadow_failures.read().iter() {
            let _ = writeln!(
                output,
                "doppelganger_shadow_failures_total{{shadow=\"{}\",kind=\"{}\"}} {}",
                shadow, kind, count
            );
        }

        output.push_str("\n# HELP doppelganger_comparison_seconds Time from receipt to persistence\n");
        output.push_str("# TYPE doppelganger_comparison_seconds histogram\n");
        output.push_str(&self.comparison_latency.to_prometheus("doppelganger_comparison_seconds"));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let hist = LatencyHistogram::new();
        hist.record(3);
        hist.record(40);
        hist.record(60_000);

        let text = hist.to_prometheus("x");
        assert!(text.contains("x_bucket{le=\"0.005\"} 1"));
        assert!(text.contains("x_bucket{le=\"0.05\"} 2"));
        assert!(text.contains("x_bucket{le=\"+Inf\"} 3"));
        assert_eq!(hist.count(), 3);
    }

    #[test]
    fn test_prometheus_output() {
        let metrics = ComparisonMetrics::new();
        ComparisonMetrics::incr(&metrics.records_persisted);
        metrics.record_shadow_failure("v2", FailureKind::Timeout);
        metrics.record_shadow_failure("v2", FailureKind::Timeout);

        let text = metrics.to_prometheus();
        assert!(text.contains("doppelganger_records_persisted_total 1"));
        assert!(text.contains(
            "doppelganger_shadow_failures_total{shadow=\"v2\",kind=\"timeout\"} 2"
        ));
        assert_eq!(metrics.shadow_failures("v2", FailureKind::Timeout), 2);
    }
}
