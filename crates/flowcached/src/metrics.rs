//! Prometheus metrics for flowcached.
//!
//! Every controller owns one [`MetricsCollector`] with its own registry. The
//! dispatcher, the retry policy and the listeners share clones of it.

use prometheus::{Counter, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

#[derive(Clone)]
pub struct MetricsCollector {
    // Dispatcher
    pub packet_ins_total: Counter,
    pub idle_timeouts_total: Counter,
    pub flows_installed_total: Counter,
    pub flows_replaced_total: Counter,
    pub packet_ins_ignored_total: Counter,
    pub flows_evicted_total: Counter,
    pub unknown_evictions_total: Counter,
    pub notifications_dropped_total: Counter,

    // Control channel
    pub channel_retries_total: Counter,
    pub listener_errors_total: Counter,

    pub cached_flows: Gauge,
    pub queue_latency_seconds: Histogram,

    pub registry: Arc<Registry>,
}

impl fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsCollector").finish_non_exhaustive()
    }
}

impl MetricsCollector {
    /// Creates the collector and registers every metric in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let packet_ins_total = counter(
            &registry,
            "flowcached_packet_ins_total",
            "Total number of packet-in notifications dispatched",
        )?;
        let idle_timeouts_total = counter(
            &registry,
            "flowcached_idle_timeouts_total",
            "Total number of idle-timeout notifications dispatched",
        )?;
        let flows_installed_total = counter(
            &registry,
            "flowcached_flows_installed_total",
            "Total number of flow rules installed",
        )?;
        let flows_replaced_total = counter(
            &registry,
            "flowcached_flows_replaced_total",
            "Total number of installs that overwrote a cached flow",
        )?;
        let packet_ins_ignored_total = counter(
            &registry,
            "flowcached_packet_ins_ignored_total",
            "Total number of packet-ins that needed no action",
        )?;
        let flows_evicted_total = counter(
            &registry,
            "flowcached_flows_evicted_total",
            "Total number of flow rules deleted after going idle",
        )?;
        let unknown_evictions_total = counter(
            &registry,
            "flowcached_unknown_evictions_total",
            "Total number of idle timeouts for rules not in the cache",
        )?;
        let notifications_dropped_total = counter(
            &registry,
            "flowcached_notifications_dropped_total",
            "Total number of notifications dropped on a local error",
        )?;
        let channel_retries_total = counter(
            &registry,
            "flowcached_channel_retries_total",
            "Total number of channel calls retried after a transient error",
        )?;
        let listener_errors_total = counter(
            &registry,
            "flowcached_listener_errors_total",
            "Total number of errors returned by switch event streams",
        )?;

        let cached_flows = Gauge::with_opts(Opts::new(
            "flowcached_cached_flows",
            "Current number of flows in the cache",
        ))?;
        registry.register(Box::new(cached_flows.clone()))?;

        let queue_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "flowcached_queue_latency_seconds",
                "Time a notification spent in the merge queue",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )?;
        registry.register(Box::new(queue_latency_seconds.clone()))?;

        Ok(Self {
            packet_ins_total,
            idle_timeouts_total,
            flows_installed_total,
            flows_replaced_total,
            packet_ins_ignored_total,
            flows_evicted_total,
            unknown_evictions_total,
            notifications_dropped_total,
            channel_retries_total,
            listener_errors_total,
            cached_flows,
            queue_latency_seconds,
            registry: Arc::new(registry),
        })
    }

    pub fn record_install(&self, replaced: bool) {
        self.flows_installed_total.inc();
        if replaced {
            self.flows_replaced_total.inc();
        }
    }

    pub fn record_retry(&self) {
        self.channel_retries_total.inc();
    }

    pub fn record_listener_error(&self) {
        self.listener_errors_total.inc();
    }

    pub fn set_cached_flows(&self, count: usize) {
        self.cached_flows.set(count as f64);
    }

    pub fn observe_queue_latency(&self, latency: Duration) {
        self.queue_latency_seconds.observe(latency.as_secs_f64());
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new().unwrap();
        assert_eq!(collector.packet_ins_total.get(), 0.0);
        assert_eq!(collector.flows_installed_total.get(), 0.0);
        assert_eq!(collector.cached_flows.get(), 0.0);
    }

    #[test]
    fn test_collectors_do_not_share_a_registry() {
        let first = MetricsCollector::new().unwrap();
        let second = MetricsCollector::new().unwrap();
        first.record_retry();
        assert_eq!(first.channel_retries_total.get(), 1.0);
        assert_eq!(second.channel_retries_total.get(), 0.0);
    }

    #[test]
    fn test_record_install() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_install(false);
        collector.record_install(true);
        assert_eq!(collector.flows_installed_total.get(), 2.0);
        assert_eq!(collector.flows_replaced_total.get(), 1.0);
    }

    #[test]
    fn test_encode_text() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_listener_error();
        collector.set_cached_flows(3);
        let text = collector.encode_text().unwrap();
        assert!(text.contains("flowcached_listener_errors_total 1"), "{}", text);
        assert!(text.contains("flowcached_cached_flows 3"), "{}", text);
    }
}
