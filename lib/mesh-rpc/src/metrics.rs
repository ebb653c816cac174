//! Prometheus metrics for the RPC transport

use anyhow::Result;
use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics collector for RPC traffic
#[derive(Clone)]
pub struct RpcMetrics {
    /// Fire-and-forget messages sent, by operation
    pub messages_published_total: CounterVec,
    /// Inbound messages handed to a handler, by subscription kind
    pub messages_received_total: CounterVec,
    /// Requests issued, by operation
    pub requests_total: CounterVec,
    /// Requests that got no reply in time
    pub request_timeouts_total: Counter,
    /// Handler errors and panics
    pub handler_failures_total: Counter,
    /// Operations refused because the broker applied backpressure
    pub blocked_rejections_total: Counter,
    /// Queue broker connections rebuilt
    pub reconnects_total: Counter,
    /// Correlated requests waiting for a reply
    pub pending_replies: IntGauge,
    /// Request round-trip latency in seconds
    pub request_duration_seconds: HistogramVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl RpcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let messages_published_total = CounterVec::new(
            Opts::new("rpc_messages_published_total", "Total fire-and-forget messages sent"),
            &["operation"],
        )?;

        let messages_received_total = CounterVec::new(
            Opts::new("rpc_messages_received_total", "Total inbound messages dispatched"),
            &["subscription"],
        )?;

        let requests_total = CounterVec::new(
            Opts::new("rpc_requests_total", "Total requests issued"),
            &["operation"],
        )?;

        let request_timeouts_total = Counter::new("rpc_request_timeouts_total", "Total requests timed out")?;

        let handler_failures_total =
            Counter::new("rpc_handler_failures_total", "Total handler errors and panics")?;

        let blocked_rejections_total = Counter::new(
            "rpc_blocked_rejections_total",
            "Total operations refused while the broker was blocked",
        )?;

        let reconnects_total = Counter::new("rpc_reconnects_total", "Total broker reconnects")?;

        let pending_replies = IntGauge::new("rpc_pending_replies", "Correlated requests awaiting a reply")?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("rpc_request_duration_seconds", "Request latency in seconds"),
            &["operation"],
        )?;

        registry.register(Box::new(messages_published_total.clone()))?;
        registry.register(Box::new(messages_received_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_timeouts_total.clone()))?;
        registry.register(Box::new(handler_failures_total.clone()))?;
        registry.register(Box::new(blocked_rejections_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(pending_replies.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        Ok(Self {
            messages_published_total,
            messages_received_total,
            requests_total,
            request_timeouts_total,
            handler_failures_total,
            blocked_rejections_total,
            reconnects_total,
            pending_replies,
            request_duration_seconds,
            registry,
        })
    }

    pub fn record_publish(&self, operation: &str) {
        self.messages_published_total.with_label_values(&[operation]).inc();
    }

    pub fn record_received(&self, subscription: &str) {
        self.messages_received_total.with_label_values(&[subscription]).inc();
    }

    pub fn record_request(&self, operation: &str, elapsed: Duration) {
        self.requests_total.with_label_values(&[operation]).inc();
        self.request_duration_seconds
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        let metrics = RpcMetrics::new().unwrap();
        metrics.record_publish("publish");
        metrics.record_request("request", Duration::from_millis(12));
        metrics.request_timeouts_total.inc();

        let output = metrics.gather().unwrap();
        assert!(output.contains("rpc_messages_published_total"));
        assert!(output.contains("rpc_request_duration_seconds"));
        assert!(output.contains("rpc_request_timeouts_total 1"));
    }

    #[test]
    fn test_pending_gauge() {
        let metrics = RpcMetrics::new().unwrap();
        metrics.pending_replies.inc();
        metrics.pending_replies.inc();
        metrics.pending_replies.dec();
        assert_eq!(metrics.pending_replies.get(), 1);
    }

    #[test]
    fn test_independent_registries() {
        // Each collector owns its registry so several transports can coexist
        let a = RpcMetrics::new().unwrap();
        let b = RpcMetrics::new().unwrap();
        a.reconnects_total.inc();
        assert_eq!(b.reconnects_total.get(), 0.0);
    }
}
