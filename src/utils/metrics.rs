use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

/// Prometheus registry for the desk
///
/// Each client owns its own registry so tests and multiple clients never
/// collide on metric names.
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    request_latency: HistogramVec,
    orders: IntCounterVec,
    open_positions: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("desk".to_string()), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "REST requests by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        let request_latency = HistogramVec::new(
            HistogramOpts::new("request_latency_seconds", "REST round-trip latency")
                .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["endpoint"],
        )?;
        let orders = IntCounterVec::new(
            Opts::new("orders_total", "Orders accepted by the exchange"),
            &["side", "kind"],
        )?;
        let open_positions = IntGauge::new("open_positions", "Open positions after last sync")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_latency.clone()))?;
        registry.register(Box::new(orders.clone()))?;
        registry.register(Box::new(open_positions.clone()))?;

        Ok(Self {
            registry,
            requests,
            request_latency,
            orders,
            open_positions,
        })
    }

    pub fn observe_request(&self, endpoint: &str, ok: bool, elapsed: Duration) {
        let outcome = if ok { "ok" } else { "error" };
        self.requests.with_label_values(&[endpoint, outcome]).inc();
        self.request_latency
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_order(&self, side: &str, kind: &str) {
        self.orders.with_label_values(&[side, kind]).inc();
    }

    pub fn set_open_positions(&self, count: usize) {
        self.open_positions.set(count as i64);
    }

    pub fn request_count(&self, endpoint: &str, outcome: &str) -> u64 {
        self.requests.with_label_values(&[endpoint, outcome]).get()
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_request("/fapi/v1/ping", true, Duration::from_millis(12));
        metrics.observe_request("/fapi/v1/ping", false, Duration::from_millis(40));
        metrics.record_order("BUY", "MARKET");
        metrics.set_open_positions(2);

        assert_eq!(metrics.request_count("/fapi/v1/ping", "ok"), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("desk_requests_total"));
        assert!(text.contains("desk_orders_total"));
        assert!(text.contains("desk_open_positions 2"));
    }
}
