use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    backend_attempts_total: IntCounterVec,
}

pub struct InflightGuard {
    gauge: IntGauge,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!(
                "chatmux_http_requests_total",
                "Total HTTP requests processed by the router"
            ),
            &["path", "method", "status", "stream"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "chatmux_http_request_duration_seconds",
                "HTTP request latency in seconds",
            ),
            &["path", "method", "stream"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new(
            "chatmux_inflight_requests",
            "Current in-flight chat requests",
        )
        .expect("valid inflight_requests metric");

        let backend_attempts_total = IntCounterVec::new(
            opts!(
                "chatmux_backend_attempts_total",
                "Backend attempts by outcome"
            ),
            &["backend", "outcome"],
        )
        .expect("valid backend_attempts_total metric");

        registry
            .register(Box::new(request_total.clone()))
            .expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(backend_attempts_total.clone()))
            .expect("register backend_attempts_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            backend_attempts_total,
        }
    }

    /// Counts one in-flight request until the guard is dropped. The guard is
    /// owned so it can move into a streaming response body.
    pub fn inflight_guard(&self) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            gauge: self.inflight_requests.clone(),
        }
    }

    pub fn inflight(&self) -> i64 {
        self.inflight_requests.get()
    }

    pub fn observe_request(
        &self,
        path: &str,
        method: &str,
        stream: bool,
        status: u16,
        duration: Duration,
    ) {
        let stream_label = if stream { "true" } else { "false" };
        let status_label = status.to_string();
        self.request_total
            .with_label_values(&[path, method, &status_label, stream_label])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[path, method, stream_label])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_backend_attempt(&self, backend: &str, outcome: &str) {
        self.backend_attempts_total
            .with_label_values(&[backend, outcome])
            .inc();
    }

    pub fn backend_attempts(&self, backend: &str, outcome: &str) -> u64 {
        self.backend_attempts_total
            .with_label_values(&[backend, outcome])
            .get()
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_attempts_are_labelled_by_outcome() {
        let metrics = AppMetrics::new();
        metrics.observe_backend_attempt("primary", "transport");
        metrics.observe_backend_attempt("primary", "transport");
        metrics.observe_backend_attempt("secondary", "success");

        assert_eq!(metrics.backend_attempts("primary", "transport"), 2);
        assert_eq!(metrics.backend_attempts("secondary", "success"), 1);
        let rendered = metrics.render().expect("render");
        assert!(rendered.contains("chatmux_backend_attempts_total"));
    }

    #[test]
    fn inflight_guard_tracks_open_requests() {
        let metrics = AppMetrics::new();
        let guard = metrics.inflight_guard();
        assert_eq!(metrics.inflight(), 1);
        drop(guard);
        assert_eq!(metrics.inflight(), 0);
    }
}
