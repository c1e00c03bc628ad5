//! In-memory HTTP metrics and their export endpoints.
//!
//! [`track_requests`] feeds a process-wide registry; `/metrics` renders it
//! in Prometheus text format and `/metrics/json` as JSON. Business counters
//! live with the services that increment them.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic event count.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Last-write-wins float, stored as raw bits to stay lock-free.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    bits: Arc<AtomicU64>,
}

impl Gauge {
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Count and sum only; enough for request rate and mean latency.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    micros: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
}

impl Histogram {
    pub fn observe(&self, seconds: f64) {
        let micros = (seconds * 1_000_000.0).max(0.0) as u64;
        self.micros.fetch_add(micros, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn sum_seconds(&self) -> f64 {
        self.micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

/// Named metric families, created on first touch.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Counter>,
    gauges: DashMap<String, Gauge>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsRegistry {
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_owned()).or_default().clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_owned()).or_default().clone()
    }

    pub fn histogram(&self, name: &str) -> Histogram {
        self.histograms.entry(name.to_owned()).or_default().clone()
    }

    pub fn export_text(&self) -> String {
        let mut out = String::new();
        for entry in self.counters.iter() {
            let _ = writeln!(out, "# TYPE {} counter", entry.key());
            let _ = writeln!(out, "{} {}", entry.key(), entry.value().get());
        }
        for entry in self.gauges.iter() {
            let _ = writeln!(out, "# TYPE {} gauge", entry.key());
            let _ = writeln!(out, "{} {}", entry.key(), entry.value().get());
        }
        for entry in self.histograms.iter() {
            let hist = entry.value();
            let _ = writeln!(out, "# TYPE {} histogram", entry.key());
            let _ = writeln!(out, "{}_count {}", entry.key(), hist.count());
            let _ = writeln!(out, "{}_sum {}", entry.key(), hist.sum_seconds());
        }
        out
    }

    pub fn export_json(&self) -> Value {
        let counters: Map<String, Value> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), json!(entry.value().get())))
            .collect();
        let gauges: Map<String, Value> = self
            .gauges
            .iter()
            .map(|entry| (entry.key().clone(), json!(entry.value().get())))
            .collect();
        let histograms: Map<String, Value> = self
            .histograms
            .iter()
            .map(|entry| {
                let hist = entry.value();
                (
                    entry.key().clone(),
                    json!({ "count": hist.count(), "sum": hist.sum_seconds() }),
                )
            })
            .collect();

        json!({
            "counters": counters,
            "gauges": gauges,
            "histograms": histograms,
        })
    }
}

/// Request count, latency and status classes for the HTTP surface.
pub struct HttpMetrics {
    pub requests_total: Counter,
    pub request_duration: Histogram,
    pub status_2xx: Counter,
    pub status_4xx: Counter,
    pub status_5xx: Counter,
}

impl HttpMetrics {
    fn new() -> Self {
        Self {
            requests_total: METRICS.counter("http_requests_total"),
            request_duration: METRICS.histogram("http_request_duration_seconds"),
            status_2xx: METRICS.counter("http_status_2xx_total"),
            status_4xx: METRICS.counter("http_status_4xx_total"),
            status_5xx: METRICS.counter("http_status_5xx_total"),
        }
    }

    pub fn record(&self, latency_secs: f64, status: StatusCode) {
        self.requests_total.inc();
        self.request_duration.observe(latency_secs);

        let class = match status.as_u16() {
            200..=299 => Some(&self.status_2xx),
            400..=499 => Some(&self.status_4xx),
            500..=599 => Some(&self.status_5xx),
            _ => None,
        };
        if let Some(counter) = class {
            counter.inc();
        }
    }
}

lazy_static::lazy_static! {
    /// Process-wide registry behind the export endpoints.
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::default();
    /// HTTP families recorded by [`track_requests`].
    pub static ref HTTP_METRICS: HttpMetrics = HttpMetrics::new();
}

/// Axum middleware feeding [`HTTP_METRICS`] for every request.
pub async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let started = std::time::Instant::now();
    let response = next.run(request).await;
    HTTP_METRICS.record(started.elapsed().as_secs_f64(), response.status());
    response
}

async fn render_text() -> impl IntoResponse {
    METRICS.export_text()
}

async fn render_json() -> impl IntoResponse {
    Json(METRICS.export_json())
}

/// Export endpoints, state-agnostic so they merge into any router.
pub fn metrics_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/metrics", get(render_text))
        .route("/metrics/json", get(render_json))
}
