use crate::download_manager::{ItemState, QueueCounts};
use axum::{http::StatusCode, response::IntoResponse};
use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric name prefix for all SpotiFLAC metrics
const PREFIX: &str = "spotiflac";

lazy_static! {
    // Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Request Metrics
    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_http_requests_total"), "Total number of HTTP requests"),
        &["method", "path", "status"]
    ).expect("Failed to create http_requests_total metric");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_http_request_duration_seconds"),
            "HTTP request duration in seconds"
        )
        .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0]),
        &["method", "path"]
    ).expect("Failed to create http_request_duration_seconds metric");

    // Download Metrics
    pub static ref DOWNLOADS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_downloads_total"), "Downloads that reached a terminal state"),
        &["outcome"]
    ).expect("Failed to create downloads_total metric");

    pub static ref SERVICE_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_service_attempts_total"), "Backend fetch attempts"),
        &["service", "outcome"]
    ).expect("Failed to create service_attempts_total metric");

    pub static ref QUEUE_ITEMS: GaugeVec = GaugeVec::new(
        Opts::new(format!("{PREFIX}_queue_items"), "Items currently held in the queue"),
        &["state"]
    ).expect("Failed to create queue_items metric");

    pub static ref EVENTS_DROPPED_TOTAL: Counter = Counter::new(
        format!("{PREFIX}_events_dropped_total"),
        "Progress events dropped because a subscriber buffer was full"
    ).expect("Failed to create events_dropped_total metric");

    // Error Metrics
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_errors_total"), "Total errors by type and endpoint"),
        &["error_type", "endpoint"]
    ).expect("Failed to create errors_total metric");

    pub static ref PROCESS_MEMORY_BYTES: Gauge = Gauge::new(
        format!("{PREFIX}_process_memory_bytes"),
        "Process memory usage in bytes"
    ).expect("Failed to create process_memory_bytes metric");
}

/// Initialize all metrics and register them with the Prometheus registry
pub fn init_metrics() {
    // Register all metrics - ignore errors if already registered (for tests)
    let _ = REGISTRY.register(Box::new(HTTP_REQUESTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(DOWNLOADS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(SERVICE_ATTEMPTS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(QUEUE_ITEMS.clone()));
    let _ = REGISTRY.register(Box::new(EVENTS_DROPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ERRORS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(PROCESS_MEMORY_BYTES.clone()));

    tracing::info!("Metrics system initialized successfully");
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();

    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration.as_secs_f64());
}

/// Record an item reaching a terminal state
pub fn record_download_finished(outcome: &str) {
    DOWNLOADS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record one backend fetch attempt
pub fn record_service_attempt(service: &str, outcome: &str) {
    SERVICE_ATTEMPTS_TOTAL
        .with_label_values(&[service, outcome])
        .inc();
}

/// Mirror the queue's per-state counts
pub fn set_queue_counts(counts: &QueueCounts) {
    for state in ItemState::ALL {
        QUEUE_ITEMS
            .with_label_values(&[state.as_str()])
            .set(counts.get(state) as f64);
    }
}

/// Record a progress event dropped for a slow subscriber
pub fn record_event_dropped() {
    EVENTS_DROPPED_TOTAL.inc();
}

/// Record an error
pub fn record_error(error_type: &str, endpoint: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, endpoint])
        .inc();
}

/// Collapse ids out of request paths so label cardinality stays bounded.
pub fn categorize_endpoint(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/api/download/queue/") {
        if rest.starts_with("cancel-all") || rest == "clear" || rest == "clear-all" {
            return path.to_string();
        }
        return "/api/download/queue/{id}/cancel".to_string();
    }
    if let Some(rest) = path.strip_prefix("/api/history/downloads/") {
        if rest == "clear" {
            return path.to_string();
        }
        return "/api/history/downloads/{id}".to_string();
    }
    path.to_string()
}

/// Update process memory usage
pub fn update_memory_usage() {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    // Parse the RSS (Resident Set Size) in kB
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<f64>() {
                            PROCESS_MEMORY_BYTES.set(kb * 1024.0);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    update_memory_usage();

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}
