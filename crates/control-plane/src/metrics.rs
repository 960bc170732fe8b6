use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{HeaderValue, Request, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use portyo_common::entities::custom_domains::DomainStatus;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder,
    register_histogram, register_histogram_vec, register_int_counter_vec,
};
use std::sync::OnceLock;
use std::time::Instant;

const METRIC_PREFIX: &str = "portyo_domains";

/// Metrics 注册结果，可能包含注册错误
type MetricRegistration<T> = Result<T, prometheus::Error>;

fn http_requests_total() -> &'static MetricRegistration<IntCounterVec> {
    static METRIC: OnceLock<MetricRegistration<IntCounterVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_int_counter_vec!(
            Opts::new(
                format!("{METRIC_PREFIX}_http_requests_total"),
                "Custom domain API requests"
            ),
            &["method", "path", "status"]
        )
    })
}

fn http_request_duration_seconds() -> &'static MetricRegistration<HistogramVec> {
    static METRIC: OnceLock<MetricRegistration<HistogramVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        let opts = HistogramOpts::new(
            format!("{METRIC_PREFIX}_http_request_duration_seconds"),
            "Custom domain API request latency in seconds",
        );
        register_histogram_vec!(opts, &["method", "path"])
    })
}

fn stage_checks_total() -> &'static MetricRegistration<IntCounterVec> {
    static METRIC: OnceLock<MetricRegistration<IntCounterVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_int_counter_vec!(
            Opts::new(
                format!("{METRIC_PREFIX}_stage_checks_total"),
                "Lifecycle stage runs by outcome"
            ),
            &["stage", "outcome"]
        )
    })
}

fn status_transitions_total() -> &'static MetricRegistration<IntCounterVec> {
    static METRIC: OnceLock<MetricRegistration<IntCounterVec>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_int_counter_vec!(
            Opts::new(
                format!("{METRIC_PREFIX}_status_transitions_total"),
                "Persisted status transitions"
            ),
            &["from", "to"]
        )
    })
}

fn tick_duration_seconds() -> &'static MetricRegistration<Histogram> {
    static METRIC: OnceLock<MetricRegistration<Histogram>> = OnceLock::new();
    METRIC.get_or_init(|| {
        register_histogram!(
            format!("{METRIC_PREFIX}_tick_duration_seconds"),
            "Controller tick duration in seconds"
        )
    })
}

pub fn inc_stage_check(stage: &str, outcome: &str) {
    if let Ok(counter) = stage_checks_total() {
        counter.with_label_values(&[stage, outcome]).inc();
    }
}

pub fn inc_transition(from: DomainStatus, to: DomainStatus) {
    if let Ok(counter) = status_transitions_total() {
        counter
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }
}

pub fn observe_tick(seconds: f64) {
    if let Ok(histogram) = tick_duration_seconds() {
        histogram.observe(seconds);
    }
}

pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "<unmatched>".to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let elapsed = start.elapsed().as_secs_f64();

    let status = response.status().as_u16().to_string();

    if let Ok(counter) = http_requests_total() {
        counter.with_label_values(&[&method, &path, &status]).inc();
    }
    if let Ok(histogram) = http_request_duration_seconds() {
        histogram
            .with_label_values(&[&method, &path])
            .observe(elapsed);
    }

    response
}

pub fn render_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => {
            let mut resp = Response::new(Body::from(buffer));
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type())
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain; version=0.0.4")),
            );
            resp
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Metrics encoding failed",
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() {
        inc_stage_check("dns", "matched");
        inc_transition(DomainStatus::Pending, DomainStatus::VerifyingDns);
        observe_tick(0.25);

        let families = prometheus::gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"portyo_domains_stage_checks_total"));
        assert!(names.contains(&"portyo_domains_status_transitions_total"));
        assert!(names.contains(&"portyo_domains_tick_duration_seconds"));
    }
}
