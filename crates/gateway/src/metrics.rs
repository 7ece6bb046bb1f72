use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PAGEVIEWS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "crashgate_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create crashgate_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "crashgate_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create crashgate_gateway_http_request_duration_seconds"),
        )
    })
}

fn pageviews_total() -> &'static IntCounterVec {
    PAGEVIEWS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "crashgate_gateway_pageviews_total",
                    "Model API invocations by outcome.",
                ),
                &["ajax", "api", "path", "status"],
            )
            .expect("create crashgate_gateway_pageviews_total"),
        )
    })
}

fn rate_limited_total() -> &'static IntCounter {
    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "crashgate_gateway_rate_limited_total",
                "Requests rejected by the rate limiter.",
            )
            .expect("create crashgate_gateway_rate_limited_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

/// One event per terminating model invocation, tagged the way the
/// dashboards slice traffic: ajax vs direct, API-shaped, normalized path,
/// outcome status.
pub fn observe_pageview(ajax: bool, api: bool, path: &str, status: u16) {
    let ajax = if ajax { "true" } else { "false" };
    let api = if api { "true" } else { "false" };
    let status_str = status.to_string();
    pageviews_total()
        .with_label_values(&[ajax, api, path, status_str.as_str()])
        .inc();
}

pub fn inc_rate_limited() {
    rate_limited_total().inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = rate_limited_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
