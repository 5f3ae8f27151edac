//! Prometheus metrics of the discovery runtime.
//!
//! Collectors are created lazily and registered once into [`REGISTRY`]. Nothing
//! here serves HTTP: embedders scrape [`gather`] through their own endpoint.

use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    pub static ref DISCOVER_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("discover_requests", "Discover requests written to the stream"),
        &["data_type"]
    )
    .expect("metric can not be created");

    /// outcome: update | sync | error
    pub static ref DISCOVER_RESPONSES: IntCounterVec = IntCounterVec::new(
        Opts::new("discover_responses", "Discover responses by outcome"),
        &["data_type", "outcome"]
    )
    .expect("metric can not be created");

    pub static ref SERVER_SWITCHES: IntCounterVec = IntCounterVec::new(
        Opts::new("server_switches", "Discover stream switches by trigger"),
        &["reason"]
    )
    .expect("metric can not be created");

    pub static ref REQUEST_RESULTS: IntCounterVec = IntCounterVec::new(
        Opts::new("request_results", "Unary request results by server code"),
        &["request", "code"]
    )
    .expect("metric can not be created");

    pub static ref REQUEST_LATENCY_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_latency_ms", "Unary request latency in ms")
            .buckets(prometheus::exponential_buckets(1.0, 2.0, 14).expect("valid buckets")),
        &["request"]
    )
    .expect("metric can not be created");

    pub static ref TRACKED_SERVICES: IntGauge =
        IntGauge::new("tracked_services", "Service data entries with a live notify")
            .expect("metric can not be created");

    pub static ref PERSIST_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("persist_failures", "Snapshot writes that exhausted their retries"),
        &["data_type"]
    )
    .expect("metric can not be created");
}

static REGISTER: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DISCOVER_REQUESTS.clone()),
        Box::new(DISCOVER_RESPONSES.clone()),
        Box::new(SERVER_SWITCHES.clone()),
        Box::new(REQUEST_RESULTS.clone()),
        Box::new(REQUEST_LATENCY_MS.clone()),
        Box::new(TRACKED_SERVICES.clone()),
        Box::new(PERSIST_FAILURES.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            warn!("collector can not be registered: {}", e);
        }
    }
}

/// Registers the collectors into [`REGISTRY`], only the first call has effect.
pub fn init_metrics() {
    REGISTER.call_once(|| register_custom_metrics(&REGISTRY));
}

/// Text exposition of every collector in [`REGISTRY`].
pub fn gather() -> String {
    init_metrics();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("could not encode custom metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
