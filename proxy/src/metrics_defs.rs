//! Metrics definitions for the request path and the admin surface.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "gateway.request_duration",
    metric_type: MetricType::Histogram,
    description: "End-to-end request latency in seconds. Tagged with service, status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "gateway.requests_inflight",
    metric_type: MetricType::Gauge,
    description: "Requests currently inside the pipeline.",
};

pub const SETTINGS_RELOADS: MetricDef = MetricDef {
    name: "gateway.settings_reloads",
    metric_type: MetricType::Counter,
    description: "Admin-triggered settings reloads. Tagged with outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[REQUEST_DURATION, REQUESTS_INFLIGHT, SETTINGS_RELOADS];

/// Register every metric's description with the installed recorder so the
/// Prometheus exposition carries HELP lines.
pub fn describe_all() {
    let tables = [
        control::metrics_defs::ALL_METRICS,
        registry::metrics_defs::ALL_METRICS,
        ALL_METRICS,
    ];
    for def in tables.into_iter().flatten() {
        match def.metric_type {
            MetricType::Counter => metrics::describe_counter!(def.name, def.description),
            MetricType::Gauge => metrics::describe_gauge!(def.name, def.description),
            MetricType::Histogram => metrics::describe_histogram!(def.name, def.description),
        }
    }
}
