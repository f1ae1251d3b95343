//! Metrics definitions for the service registry.

use shared::metrics_defs::{MetricDef, MetricType};

pub const INSTANCE_HEALTHY: MetricDef = MetricDef {
    name: "registry.instance_healthy",
    metric_type: MetricType::Gauge,
    description: "1 when an instance is selectable, 0 when excluded. Tagged with service, instance.",
};

pub const PROBE_FAILURES: MetricDef = MetricDef {
    name: "registry.probe_failures",
    metric_type: MetricType::Counter,
    description: "Health probes that failed. Tagged with service, instance.",
};

pub const SELECTION_FAILURES: MetricDef = MetricDef {
    name: "registry.selection_failures",
    metric_type: MetricType::Counter,
    description: "Selections that found no healthy instance. Tagged with service.",
};

pub const ALL_METRICS: &[MetricDef] = &[INSTANCE_HEALTHY, PROBE_FAILURES, SELECTION_FAILURES];
