//! Metrics definitions for admission control.

use shared::metrics_defs::{MetricDef, MetricType};

pub const RATE_LIMIT_DECISIONS: MetricDef = MetricDef {
    name: "rate_limit.decisions",
    metric_type: MetricType::Counter,
    description: "Rate limit checks. Tagged with tier, outcome.",
};

pub const COUNTER_STORE_FAILURES: MetricDef = MetricDef {
    name: "counter_store.failures",
    metric_type: MetricType::Counter,
    description: "Counter store operations that failed. Tagged with component.",
};

pub const CIRCUIT_TRANSITIONS: MetricDef = MetricDef {
    name: "circuit.transitions",
    metric_type: MetricType::Counter,
    description: "Circuit breaker state transitions. Tagged with service, from, to.",
};

pub const CIRCUIT_REJECTIONS: MetricDef = MetricDef {
    name: "circuit.rejections",
    metric_type: MetricType::Counter,
    description: "Calls rejected because the circuit was open. Tagged with service.",
};

pub const UPSTREAM_OUTCOMES: MetricDef = MetricDef {
    name: "circuit.upstream_outcomes",
    metric_type: MetricType::Counter,
    description: "Recorded upstream call outcomes. Tagged with service, outcome.",
};

pub const UPSTREAM_LATENCY: MetricDef = MetricDef {
    name: "circuit.upstream_latency",
    metric_type: MetricType::Histogram,
    description: "Latency of recorded upstream calls in seconds. Tagged with service, outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    RATE_LIMIT_DECISIONS,
    COUNTER_STORE_FAILURES,
    CIRCUIT_TRANSITIONS,
    CIRCUIT_REJECTIONS,
    UPSTREAM_OUTCOMES,
    UPSTREAM_LATENCY,
];
