use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Time until the backend response headers are returned, in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const ROUTING_DECISIONS: MetricDef = MetricDef {
    name: "routing.decisions",
    metric_type: MetricType::Counter,
    description: "Backends chosen for requests. Tagged with reason (override, affinity, least_loaded).",
};

pub const ROUTING_FAILURES: MetricDef = MetricDef {
    name: "routing.failures",
    metric_type: MetricType::Counter,
    description: "Requests rejected because no backend was online",
};

pub const UPSTREAM_ERRORS: MetricDef = MetricDef {
    name: "upstream.errors",
    metric_type: MetricType::Counter,
    description: "Requests that could not be forwarded to the chosen backend",
};

pub const ASSIGNMENTS: MetricDef = MetricDef {
    name: "affinity.assignments",
    metric_type: MetricType::Counter,
    description: "Affinity updates learned from backend responses. Tagged with outcome.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    ROUTING_DECISIONS,
    ROUTING_FAILURES,
    UPSTREAM_ERRORS,
    ASSIGNMENTS,
];
