//! Metrics definitions for the service registry.

use shared::metrics_defs::{MetricDef, MetricType};

pub const BACKENDS_ONLINE: MetricDef = MetricDef {
    name: "registry.backends.online",
    metric_type: MetricType::Gauge,
    description: "Number of backends marked online after the last membership snapshot",
};

pub const BACKENDS_TOTAL: MetricDef = MetricDef {
    name: "registry.backends.total",
    metric_type: MetricType::Gauge,
    description: "Number of backends known to the registry, online or not",
};

pub const MEMBERSHIP_SNAPSHOTS: MetricDef = MetricDef {
    name: "registry.membership.snapshots",
    metric_type: MetricType::Counter,
    description: "Membership snapshots applied. Tagged with changed (true/false).",
};

pub const CONVERSATIONS_EVICTED: MetricDef = MetricDef {
    name: "registry.conversations.evicted",
    metric_type: MetricType::Counter,
    description: "Conversations removed from a backend. Tagged with reason (offline, admin, idle).",
};

pub const SNAPSHOT_FLUSH_DURATION: MetricDef = MetricDef {
    name: "registry.snapshot.flush.duration",
    metric_type: MetricType::Histogram,
    description: "Time to write the registry snapshot in seconds. Tagged with status.",
};

pub const ALL_METRICS: &[MetricDef] = &[
    BACKENDS_ONLINE,
    BACKENDS_TOTAL,
    MEMBERSHIP_SNAPSHOTS,
    CONVERSATIONS_EVICTED,
    SNAPSHOT_FLUSH_DURATION,
];
