//! Metrics definitions for the cluster registry.

use shared::metrics_defs::{MetricDef, MetricType};

pub const REGISTRY_EVENTS: MetricDef = MetricDef {
    name: "registry.events",
    metric_type: MetricType::Counter,
    description: "Cluster events applied to the index. Tagged with kind.",
};

pub const INDEXED_CLUSTERS: MetricDef = MetricDef {
    name: "registry.clusters",
    metric_type: MetricType::Gauge,
    description: "Number of clusters currently present in the label index",
};

pub const FEED_ERRORS: MetricDef = MetricDef {
    name: "registry.feed.errors",
    metric_type: MetricType::Counter,
    description: "Failed attempts to read from the cluster feed",
};

pub const ALL_METRICS: &[MetricDef] = &[REGISTRY_EVENTS, INDEXED_CLUSTERS, FEED_ERRORS];
