use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "aggregator.request.duration",
    metric_type: MetricType::Histogram,
    description: "Inbound request duration in seconds. Tagged with status, method, region, environment, path.",
};

pub const REQUESTS: MetricDef = MetricDef {
    name: "aggregator.requests",
    metric_type: MetricType::Counter,
    description: "Inbound requests handled. Tagged with status, method, region, environment, path.",
};

pub const TRANSPORT_CACHE_HIT: MetricDef = MetricDef {
    name: "aggregator.transport_cache.hit",
    metric_type: MetricType::Counter,
    description: "Cluster transport reused from the cache",
};

pub const TRANSPORT_CACHE_MISS: MetricDef = MetricDef {
    name: "aggregator.transport_cache.miss",
    metric_type: MetricType::Counter,
    description: "Cluster transport built because it was absent or stale",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS,
    TRANSPORT_CACHE_HIT,
    TRANSPORT_CACHE_MISS,
];
