//! Metrics definitions for the product sync pipeline.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STAGE_DURATION: MetricDef = MetricDef {
    name: "pipeline.stage.duration",
    metric_type: MetricType::Histogram,
    description: "Time to run one pass of a pipeline stage in seconds. Tagged with stage",
};

pub const STAGE_ITEM_SUCCEEDED: MetricDef = MetricDef {
    name: "pipeline.stage.item.succeeded",
    metric_type: MetricType::Counter,
    description: "Number of products a stage completed. Tagged with stage",
};

pub const STAGE_ITEM_FAILED: MetricDef = MetricDef {
    name: "pipeline.stage.item.failed",
    metric_type: MetricType::Counter,
    description: "Number of products a stage failed on. Tagged with stage",
};

pub const PLU_INTEGRITY_ERROR: MetricDef = MetricDef {
    name: "plu.integrity_error",
    metric_type: MetricType::Counter,
    description: "Number of products rejected because of a hash collision or malformed PLU",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete a cache reconciliation pass in seconds",
};

pub const RECONCILE_KEYS: MetricDef = MetricDef {
    name: "reconcile.keys",
    metric_type: MetricType::Histogram,
    description: "Number of PLU hashes read from the document store per pass",
};

pub const RECONCILE_CREATED: MetricDef = MetricDef {
    name: "reconcile.created",
    metric_type: MetricType::Counter,
    description: "Number of PLU hashes written to the cache",
};

pub const RECONCILE_CONFLICT: MetricDef = MetricDef {
    name: "reconcile.conflict",
    metric_type: MetricType::Counter,
    description: "Number of PLU hashes whose cached or durable value disagrees",
};

pub const RECONCILE_FAILED: MetricDef = MetricDef {
    name: "reconcile.failed",
    metric_type: MetricType::Counter,
    description: "Number of PLU hashes the cache rejected",
};

pub const PLACE_CACHE_HIT: MetricDef = MetricDef {
    name: "place_cache.hit",
    metric_type: MetricType::Counter,
    description: "Number of geocoding lookups served from the place cache",
};

pub const PLACE_CACHE_MISS: MetricDef = MetricDef {
    name: "place_cache.miss",
    metric_type: MetricType::Counter,
    description: "Number of geocoding lookups sent to the geocoder",
};

pub const PLU_RESOLVE: MetricDef = MetricDef {
    name: "plu.resolve",
    metric_type: MetricType::Counter,
    description: "Number of PLU hash lookups. Tagged with result",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STAGE_DURATION,
    STAGE_ITEM_SUCCEEDED,
    STAGE_ITEM_FAILED,
    PLU_INTEGRITY_ERROR,
    RECONCILE_DURATION,
    RECONCILE_KEYS,
    RECONCILE_CREATED,
    RECONCILE_CONFLICT,
    RECONCILE_FAILED,
    PLACE_CACHE_HIT,
    PLACE_CACHE_MISS,
    PLU_RESOLVE,
];
