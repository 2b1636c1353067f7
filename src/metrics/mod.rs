//! Metrics Bridge: folds Event Bus traffic into persisted aggregates (§4.C).

mod aggregate;
mod bridge;
mod cost;

pub use aggregate::{FileFilterMetrics, IpcMetrics, JsonParsingMetrics, MetricAggregate, PrdCounters, SpeckitCounters, ValidationMetrics};
pub use bridge::{BuildMetricsData, MetricsBridge, PrdSetMetricsData, SetStatus};
pub use cost::{Pricing, PricingTable};
