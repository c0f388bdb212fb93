//! Metrics module
//!
//! Prometheus counters for admissions, fulfillment, dead letters and cache
//! behaviour.

mod pipeline;

pub use pipeline::PipelineMetrics;
