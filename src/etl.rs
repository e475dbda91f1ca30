//! The cycle stages: quality gate, transform, aggregation. Each stage is a
//! pure function of its inputs; the orchestrator owns sequencing and I/O.

pub mod aggregate;
pub mod quality;
pub mod stats;
pub mod transform;

pub use aggregate::{aggregate_window, AggregationSet, AggregationView};
pub use quality::{
    QualityCheckResult, QualityConfig, QualityGate, QualityHistory, QualityReport, WindowVerdict,
};
pub use transform::{transform_window, StatusCategory, TransformConfig, TransformOutcome};
