//! Sensor telemetry ETL: a bounded MQTT ingest buffer drained into a
//! relational store, plus a scheduled quality / transform / aggregate cycle
//! that publishes summary views and fault predictions.

pub mod config;
pub mod error;
pub mod etl;
pub mod export;
pub mod grpc;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod mqtt;
pub mod orchestrator;
pub mod queue;
pub mod reading;
pub mod retry;
pub mod scoring;
pub mod service;
pub mod store;
pub mod writer;

pub use error::PipelineError;
pub use service::EtlService;
