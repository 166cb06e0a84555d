//! Darkroom: a media transformation pipeline.
//!
//! Watches object storage for uploaded images, resizes them through a durable
//! at-least-once queue, and records processing metadata. Jobs that repeatedly
//! fail are isolated in a dead-letter queue, and threshold alarms track
//! pipeline health.

pub mod alerting;
pub mod config;
pub mod error;
pub mod event;
pub mod metadata;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod signal;
pub mod storage;
pub mod transform;
pub mod worker;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{run_pipeline, run_pipeline_until};
pub use worker::PipelineStats;
