//! Lifecycle events.
//!
//! The executor reports progress to an injected [`EventSink`]. Payloads are
//! small JSON objects naming the pipeline or step plus timing and row
//! counts.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by the executor and engine.
pub mod event_types {
    /// A run began.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A run finished successfully.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// A run failed.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A step began.
    pub const STEP_STARTED: &str = "step.started";
    /// A step produced its rows.
    pub const STEP_COMPLETED: &str = "step.completed";
    /// A step failed.
    pub const STEP_FAILED: &str = "step.failed";
    /// A step was served from the step cache.
    pub const STEP_CACHE_HIT: &str = "step.cache_hit";
}
