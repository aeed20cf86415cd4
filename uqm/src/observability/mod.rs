//! Logging setup and step instrumentation.

mod tracing;

pub use self::tracing::{init_tracing, LogFormat, StepTimer, DEFAULT_FILTER};
