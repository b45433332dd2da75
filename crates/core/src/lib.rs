//! Efficiency tracker core data models.
//!
//! This crate defines the events collected from annotation tools, the
//! batches they are delivered in, tracker configuration, and the pure
//! validation/sanitizing rules applied before an event is accepted.

#![warn(missing_docs)]

// Core identities
mod id;

// Telemetry model
mod event;
mod batch;

// Configuration and validation
pub mod config;
pub mod validation;

// Re-exports
pub use id::*;

pub use event::{
    Event, EventData, EventKind, Metadata, Position, ToolType,
    AnnotationData, AnnotationAction, AnnotationType,
    PerformanceData, PerformanceContext, MetricUnit,
    InteractionData, InteractionAction,
    BackendComputationData, ComputationType, ComputationStatus,
    TaskStatusData, TaskStatus,
    ErrorReportData, ErrorType, Severity,
    ToolEfficiencyData,
};
pub use batch::{Batch, ClientEnvironment};
pub use config::{
    TrackerConfig, TrackerConfigBuilder, ConfigPatch, ConfigError, SharedConfig,
    CircuitBreakerConfig, StorageConfig, StorageBackend, CaptureConfig,
};
pub use validation::{
    Validator, Validated, ValidationError, ValidationWarning, FieldError, BatchReport,
    sanitize, anonymize, parse_event_data,
};

/// Timestamp type
pub type Time = chrono::DateTime<chrono::Utc>;

/// Current wall clock in milliseconds since epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Render epoch milliseconds as an ISO-8601 UTC timestamp.
pub fn millis_to_rfc3339(millis: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(millis)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
