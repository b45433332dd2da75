//! Client-side efficiency tracker.
//!
//! [`Tracker`] collects telemetry events from an annotation tool, buffers
//! them into batches and delivers them through [`effm_network`]. Batches
//! that cannot be delivered are kept in [`effm_storage`] and resent later.
//!
//! ```no_run
//! # async fn demo() -> effm_tracker::Result<()> {
//! use effm_core::{AnnotationAction, AnnotationData, AnnotationType, TrackerConfig};
//! use effm_tracker::Tracker;
//!
//! let config = TrackerConfig::builder("https://api.example.com", "user-1", "project-1", "task-1")
//!     .build()?;
//! let tracker = Tracker::builder(config).build().await?;
//! tracker.start().await;
//! tracker.track_annotation(AnnotationData::new(AnnotationAction::Complete, AnnotationType::Polygon));
//! tracker.stop().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod error;
mod hooks;
mod report;

pub mod buffer;
pub mod collector;
pub mod signals;
pub mod tracker;

pub use error::{Result, TrackerError};
pub use hooks::{Callback, Subscribers, SubscriptionId, MAX_SUBSCRIBERS};
pub use report::CounterSnapshot;
pub use buffer::{
    BatchSink, BufferObserver, BufferStatus, DataBuffer, FlushOutcome, NoopObserver, RetryOutcome,
};
pub use collector::{
    CollectorObserver, EventCollector, Listener, ListenerId, NoopCollectorObserver,
};
pub use signals::{ManualSignals, Signal, SignalSink, SignalSource};
pub use tracker::{Tracker, TrackerBuilder, TrackerStatus};
