//! Tracker error type.

use effm_core::{ConfigError, ValidationError};
use effm_network::DeliveryError;
use effm_storage::StorageError;

/// Result type for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Everything the tracker reports, either as a return value or through the
/// error hook.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// Invalid or rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An event was dropped at the collector boundary
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A batch could not be delivered (it was handed to storage)
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// Durable storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Durable storage failed while the tracker was running
    #[error("storage failure: {0}")]
    StorageFailed(String),

    /// Events were lost because they could not be delivered or stored
    #[error("{count} events lost: {reason}")]
    EventsLost {
        /// Number of events lost
        count: usize,
        /// What went wrong
        reason: String,
    },

    /// A stored batch was evicted to respect the storage cap
    #[error("evicted stored batch {key} ({events} events, {bytes} bytes)")]
    Eviction {
        /// Storage key of the evicted batch
        key: String,
        /// Events lost
        events: usize,
        /// Bytes freed
        bytes: u64,
    },

    /// Subscriber limit reached
    #[error("subscriber limit of {0} reached")]
    TooManySubscribers(usize),

    /// A subscriber panicked
    #[error("subscriber '{0}' panicked")]
    Subscriber(String),
}
