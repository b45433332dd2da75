//! Delivery of telemetry batches to the events API.
//!
//! [`NetworkManager`] sends batches over a pluggable [`Transport`], retrying
//! transient failures and consulting a [`CircuitBreaker`] so a failing
//! backend is not hammered.

#![warn(missing_docs)]

pub mod transport;
pub mod wire;
pub mod circuit_breaker;
pub mod manager;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError};
pub use wire::{WireBatch, WireEvent};
pub use circuit_breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use manager::{
    Delivery, DeliveryError, DeliveryResult, HealthReport, NetworkManager, NetworkStatus,
    QueueFailureHandler, BATCH_PATH, HEALTH_PATH, SINGLE_PATH,
};

#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
