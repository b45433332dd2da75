//! Counters and hooks fed by the buffer and the collector.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use effm_core::{now_millis, Batch, Event, ValidationError};
use effm_network::DeliveryError;
use effm_storage::{EvictedBatch, StorageError};
use serde::Serialize;

use crate::buffer::BufferObserver;
use crate::collector::CollectorObserver;
use crate::error::TrackerError;
use crate::hooks::Subscribers;

/// Counter values at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    /// Events accepted into the buffer
    pub total_events: u64,
    /// Events dropped by validation
    pub invalid_events: u64,
    /// Signals skipped by sampling
    pub sampled_out: u64,
    /// Live events delivered
    pub delivered_events: u64,
    /// Live batches delivered
    pub delivered_batches: u64,
    /// Failed live deliveries
    pub failed_deliveries: u64,
    /// Batches written to storage
    pub stored_batches: u64,
    /// Stored events delivered later
    pub redelivered_events: u64,
    /// Stored events dropped to respect the cap
    pub evicted_events: u64,
    /// Events neither delivered nor stored
    pub lost_events: u64,
    /// Errors reported through the error hook
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    total_events: AtomicU64,
    invalid_events: AtomicU64,
    sampled_out: AtomicU64,
    delivered_events: AtomicU64,
    delivered_batches: AtomicU64,
    failed_deliveries: AtomicU64,
    stored_batches: AtomicU64,
    redelivered_events: AtomicU64,
    evicted_events: AtomicU64,
    lost_events: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64, by: usize) {
    counter.fetch_add(by as u64, Ordering::Relaxed);
}

/// Shared sink for pipeline outcomes.
pub(crate) struct Reporter {
    counters: Counters,
    last_flush_at: AtomicI64,
    pub(crate) errors: Subscribers<TrackerError>,
    pub(crate) flushes: Subscribers<Batch>,
}

impl Reporter {
    pub(crate) fn new() -> Self {
        Self {
            counters: Counters::default(),
            last_flush_at: AtomicI64::new(0),
            errors: Subscribers::new("error hook"),
            flushes: Subscribers::new("flush hook"),
        }
    }

    /// Count and publish an error.
    pub(crate) fn report(&self, error: TrackerError) {
        bump(&self.counters.errors, 1);
        self.errors.notify(&error);
    }

    /// Publish a panic from a subscriber list.
    pub(crate) fn subscriber_panicked(&self, name: &str, panics: usize) {
        if panics > 0 {
            self.report(TrackerError::Subscriber(name.to_string()));
        }
    }

    pub(crate) fn last_flush_at(&self) -> Option<i64> {
        match self.last_flush_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    pub(crate) fn snapshot(&self) -> CounterSnapshot {
        let c = &self.counters;
        let get = |a: &AtomicU64| a.load(Ordering::Relaxed);
        CounterSnapshot {
            total_events: get(&c.total_events),
            invalid_events: get(&c.invalid_events),
            sampled_out: get(&c.sampled_out),
            delivered_events: get(&c.delivered_events),
            delivered_batches: get(&c.delivered_batches),
            failed_deliveries: get(&c.failed_deliveries),
            stored_batches: get(&c.stored_batches),
            redelivered_events: get(&c.redelivered_events),
            evicted_events: get(&c.evicted_events),
            lost_events: get(&c.lost_events),
            errors: get(&c.errors),
        }
    }

    fn flushed(&self, batch: &Batch) {
        self.last_flush_at.store(now_millis(), Ordering::Relaxed);
        let panics = self.flushes.notify(batch);
        self.subscriber_panicked("flush hook", panics);
    }
}

impl BufferObserver for Reporter {
    fn delivered(&self, batch: &Batch) {
        bump(&self.counters.delivered_events, batch.len());
        bump(&self.counters.delivered_batches, 1);
        self.flushed(batch);
    }

    fn delivery_failed(&self, _batch: &Batch, error: &DeliveryError) {
        bump(&self.counters.failed_deliveries, 1);
        self.report(TrackerError::Delivery(error.clone()));
    }

    fn stored(&self, _batch: &Batch) {
        bump(&self.counters.stored_batches, 1);
    }

    fn evicted(&self, evicted: &EvictedBatch) {
        bump(&self.counters.evicted_events, evicted.events.len());
        self.report(TrackerError::Eviction {
            key: evicted.key.clone(),
            events: evicted.events.len(),
            bytes: evicted.bytes,
        });
    }

    fn lost(&self, count: usize, reason: &str) {
        bump(&self.counters.lost_events, count);
        self.report(TrackerError::EventsLost {
            count,
            reason: reason.to_string(),
        });
    }

    fn storage_failed(&self, error: &StorageError) {
        self.report(TrackerError::StorageFailed(error.to_string()));
    }

    fn redelivered(&self, batch: &Batch) {
        bump(&self.counters.redelivered_events, batch.len());
        self.flushed(batch);
    }
}

impl CollectorObserver for Reporter {
    fn accepted(&self, _event: &Event) {
        bump(&self.counters.total_events, 1);
    }

    fn rejected(&self, error: &ValidationError) {
        bump(&self.counters.invalid_events, 1);
        self.report(TrackerError::Validation(error.clone()));
    }

    fn sampled_out(&self) {
        bump(&self.counters.sampled_out, 1);
    }
}
