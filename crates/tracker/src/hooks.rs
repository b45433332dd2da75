//! Subscriber lists with bounded fan-out.
//!
//! Every callback runs inside `catch_unwind`: a panicking subscriber is
//! logged and skipped, and the rest still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::error::{Result, TrackerError};

/// Maximum subscribers per list.
pub const MAX_SUBSCRIBERS: usize = 16;

/// Source of subscription ids, shared by every list so an id names exactly
/// one subscription process-wide.
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(1);

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A subscriber callback.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Run `f`, logging instead of unwinding if it panics. Returns false on panic.
pub(crate) fn isolated(name: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(_) => {
            warn!("Subscriber '{}' panicked; continuing", name);
            false
        }
    }
}

/// A bounded, panic-isolated list of callbacks.
pub struct Subscribers<T: ?Sized> {
    name: &'static str,
    entries: RwLock<Vec<(SubscriptionId, Callback<T>)>>,
}

impl<T: ?Sized> Subscribers<T> {
    /// Create an empty list; `name` labels log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Add a callback.
    pub fn subscribe(&self, callback: Callback<T>) -> Result<SubscriptionId> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_SUBSCRIBERS {
            return Err(TrackerError::TooManySubscribers(MAX_SUBSCRIBERS));
        }
        let id = SubscriptionId(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        entries.push((id, callback));
        Ok(id)
    }

    /// Remove a callback. Returns whether it was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Number of callbacks.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Whether there are no callbacks.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber. Returns how many panicked.
    pub fn notify(&self, value: &T) -> usize {
        // Snapshot first so a callback may (un)subscribe without deadlocking.
        let entries: Vec<Callback<T>> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        entries
            .iter()
            .filter(|cb| !isolated(self.name, || cb(value)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let subs: Subscribers<u32> = Subscribers::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        subs.subscribe(Arc::new(|_: &u32| panic!("boom"))).unwrap();
        let counter = seen.clone();
        subs.subscribe(Arc::new(move |v: &u32| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        }))
        .unwrap();

        assert_eq!(subs.notify(&5), 1);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_fan_out_is_bounded() {
        let subs: Subscribers<()> = Subscribers::new("test");
        for _ in 0..MAX_SUBSCRIBERS {
            subs.subscribe(Arc::new(|_: &()| {})).unwrap();
        }
        let err = subs.subscribe(Arc::new(|_: &()| {})).unwrap_err();
        assert!(matches!(err, TrackerError::TooManySubscribers(16)));
    }

    #[test]
    fn test_unsubscribe() {
        let subs: Subscribers<()> = Subscribers::new("test");
        let id = subs.subscribe(Arc::new(|_: &()| {})).unwrap();
        assert!(subs.unsubscribe(id));
        assert!(!subs.unsubscribe(id));
        assert!(subs.is_empty());
    }

    #[test]
    fn test_ids_are_unique_across_lists() {
        let errors: Subscribers<()> = Subscribers::new("errors");
        let flushes: Subscribers<()> = Subscribers::new("flushes");
        let error_id = errors.subscribe(Arc::new(|_: &()| {})).unwrap();
        let flush_id = flushes.subscribe(Arc::new(|_: &()| {})).unwrap();
        assert_ne!(error_id, flush_id);

        assert!(!errors.unsubscribe(flush_id));
        assert_eq!(errors.len(), 1);
        assert!(flushes.unsubscribe(flush_id));
    }
}
