//! In-memory event buffer between the collector and the network.
//!
//! `flush` is guarded: at most one runs at a time and an overlapping call
//! returns [`FlushOutcome::Busy`] without touching the queue. Each flush
//! takes at most `batchSize` of the oldest events; if delivery fails the
//! exact same batch goes to durable storage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use effm_core::{Batch, ClientEnvironment, Event, SharedConfig, TrackerConfig};
use effm_network::{DeliveryError, DeliveryResult, NetworkManager};
use effm_storage::{EvictedBatch, StorageError, StorageManager};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where flushed batches go.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Deliver one batch.
    async fn deliver(&self, batch: &Batch) -> DeliveryResult;
}

#[async_trait]
impl BatchSink for NetworkManager {
    async fn deliver(&self, batch: &Batch) -> DeliveryResult {
        self.send_batch(batch).await
    }
}

/// Notified about what happens to flushed events.
pub trait BufferObserver: Send + Sync {
    /// A live batch was delivered.
    fn delivered(&self, _batch: &Batch) {}
    /// A live batch failed delivery (it is about to be stored).
    fn delivery_failed(&self, _batch: &Batch, _error: &DeliveryError) {}
    /// A failed batch was written to storage.
    fn stored(&self, _batch: &Batch) {}
    /// A stored batch was dropped to respect the cap.
    fn evicted(&self, _evicted: &EvictedBatch) {}
    /// Events that could be neither delivered nor stored.
    fn lost(&self, _count: usize, _reason: &str) {}
    /// Storage raised an error.
    fn storage_failed(&self, _error: &StorageError) {}
    /// A stored batch (or part of one) was delivered.
    fn redelivered(&self, _batch: &Batch) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl BufferObserver for NoopObserver {}

/// What a call to [`DataBuffer::flush`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Another flush was running
    Busy,
    /// Nothing was queued
    Empty,
    /// Events delivered
    Delivered(usize),
    /// Delivery failed; events are in storage
    Stored(usize),
    /// Delivery and storage both failed (or storage is disabled)
    Lost(usize),
}

/// What a call to [`DataBuffer::retry_stored_events`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOutcome {
    /// Another retry was running, or storage is disabled
    pub skipped: bool,
    /// Stored batches fully delivered and removed
    pub batches_removed: usize,
    /// Stored events delivered
    pub events_delivered: usize,
    /// The failure that stopped the scan, if any
    pub stopped_by: Option<DeliveryError>,
}

/// Buffer status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferStatus {
    /// Queued events
    pub buffer_size: usize,
    /// Flush in progress
    pub flushing: bool,
    /// Stored-batch retry in progress
    pub retrying: bool,
}

/// Clears a busy flag (and wakes waiters) however the guarded scope ends.
struct BusyGuard<'a> {
    flag: &'a AtomicBool,
    done: Option<&'a Notify>,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
        if let Some(done) = self.done {
            done.notify_waiters();
        }
    }
}

/// Holds a batch while it is being delivered. If the flush is dropped
/// before the outcome is known, the events go back to the front of the
/// queue.
struct InFlight<'a> {
    queue: &'a Mutex<VecDeque<Event>>,
    batch: Option<Batch>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            let events = batch.into_events();
            warn!("Flush of {} events interrupted, returning them to the buffer", events.len());
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            for event in events.into_iter().rev() {
                queue.push_front(event);
            }
        }
    }
}

/// Resolves once `shutdown` is set to `true` or its sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Queue of accepted events awaiting delivery.
pub struct DataBuffer {
    config: SharedConfig,
    sink: Arc<dyn BatchSink>,
    storage: Option<Arc<StorageManager>>,
    observer: Arc<dyn BufferObserver>,
    queue: Mutex<VecDeque<Event>>,
    flushing: AtomicBool,
    retrying: AtomicBool,
    flush_done: Notify,
}

impl DataBuffer {
    /// Create a buffer.
    pub fn new(
        config: SharedConfig,
        sink: Arc<dyn BatchSink>,
        storage: Option<Arc<StorageManager>>,
        observer: Arc<dyn BufferObserver>,
    ) -> Self {
        Self {
            config,
            sink,
            storage,
            observer,
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            retrying: AtomicBool::new(false),
            flush_done: Notify::new(),
        }
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn environment(config: &TrackerConfig) -> ClientEnvironment {
        ClientEnvironment::detect(config.tool_type, config.client_version.clone())
    }

    /// Append an event. Reaching `batchSize` starts a flush in the
    /// background; the caller never waits for it.
    pub fn enqueue(self: &Arc<Self>, event: Event) {
        self.enqueue_all(std::iter::once(event));
    }

    /// Append several events in order.
    pub fn enqueue_all(self: &Arc<Self>, events: impl IntoIterator<Item = Event>) {
        let len = {
            let mut queue = self.lock_queue();
            queue.extend(events);
            queue.len()
        };
        if len >= self.config.snapshot().batch_size {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.flush().await;
            });
        }
    }

    /// Queued events.
    pub fn len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock_queue().is_empty()
    }

    /// Copy of the queued events, oldest first.
    pub fn pending(&self) -> Vec<Event> {
        self.lock_queue().iter().cloned().collect()
    }

    /// Drop everything queued. Returns how many events were dropped.
    pub fn clear(&self) -> usize {
        let dropped = self.lock_queue().drain(..).count();
        if dropped > 0 {
            warn!("Cleared {} buffered events without delivery", dropped);
        }
        dropped
    }

    /// Status snapshot.
    pub fn status(&self) -> BufferStatus {
        BufferStatus {
            buffer_size: self.len(),
            flushing: self.flushing.load(Ordering::Acquire),
            retrying: self.retrying.load(Ordering::Acquire),
        }
    }

    /// Deliver up to `batchSize` of the oldest events.
    pub async fn flush(&self) -> FlushOutcome {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushOutcome::Busy;
        }
        let _guard = BusyGuard {
            flag: &self.flushing,
            done: Some(&self.flush_done),
        };

        let config = self.config.snapshot();
        let events: Vec<Event> = {
            let mut queue = self.lock_queue();
            let n = queue.len().min(config.batch_size);
            queue.drain(..n).collect()
        };
        if events.is_empty() {
            return FlushOutcome::Empty;
        }

        let mut in_flight = InFlight {
            queue: &self.queue,
            batch: Some(Batch::new(events, Self::environment(&config))),
        };
        let result = match &in_flight.batch {
            Some(batch) => self.sink.deliver(batch).await,
            None => return FlushOutcome::Empty,
        };
        let Some(batch) = in_flight.batch.take() else {
            return FlushOutcome::Empty;
        };
        let count = batch.len();
        match result {
            Ok(_) => {
                debug!("Flushed {} events", count);
                self.observer.delivered(&batch);
                FlushOutcome::Delivered(count)
            }
            Err(e) => {
                self.observer.delivery_failed(&batch, &e);
                self.persist(batch, &config, &e).await
            }
        }
    }

    async fn persist(&self, batch: Batch, config: &TrackerConfig, cause: &DeliveryError) -> FlushOutcome {
        let count = batch.len();
        let storage = match &self.storage {
            Some(storage) if config.storage.enabled => storage,
            _ => {
                error!("{} events lost: delivery failed ({}) and storage is disabled", count, cause);
                self.observer.lost(count, "storage disabled");
                return FlushOutcome::Lost(count);
            }
        };

        match storage.store_batch(&batch).await {
            Ok(outcome) => {
                info!("Stored {} events locally after delivery failure: {}", count, cause);
                self.observer.stored(&batch);
                for evicted in &outcome.evicted {
                    self.observer.evicted(evicted);
                }
                if let Some(e) = &outcome.eviction_error {
                    self.observer.storage_failed(e);
                }
                FlushOutcome::Stored(count)
            }
            Err(e) => {
                error!("{} events lost: delivery failed ({}) and storage failed: {}", count, cause, e);
                self.observer.storage_failed(&e);
                self.observer.lost(count, &e.to_string());
                FlushOutcome::Lost(count)
            }
        }
    }

    /// Flush until the queue is empty, waiting out any flush in progress.
    pub async fn force_flush(&self) {
        loop {
            let notified = self.flush_done.notified();
            if self.is_empty() && !self.flushing.load(Ordering::Acquire) {
                return;
            }
            match self.flush().await {
                FlushOutcome::Busy => notified.await,
                FlushOutcome::Empty => return,
                _ => {}
            }
        }
    }

    /// Redeliver stored batches in storage order.
    ///
    /// A batch is removed only after it is confirmed delivered. Batches
    /// larger than the current `batchSize` are sent in chunks; if a later
    /// chunk fails, the stored record is replaced with what is left. The
    /// scan stops at the first failure.
    pub async fn retry_stored_events(&self) -> RetryOutcome {
        let config = self.config.snapshot();
        let storage = match &self.storage {
            Some(storage) if config.storage.enabled => storage,
            _ => return RetryOutcome { skipped: true, ..Default::default() },
        };
        if self.retrying.swap(true, Ordering::AcqRel) {
            return RetryOutcome { skipped: true, ..Default::default() };
        }
        let _guard = BusyGuard {
            flag: &self.retrying,
            done: None,
        };

        let records = match storage.records().await {
            Ok(records) => records,
            Err(e) => {
                error!("Could not read stored batches: {}", e);
                self.observer.storage_failed(&e);
                return RetryOutcome::default();
            }
        };
        if records.is_empty() {
            return RetryOutcome::default();
        }
        info!("Found {} stored batches, attempting to resend", records.len());

        let mut outcome = RetryOutcome::default();
        for record in records {
            let environment = record.batch.environment().clone();
            let mut chunks = record.batch.split(config.batch_size).into_iter();
            let mut sent_any = false;
            let mut failure = None;

            for chunk in chunks.by_ref() {
                match self.sink.deliver(&chunk).await {
                    Ok(_) => {
                        outcome.events_delivered += chunk.len();
                        self.observer.redelivered(&chunk);
                        sent_any = true;
                    }
                    Err(e) => {
                        failure = Some((chunk, e));
                        break;
                    }
                }
            }

            let result = match failure {
                None => storage.remove(&record.key).await.map(|_| {
                    outcome.batches_removed += 1;
                }),
                Some((failed, e)) => {
                    if sent_any {
                        let remaining: Vec<Event> = std::iter::once(failed)
                            .chain(chunks)
                            .flat_map(Batch::into_events)
                            .collect();
                        if let Err(se) = storage
                            .replace(&record.key, &Batch::new(remaining, environment))
                            .await
                        {
                            self.observer.storage_failed(&se);
                        }
                    }
                    debug!("Stopping stored-batch retry: {}", e);
                    outcome.stopped_by = Some(e);
                    break;
                }
            };
            if let Err(e) = result {
                error!("Delivered stored batch {} but could not remove it: {}", record.key, e);
                self.observer.storage_failed(&e);
            }
        }

        if outcome.batches_removed > 0 {
            info!(
                "Resent {} stored events ({} batches)",
                outcome.events_delivered, outcome.batches_removed
            );
        }
        outcome
    }

    /// Flush every `flushIntervalMs` until `shutdown` is set.
    ///
    /// Shutdown is only observed between ticks; a flush in progress runs to
    /// completion before the task ends.
    pub fn spawn_flush_timer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = this.config.snapshot().flush_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
                this.flush().await;
            }
            debug!("Flush timer stopped");
        })
    }

    /// Retry stored batches every `storage.retryIntervalMs` until `shutdown`
    /// is set.
    pub fn spawn_retry_timer(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = this.config.snapshot().storage.retry_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
                this.retry_stored_events().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use effm_core::{EventData, EventId, SessionId, TaskStatus, TaskStatusData, ToolType};
    use effm_storage::MemoryStore;
    use std::time::Duration;

    /// Records batch sizes and fails while `fail` is set.
    #[derive(Default)]
    struct RecordingSink {
        sizes: Mutex<Vec<usize>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn deliver(&self, batch: &Batch) -> DeliveryResult {
            tokio::task::yield_now().await;
            self.sizes.lock().unwrap().push(batch.len());
            if self.fail.load(Ordering::SeqCst) {
                Err(DeliveryError::Exhausted { attempts: 1, last_error: "down".into() })
            } else {
                Ok(effm_network::Delivery { status: 200, attempts: 1, response: serde_json::Value::Null })
            }
        }
    }

    fn config(batch_size: usize) -> SharedConfig {
        SharedConfig::new(
            effm_core::TrackerConfig::builder("http://effm.test", "u", "p", "t")
                .with_batch_size(batch_size)
                .with_flush_interval(Duration::from_secs(1))
                .build()
                .unwrap(),
        )
    }

    fn event(n: i64) -> Event {
        Event {
            event_id: EventId::new(ToolType::TextTool),
            timestamp: n,
            user_id: "u".into(),
            project_id: "p".into(),
            task_id: "t".into(),
            tool_type: ToolType::TextTool,
            session_id: SessionId::new(),
            data: EventData::TaskStatus(TaskStatusData::new(TaskStatus::Started)),
        }
    }

    fn buffer(batch_size: usize) -> (Arc<RecordingSink>, Arc<StorageManager>, Arc<DataBuffer>) {
        let sink = Arc::new(RecordingSink::default());
        let storage = Arc::new(StorageManager::new(Arc::new(MemoryStore::new()), u64::MAX));
        let buffer = Arc::new(DataBuffer::new(
            config(batch_size),
            sink.clone(),
            Some(storage.clone()),
            Arc::new(NoopObserver),
        ));
        (sink, storage, buffer)
    }

    #[tokio::test]
    async fn test_flush_takes_oldest_batch_size() {
        let (sink, _, buffer) = buffer(10);
        buffer.enqueue_all((1..=3).map(event));
        assert_eq!(buffer.flush().await, FlushOutcome::Delivered(3));
        assert_eq!(buffer.flush().await, FlushOutcome::Empty);
        assert_eq!(*sink.sizes.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_failed_flush_stores_same_events() {
        let (sink, storage, buffer) = buffer(10);
        sink.fail.store(true, Ordering::SeqCst);
        let events: Vec<Event> = (1..=2).map(event).collect();
        buffer.enqueue_all(events.clone());

        assert_eq!(buffer.flush().await, FlushOutcome::Stored(2));
        assert!(buffer.is_empty());
        assert_eq!(storage.all_events().await.unwrap(), events);
    }

    #[tokio::test]
    async fn test_storage_disabled_loses_events() {
        let sink = Arc::new(RecordingSink::default());
        sink.fail.store(true, Ordering::SeqCst);
        let buffer = Arc::new(DataBuffer::new(config(10), sink, None, Arc::new(NoopObserver)));
        buffer.enqueue(event(1));
        assert_eq!(buffer.flush().await, FlushOutcome::Lost(1));
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_busy() {
        let (sink, _, buffer) = buffer(10);
        buffer.enqueue_all((1..=4).map(event));

        let (a, b) = tokio::join!(buffer.flush(), buffer.flush());
        assert_eq!(a, FlushOutcome::Delivered(4));
        assert_eq!(b, FlushOutcome::Busy);
        assert_eq!(sink.sizes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_force_flush_drains_in_batches() {
        let (sink, _, buffer) = buffer(2);
        {
            let mut queue = buffer.lock_queue();
            queue.extend((1..=5).map(event));
        }
        buffer.force_flush().await;
        assert!(buffer.is_empty());
        assert_eq!(*sink.sizes.lock().unwrap(), vec![2, 2, 1]);
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_failure_and_splits() {
        let (sink, storage, buffer) = buffer(2);
        sink.fail.store(true, Ordering::SeqCst);
        {
            let mut queue = buffer.lock_queue();
            queue.extend((1..=2).map(event));
        }
        buffer.flush().await;
        {
            let mut queue = buffer.lock_queue();
            queue.extend((3..=4).map(event));
        }
        buffer.flush().await;
        assert_eq!(storage.records().await.unwrap().len(), 2);

        let outcome = buffer.retry_stored_events().await;
        assert!(outcome.stopped_by.is_some());
        assert_eq!(outcome.batches_removed, 0);
        // One attempt for the first stored batch, none for the second.
        assert_eq!(sink.sizes.lock().unwrap().len(), 3);

        sink.fail.store(false, Ordering::SeqCst);
        let outcome = buffer.retry_stored_events().await;
        assert_eq!(outcome.batches_removed, 2);
        assert_eq!(outcome.events_delivered, 4);
        assert!(storage.records().await.unwrap().is_empty());

        let again = buffer.retry_stored_events().await;
        assert_eq!(again, RetryOutcome::default());
    }

    #[tokio::test]
    async fn test_retry_replaces_partially_sent_record() {
        let (sink, storage, buffer) = buffer(5);
        sink.fail.store(true, Ordering::SeqCst);
        buffer.lock_queue().extend((1..=5).map(event));
        buffer.flush().await;

        // Shrink the batch size so the stored batch is redelivered in chunks.
        buffer
            .config
            .update(&effm_core::ConfigPatch { batch_size: Some(2), ..Default::default() })
            .unwrap();

        struct FailThird(Mutex<usize>);
        #[async_trait]
        impl BatchSink for FailThird {
            async fn deliver(&self, _batch: &Batch) -> DeliveryResult {
                let mut n = self.0.lock().unwrap();
                *n += 1;
                if *n == 3 {
                    Err(DeliveryError::Exhausted { attempts: 1, last_error: "down".into() })
                } else {
                    Ok(effm_network::Delivery { status: 200, attempts: 1, response: serde_json::Value::Null })
                }
            }
        }
        let retrying = DataBuffer::new(
            buffer.config.clone(),
            Arc::new(FailThird(Mutex::new(0))),
            Some(storage.clone()),
            Arc::new(NoopObserver),
        );
        let outcome = retrying.retry_stored_events().await;
        assert_eq!(outcome.events_delivered, 4);
        let left = storage.all_events().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].timestamp, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_small_buffer() {
        let (sink, _, buffer) = buffer(100);
        buffer.enqueue(event(1));
        let (stop, shutdown) = watch::channel(false);
        let timer = buffer.spawn_flush_timer(shutdown);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(*sink.sizes.lock().unwrap(), vec![1]);

        stop.send(true).unwrap();
        timer.await.unwrap();
        buffer.enqueue(event(2));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.sizes.lock().unwrap().len(), 1);
    }

    /// Never answers.
    struct StalledSink;

    #[async_trait]
    impl BatchSink for StalledSink {
        async fn deliver(&self, _batch: &Batch) -> DeliveryResult {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_flush_returns_events_to_the_buffer() {
        let buffer = Arc::new(DataBuffer::new(config(10), Arc::new(StalledSink), None, Arc::new(NoopObserver)));
        buffer.enqueue_all((1..=3).map(event));

        let flushing = tokio::spawn({
            let buffer = buffer.clone();
            async move { buffer.flush().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(buffer.status().flushing);
        assert!(buffer.is_empty());
        buffer.enqueue(event(4));

        flushing.abort();
        assert!(flushing.await.unwrap_err().is_cancelled());

        let pending: Vec<i64> = buffer.pending().iter().map(|e| e.timestamp).collect();
        assert_eq!(pending, vec![1, 2, 3, 4]);
        assert!(!buffer.status().flushing);
    }

    #[tokio::test]
    async fn test_reaching_batch_size_flushes_in_background() {
        let (sink, _, buffer) = buffer(2);
        buffer.enqueue(event(1));
        assert!(sink.sizes.lock().unwrap().is_empty());
        buffer.enqueue(event(2));
        for _ in 0..100 {
            if buffer.is_empty() && !buffer.status().flushing {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*sink.sizes.lock().unwrap(), vec![2]);
    }
}
