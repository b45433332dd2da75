//! The tracker facade.
//!
//! A [`Tracker`] wires collector, buffer, network and storage together and
//! owns their background tasks. It is a cheap clonable handle: build one at
//! the application root and pass clones to every producer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use effm_core::{
    now_millis, AnnotationData, BackendComputationData, Batch, ConfigPatch, ErrorReportData,
    Event, EventData, EventId, EventKind, InteractionData, Metadata, PerformanceData, SessionId,
    SharedConfig, TaskStatus, TaskStatusData, ToolEfficiencyData, TrackerConfig,
};
use effm_network::{
    DeliveryError, HealthReport, HttpTransport, NetworkManager, NetworkStatus, Transport,
};
use effm_storage::{open_adapter, StorageAdapter, StorageManager, StorageStats};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{shutdown_requested, BufferStatus, DataBuffer, FlushOutcome, RetryOutcome};
use crate::collector::{CollectorObserver, EventCollector, Listener, ListenerId};
use crate::error::{Result, TrackerError};
use crate::hooks::{Subscribers, SubscriptionId};
use crate::report::{CounterSnapshot, Reporter};
use crate::signals::SignalSource;

/// Tracker status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackerStatus {
    /// Started and not stopped
    pub running: bool,
    /// Paused (collection suspended)
    pub paused: bool,
    /// Last known connectivity
    pub online: bool,
    /// Session stamped on events
    pub session_id: SessionId,
    /// Start time, milliseconds since epoch
    pub started_at: Option<i64>,
    /// Last successful delivery, milliseconds since epoch
    pub last_flush_at: Option<i64>,
    /// Buffer view
    pub buffer: BufferStatus,
    /// Pipeline counters
    pub counters: CounterSnapshot,
    /// Network and breaker view
    pub network: NetworkStatus,
    /// Storage view (absent when storage is disabled or unreadable)
    pub storage: Option<StorageStats>,
}

#[derive(Default)]
struct RunState {
    running: bool,
    paused: bool,
    started_at: Option<i64>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct TrackerInner {
    config: SharedConfig,
    session_id: SessionId,
    network: Arc<NetworkManager>,
    storage: Option<Arc<StorageManager>>,
    buffer: Arc<DataBuffer>,
    collector: Arc<EventCollector>,
    reporter: Arc<Reporter>,
    status_hooks: Subscribers<TrackerStatus>,
    state: Mutex<RunState>,
    connectivity: Option<watch::Receiver<bool>>,
    online: Arc<AtomicBool>,
}

/// Builder for [`Tracker`].
pub struct TrackerBuilder {
    config: TrackerConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn StorageAdapter>>,
    signals: Option<Arc<dyn SignalSource>>,
    connectivity: Option<watch::Receiver<bool>>,
    anonymize: bool,
}

impl TrackerBuilder {
    /// Deliver through `transport` instead of the default HTTP client.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Store undelivered batches in `adapter` instead of opening
    /// `config.storage.backend`.
    pub fn with_storage_adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(adapter);
        self
    }

    /// Observe environment signals from `source`.
    pub fn with_signal_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.signals = Some(source);
        self
    }

    /// Watch connectivity; a change to `true` resends stored batches.
    pub fn with_connectivity(mut self, online: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(online);
        self
    }

    /// Mask user ids and strip identifying metadata.
    pub fn with_anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    /// Validate the configuration and assemble the pipeline.
    pub async fn build(self) -> Result<Tracker> {
        self.config.validate()?;
        let config = SharedConfig::new(self.config);
        let snapshot = config.snapshot();

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(snapshot.request_timeout())),
        };
        let network = Arc::new(NetworkManager::new(transport, config.clone()));

        let storage = if snapshot.storage.enabled {
            let adapter = match self.storage {
                Some(adapter) => adapter,
                None => open_adapter(&snapshot.storage).await?,
            };
            debug!("Using {} storage for undelivered batches", adapter.name());
            Some(Arc::new(StorageManager::new(adapter, snapshot.storage.max_bytes)))
        } else {
            None
        };

        let reporter = Arc::new(Reporter::new());
        let buffer = Arc::new(DataBuffer::new(
            config.clone(),
            network.clone(),
            storage.clone(),
            reporter.clone(),
        ));

        let session_id = SessionId::new();
        let mut collector = EventCollector::new(
            config.clone(),
            session_id.clone(),
            buffer.clone(),
            reporter.clone(),
        )
        .with_anonymize(self.anonymize);
        if let Some(source) = self.signals {
            collector = collector.with_signal_source(source);
        }

        // Queued single events that fail go back through the buffer.
        let weak_buffer: Weak<DataBuffer> = Arc::downgrade(&buffer);
        let queue_reporter = reporter.clone();
        network.set_queue_failure_handler(Arc::new(move |event: Event, error: &DeliveryError| {
            queue_reporter.report(TrackerError::Delivery(error.clone()));
            match weak_buffer.upgrade() {
                Some(buffer) => buffer.enqueue(event),
                None => warn!("Dropping undelivered event {}: tracker is gone", event.event_id),
            }
        }));

        let online = self
            .connectivity
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(true);

        Ok(Tracker {
            inner: Arc::new(TrackerInner {
                config,
                session_id,
                network,
                storage,
                buffer,
                collector: Arc::new(collector),
                reporter,
                status_hooks: Subscribers::new("status hook"),
                state: Mutex::new(RunState::default()),
                connectivity: self.connectivity,
                online: Arc::new(AtomicBool::new(online)),
            }),
        })
    }
}

/// Handle to a running telemetry pipeline.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    /// Start building a tracker.
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            transport: None,
            storage: None,
            signals: None,
            connectivity: None,
            anonymize: false,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start collecting and delivering. Idempotent.
    pub async fn start(&self) {
        let started_at = now_millis();
        {
            let mut state = self.lock_state();
            if state.running {
                debug!("Tracker is already running");
                return;
            }
            state.running = true;
            state.paused = false;
            state.started_at = Some(started_at);
        }

        let inner = &self.inner;
        let config = inner.config.snapshot();
        if config.storage.clear_on_start {
            if let Some(storage) = &inner.storage {
                match storage.clear().await {
                    Ok(n) => info!("Cleared {} stored batches on start", n),
                    Err(e) => inner.reporter.report(TrackerError::StorageFailed(e.to_string())),
                }
            }
        }

        inner.collector.set_session_start(started_at);
        inner.collector.start();
        inner.collector.lifecycle(TaskStatus::Started, true);

        let (shutdown, stop_rx) = watch::channel(false);
        let tasks = self.spawn_tasks(stop_rx);
        {
            let mut state = self.lock_state();
            state.tasks = tasks;
            state.shutdown = Some(shutdown);
        }

        info!("Tracker started (session {})", inner.session_id);
        self.notify_status().await;
    }

    /// Background work for one run. Every task ends once `stop_rx` is set,
    /// finishing any delivery it has already started.
    fn spawn_tasks(&self, stop_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let inner = &self.inner;
        let mut tasks = Vec::new();

        let (network, mut stop) = (inner.network.clone(), stop_rx.clone());
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = network.initial_health_check() => {}
                _ = shutdown_requested(&mut stop) => {}
            }
        }));

        tasks.push(inner.buffer.spawn_flush_timer(stop_rx.clone()));
        if inner.storage.is_some() {
            tasks.push(inner.buffer.spawn_retry_timer(stop_rx.clone()));
        }

        let (network, buffer, config) = (inner.network.clone(), inner.buffer.clone(), inner.config.clone());
        let mut stop = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(config.snapshot().health_check_interval()) => {}
                    _ = shutdown_requested(&mut stop) => break,
                }
                if network.health_probe().await {
                    buffer.retry_stored_events().await;
                }
            }
        }));

        if let Some(mut rx) = inner.connectivity.clone() {
            let (buffer, online) = (inner.buffer.clone(), inner.online.clone());
            let mut stop = stop_rx.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = shutdown_requested(&mut stop) => break,
                    }
                    let now_online = *rx.borrow_and_update();
                    let was_online = online.swap(now_online, Ordering::AcqRel);
                    if now_online && !was_online {
                        info!("Connectivity restored, resending stored events");
                        buffer.retry_stored_events().await;
                    } else if !now_online && was_online {
                        info!("Connectivity lost");
                    }
                }
            }));
        }

        let buffer = inner.buffer.clone();
        tasks.push(tokio::spawn(async move {
            buffer.retry_stored_events().await;
        }));

        tasks
    }

    /// Stop: record time spent, wind down background work and drain the
    /// buffer.
    ///
    /// Deliveries already in flight are awaited, not cancelled, so their
    /// batches end up delivered or stored.
    pub async fn stop(&self) {
        let (tasks, shutdown) = {
            let mut state = self.lock_state();
            if !state.running {
                debug!("Tracker is not running");
                return;
            }
            state.running = false;
            state.paused = false;
            (std::mem::take(&mut state.tasks), state.shutdown.take())
        };

        let inner = &self.inner;
        inner.collector.lifecycle(TaskStatus::Paused, true);
        inner.collector.stop();
        if let Some(shutdown) = shutdown {
            shutdown.send_replace(true);
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let queued = inner.network.take_queue();
        if !queued.is_empty() {
            inner.buffer.enqueue_all(queued);
        }
        inner.buffer.force_flush().await;

        info!("Tracker stopped");
        self.notify_status().await;
    }

    /// Suspend collection. Delivery continues.
    pub async fn pause(&self) {
        {
            let mut state = self.lock_state();
            if !state.running || state.paused {
                return;
            }
            state.paused = true;
        }
        self.inner.collector.lifecycle(TaskStatus::Paused, true);
        self.inner.collector.stop();
        info!("Tracker paused");
        self.notify_status().await;
    }

    /// Resume collection after [`pause`](Self::pause).
    pub async fn resume(&self) {
        {
            let mut state = self.lock_state();
            if !state.running || !state.paused {
                return;
            }
            state.paused = false;
        }
        self.inner.collector.start();
        self.inner.collector.lifecycle(TaskStatus::Resumed, false);
        info!("Tracker resumed");
        self.notify_status().await;
    }

    /// Started and not stopped.
    pub fn is_running(&self) -> bool {
        self.lock_state().running
    }

    /// Session stamped on events.
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<TrackerConfig> {
        self.inner.config.snapshot()
    }

    /// Apply a configuration patch; it takes effect from the next flush.
    pub async fn update_config(&self, patch: ConfigPatch) -> Result<()> {
        self.inner.config.update(&patch)?;
        self.inner.network.reload_config();
        if let (Some(max), Some(storage)) = (patch.storage_max_bytes, &self.inner.storage) {
            storage.set_max_bytes(max);
        }
        info!("Configuration updated");
        self.notify_status().await;
        Ok(())
    }

    // Producer API

    /// Record an annotation action.
    pub fn track_annotation(&self, data: AnnotationData) -> Option<EventId> {
        self.inner.collector.track_annotation(data)
    }

    /// Record a performance sample.
    pub fn track_performance(&self, data: PerformanceData) -> Option<EventId> {
        self.inner.collector.track_performance(data)
    }

    /// Record a user interaction.
    pub fn track_user_interaction(&self, data: InteractionData) -> Option<EventId> {
        self.inner.collector.track_user_interaction(data)
    }

    /// Record backend computation progress.
    pub fn track_backend_computation(&self, data: BackendComputationData) -> Option<EventId> {
        self.inner.collector.track_backend_computation(data)
    }

    /// Record a task status change.
    pub fn track_task_status(&self, data: TaskStatusData) -> Option<EventId> {
        self.inner.collector.track_task_status(data)
    }

    /// Record an error.
    pub fn track_error(&self, data: ErrorReportData) -> Option<EventId> {
        self.inner.collector.track_error(data)
    }

    /// Record a tool efficiency measurement.
    pub fn track_tool_efficiency(&self, data: ToolEfficiencyData) -> Option<EventId> {
        self.inner.collector.track_tool_efficiency(data)
    }

    /// Record an event from untyped fields. Fields that fail to parse are
    /// reported through the error hooks and yield `None`.
    pub fn track_raw(&self, kind: EventKind, fields: Metadata) -> Option<EventId> {
        self.inner.collector.collect_raw(kind, fields)
    }

    /// Send one event through the single-event queue, bypassing the buffer.
    /// If that delivery fails the event falls back into the buffer.
    pub fn send_immediately(&self, data: EventData) -> Option<EventId> {
        let inner = &self.inner;
        if !inner.collector.is_collecting() {
            return None;
        }
        match inner.collector.prepare(data) {
            Ok(event) => {
                let id = event.event_id.clone();
                inner.reporter.accepted(&event);
                inner.network.enqueue_event(event);
                Some(id)
            }
            Err(e) => {
                warn!("Dropping invalid event: {}", e);
                inner.reporter.rejected(&e);
                None
            }
        }
    }

    // Delivery control

    /// Flush one batch now.
    pub async fn flush(&self) -> FlushOutcome {
        let outcome = self.inner.buffer.flush().await;
        self.notify_status().await;
        outcome
    }

    /// Flush until the buffer is empty.
    pub async fn force_flush(&self) {
        self.inner.buffer.force_flush().await;
        self.notify_status().await;
    }

    /// Resend stored batches now.
    pub async fn retry_stored_events(&self) -> RetryOutcome {
        self.inner.buffer.retry_stored_events().await
    }

    /// Drop buffered events. Returns how many were dropped.
    pub fn clear_buffer(&self) -> usize {
        self.inner.buffer.clear()
    }

    /// Drop stored batches. Returns how many were dropped.
    pub async fn clear_storage(&self) -> Result<usize> {
        match &self.inner.storage {
            Some(storage) => Ok(storage.clear().await?),
            None => Ok(0),
        }
    }

    /// Stored events, in storage order.
    pub async fn stored_events(&self) -> Result<Vec<Event>> {
        match &self.inner.storage {
            Some(storage) => Ok(storage.all_events().await?),
            None => Ok(Vec::new()),
        }
    }

    /// Probe the health endpoint.
    pub async fn health(&self) -> HealthReport {
        self.inner.network.health().await
    }

    /// Whether the health endpoint answers 2xx.
    pub async fn check_connection(&self) -> bool {
        self.inner.network.check_health().await
    }

    // Observation

    /// Register an event listener for one kind, or all kinds with `None`.
    pub fn add_listener(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        self.inner.collector.add_listener(kind, listener)
    }

    /// Remove an event listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.collector.remove_listener(id)
    }

    /// Subscribe to errors.
    pub fn on_error(&self, hook: impl Fn(&TrackerError) + Send + Sync + 'static) -> Result<SubscriptionId> {
        self.inner.reporter.errors.subscribe(Arc::new(hook))
    }

    /// Subscribe to delivered batches.
    pub fn on_flush(&self, hook: impl Fn(&Batch) + Send + Sync + 'static) -> Result<SubscriptionId> {
        self.inner.reporter.flushes.subscribe(Arc::new(hook))
    }

    /// Subscribe to status changes.
    pub fn on_status_change(&self, hook: impl Fn(&TrackerStatus) + Send + Sync + 'static) -> Result<SubscriptionId> {
        self.inner.status_hooks.subscribe(Arc::new(hook))
    }

    /// Remove a hook registered with any `on_*` method.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.reporter.errors.unsubscribe(id)
            || self.inner.reporter.flushes.unsubscribe(id)
            || self.inner.status_hooks.unsubscribe(id)
    }

    /// Network and breaker view.
    pub fn network_status(&self) -> NetworkStatus {
        self.inner.network.status()
    }

    /// Storage statistics, if storage is enabled.
    pub async fn storage_stats(&self) -> Result<Option<StorageStats>> {
        match &self.inner.storage {
            Some(storage) => Ok(Some(storage.stats().await?)),
            None => Ok(None),
        }
    }

    /// Full status snapshot.
    pub async fn status(&self) -> TrackerStatus {
        let (running, paused, started_at) = {
            let state = self.lock_state();
            (state.running, state.paused, state.started_at)
        };
        let storage = match self.storage_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not read storage stats: {}", e);
                None
            }
        };
        let inner = &self.inner;
        TrackerStatus {
            running,
            paused,
            online: inner.online.load(Ordering::Acquire),
            session_id: inner.session_id.clone(),
            started_at,
            last_flush_at: inner.reporter.last_flush_at(),
            buffer: inner.buffer.status(),
            counters: inner.reporter.snapshot(),
            network: inner.network.status(),
            storage,
        }
    }

    async fn notify_status(&self) {
        if self.inner.status_hooks.is_empty() {
            return;
        }
        let status = self.status().await;
        let panics = self.inner.status_hooks.notify(&status);
        self.inner.reporter.subscriber_panicked("status hook", panics);
    }
}
