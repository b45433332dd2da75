//! Event collection: the public entry point for producers.
//!
//! The collector fills in the common fields (id, timestamp, identity,
//! session), sanitizes and validates the event, notifies listeners and hands
//! it to the buffer. Nothing here returns an error to a producer; rejected
//! events are logged and reported to the observer.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use effm_core::{
    anonymize, now_millis, parse_event_data, sanitize, AnnotationData, BackendComputationData,
    ErrorReportData, ErrorType, Event, EventData, EventId, EventKind, InteractionAction,
    InteractionData, Metadata, PerformanceData, Position, SessionId, Severity, SharedConfig,
    TaskStatus, TaskStatusData, ToolEfficiencyData, ValidationError, Validator,
};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::buffer::DataBuffer;
use crate::hooks::isolated;
use crate::signals::{Signal, SignalSink, SignalSource};

/// Event listener callback.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Notified about collection outcomes.
pub trait CollectorObserver: Send + Sync {
    /// An event was accepted into the buffer.
    fn accepted(&self, _event: &Event) {}
    /// An event failed validation and was dropped.
    fn rejected(&self, _error: &ValidationError) {}
    /// A high-frequency signal was skipped by sampling.
    fn sampled_out(&self) {}
}

/// Observer that ignores everything.
pub struct NoopCollectorObserver;

impl CollectorObserver for NoopCollectorObserver {}

struct ListenerEntry {
    id: ListenerId,
    kind: Option<EventKind>,
    listener: Listener,
}

/// Builds, validates and forwards events.
pub struct EventCollector {
    config: SharedConfig,
    session_id: SessionId,
    buffer: Arc<DataBuffer>,
    observer: Arc<dyn CollectorObserver>,
    listeners: RwLock<Vec<ListenerEntry>>,
    next_listener: AtomicU64,
    collecting: AtomicBool,
    anonymize: bool,
    source: Option<Arc<dyn SignalSource>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    session_started_at: AtomicI64,
}

/// Keep a sampled signal with probability `rate`.
fn sample(rate: f64) -> bool {
    if rate >= 1.0 {
        true
    } else if rate <= 0.0 {
        false
    } else {
        rand::random::<f64>() < rate
    }
}

impl EventCollector {
    /// Create a stopped collector feeding `buffer`.
    pub fn new(
        config: SharedConfig,
        session_id: SessionId,
        buffer: Arc<DataBuffer>,
        observer: Arc<dyn CollectorObserver>,
    ) -> Self {
        Self {
            config,
            session_id,
            buffer,
            observer,
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            collecting: AtomicBool::new(false),
            anonymize: false,
            source: None,
            signal_task: Mutex::new(None),
            session_started_at: AtomicI64::new(0),
        }
    }

    /// Observe environment signals from `source` while collecting.
    pub fn with_signal_source(mut self, source: Arc<dyn SignalSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Mask user ids and strip identifying metadata from every event.
    pub fn with_anonymize(mut self, anonymize: bool) -> Self {
        self.anonymize = anonymize;
        self
    }

    /// Session stamped on every event.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Whether events are currently accepted.
    pub fn is_collecting(&self) -> bool {
        self.collecting.load(Ordering::Acquire)
    }

    /// Set the reference point for "time spent" in lifecycle events.
    pub fn set_session_start(&self, millis: i64) {
        self.session_started_at.store(millis, Ordering::Release);
    }

    /// Milliseconds since the session start.
    pub fn time_spent(&self) -> f64 {
        let started = self.session_started_at.load(Ordering::Acquire);
        if started <= 0 {
            0.0
        } else {
            (now_millis() - started).max(0) as f64
        }
    }

    /// Start accepting events and attach the signal source. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.collecting.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = &self.source {
            let (sink, mut rx) = SignalSink::channel();
            source.start(sink);
            let weak = Arc::downgrade(self);
            let task = tokio::spawn(async move {
                while let Some(signal) = rx.recv().await {
                    match weak.upgrade() {
                        Some(this) => this.handle_signal(signal),
                        None => break,
                    }
                }
            });
            if let Some(old) = self.lock_task().replace(task) {
                old.abort();
            }
        }
        debug!("Event collection started");
    }

    /// Stop accepting events and detach the signal source. Idempotent.
    pub fn stop(&self) {
        if !self.collecting.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(source) = &self.source {
            source.stop();
        }
        if let Some(task) = self.lock_task().take() {
            task.abort();
        }
        debug!("Event collection stopped");
    }

    fn lock_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.signal_task.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a listener for one kind, or for every kind with `None`.
    pub fn add_listener(&self, kind: Option<EventKind>, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(ListenerEntry { id, kind, listener });
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|entry| entry.id != id);
        listeners.len() != before
    }

    fn notify_listeners(&self, event: &Event) {
        let kind = event.kind();
        // Kind-specific listeners run before wildcard ones.
        let (specific, wildcard): (Vec<Listener>, Vec<Listener>) = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            let specific = listeners
                .iter()
                .filter(|e| e.kind == Some(kind))
                .map(|e| Arc::clone(&e.listener))
                .collect();
            let wildcard = listeners
                .iter()
                .filter(|e| e.kind.is_none())
                .map(|e| Arc::clone(&e.listener))
                .collect();
            (specific, wildcard)
        };
        for listener in specific.iter().chain(wildcard.iter()) {
            isolated("event listener", || listener(event));
        }
    }

    /// Build a complete, sanitized and validated event without queueing it.
    pub fn prepare(&self, data: EventData) -> Result<Event, ValidationError> {
        let config = self.config.snapshot();
        let event = sanitize(Event {
            event_id: EventId::new(config.tool_type),
            timestamp: now_millis(),
            user_id: config.user_id.clone(),
            project_id: config.project_id.clone(),
            task_id: config.task_id.clone(),
            tool_type: config.tool_type,
            session_id: self.session_id.clone(),
            data,
        });

        let validated = Validator::new(config.max_clock_skew_ms).validate(event)?;
        for warning in &validated.warnings {
            warn!("Event {}: {}", validated.event.event_id, warning);
        }
        Ok(if self.anonymize {
            anonymize(validated.event)
        } else {
            validated.event
        })
    }

    /// Collect an event. Returns its id, or `None` if it was dropped.
    pub fn collect(&self, data: EventData) -> Option<EventId> {
        if !self.is_collecting() {
            debug!("Not collecting, dropping {} event", data.kind());
            return None;
        }
        match self.prepare(data) {
            Ok(event) => Some(self.dispatch(event)),
            Err(e) => {
                warn!("Dropping invalid event: {}", e);
                self.observer.rejected(&e);
                None
            }
        }
    }

    /// Collect an event from untyped fields.
    ///
    /// Fields that do not parse are rejected like any other invalid event:
    /// logged, reported to the observer, and answered with `None`.
    pub fn collect_raw(&self, kind: EventKind, fields: Metadata) -> Option<EventId> {
        match parse_event_data(kind, fields) {
            Ok(data) => self.collect(data),
            Err(e) => {
                warn!("Dropping invalid event: {}", e);
                self.observer.rejected(&e);
                None
            }
        }
    }

    fn dispatch(&self, event: Event) -> EventId {
        let id = event.event_id.clone();
        self.notify_listeners(&event);
        self.observer.accepted(&event);
        self.buffer.enqueue(event);
        id
    }

    /// Record an annotation action.
    pub fn track_annotation(&self, data: AnnotationData) -> Option<EventId> {
        self.collect(EventData::Annotation(data))
    }

    /// Record a performance sample.
    pub fn track_performance(&self, data: PerformanceData) -> Option<EventId> {
        self.collect(EventData::Performance(data))
    }

    /// Record a user interaction.
    pub fn track_user_interaction(&self, data: InteractionData) -> Option<EventId> {
        self.collect(EventData::Interaction(data))
    }

    /// Record backend computation progress.
    pub fn track_backend_computation(&self, data: BackendComputationData) -> Option<EventId> {
        self.collect(EventData::BackendComputation(data))
    }

    /// Record a task status change.
    pub fn track_task_status(&self, data: TaskStatusData) -> Option<EventId> {
        self.collect(EventData::TaskStatus(data))
    }

    /// Record an error.
    pub fn track_error(&self, data: ErrorReportData) -> Option<EventId> {
        self.collect(EventData::Error(data))
    }

    /// Record a tool efficiency measurement.
    pub fn track_tool_efficiency(&self, data: ToolEfficiencyData) -> Option<EventId> {
        self.collect(EventData::ToolEfficiency(data))
    }

    /// Record a lifecycle status, optionally with time spent in the session.
    pub fn lifecycle(&self, status: TaskStatus, with_time_spent: bool) -> Option<EventId> {
        let mut data = TaskStatusData::new(status);
        if with_time_spent {
            data.time_spent = Some(self.time_spent());
        }
        self.track_task_status(data)
    }

    fn interaction(&self, data: InteractionData, sampling_rate: f64) {
        if sample(sampling_rate) {
            self.track_user_interaction(data);
        } else {
            self.observer.sampled_out();
        }
    }

    /// Turn an environment signal into an event.
    pub fn handle_signal(&self, signal: Signal) {
        let config = self.config.snapshot();
        let capture = &config.capture;
        match signal {
            Signal::Click { element, x, y } if capture.user_interactions => {
                let mut data = InteractionData::new(InteractionAction::Click, element);
                data.position = Some(Position::new(x, y));
                self.interaction(data, config.sampling_rate);
            }
            Signal::KeyDown { key, element, modifiers } if capture.user_interactions => {
                let mut data = InteractionData::new(InteractionAction::Keyboard, element);
                data.key_code = Some(key);
                data.modifiers = modifiers;
                self.interaction(data, config.sampling_rate);
            }
            Signal::Scroll { element } if capture.user_interactions => {
                let data = InteractionData::new(InteractionAction::Scroll, element);
                self.interaction(data, config.sampling_rate);
            }
            Signal::PointerMove { x, y } if capture.user_interactions => {
                let mut data = InteractionData::new(InteractionAction::MouseMove, "document");
                data.position = Some(Position::new(x, y));
                self.interaction(data, config.sampling_rate);
            }
            Signal::VisibilityChanged { visible: false } | Signal::Unload => {
                self.lifecycle(TaskStatus::Paused, true);
            }
            Signal::VisibilityChanged { visible: true } => {
                self.lifecycle(TaskStatus::Resumed, false);
            }
            Signal::RuntimeError { message, stack, context } if capture.errors => {
                self.track_error(ErrorReportData {
                    error_type: ErrorType::Runtime,
                    message,
                    stack,
                    severity: Severity::High,
                    context,
                });
            }
            other => debug!("Ignoring uncaptured signal {:?}", other),
        }
    }
}
