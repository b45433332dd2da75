//! JSON payloads accepted by the events API.
//!
//! Internal events are reshaped per kind: `interaction` travels as
//! `user_interaction`, timestamps become ISO-8601 strings, and each kind's
//! payload is flattened into the `data` object the server schema expects.

use effm_core::{millis_to_rfc3339, Batch, ClientEnvironment, Event, EventData, EventKind, ToolType};
use serde::Serialize;
use serde_json::{json, Value};

/// Body of `POST /events/batch`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireBatch {
    /// Batch identifier
    pub batch_id: String,
    /// Events in delivery order
    pub events: Vec<WireEvent>,
    /// Client descriptors
    pub metadata: ClientEnvironment,
}

impl WireBatch {
    /// Reshape a batch for the wire.
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id().to_string(),
            events: batch.events().iter().map(WireEvent::from_event).collect(),
            metadata: batch.environment().clone(),
        }
    }
}

/// One event as the server sees it. Also the body of `POST /events/single`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireEvent {
    /// Server-side event type name
    pub event_type: &'static str,
    /// ISO-8601 UTC
    pub timestamp: String,
    /// User
    pub user_id: String,
    /// Project
    pub project_id: String,
    /// Task
    pub task_id: String,
    /// Session
    pub session_id: String,
    /// Producing tool
    pub tool: ToolType,
    /// Kind-specific payload
    pub data: Value,
    /// Event-level metadata
    pub metadata: Value,
}

impl WireEvent {
    /// Reshape one event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_type: wire_event_type(event.kind()),
            timestamp: millis_to_rfc3339(event.timestamp),
            user_id: event.user_id.clone(),
            project_id: event.project_id.clone(),
            task_id: event.task_id.clone(),
            session_id: event.session_id.to_string(),
            tool: event.tool_type,
            data: event_data(event),
            metadata: json!({ "eventId": event.event_id.as_str() }),
        }
    }
}

/// Server-side name of an event kind.
pub fn wire_event_type(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Interaction => "user_interaction",
        other => other.as_str(),
    }
}

fn metric(name: &str, wanted: &str, value: f64) -> Value {
    if name == wanted {
        json!(value)
    } else {
        Value::Null
    }
}

/// Kind-specific `data` object.
pub fn event_data(event: &Event) -> Value {
    match &event.data {
        EventData::Annotation(d) => json!({
            "type": d.action,
            "annotationType": d.annotation_type,
            "duration": d.duration.unwrap_or(0.0),
            "success": true,
            "objectId": d.object_id,
            "error": Value::Null,
            "metadata": d.metadata,
        }),
        EventData::Performance(d) => json!({
            "fps": metric(&d.metric_name, "fps", d.value),
            "memory_usage": metric(&d.metric_name, "memory_usage", d.value),
            "cpu_usage": metric(&d.metric_name, "cpu_usage", d.value),
            "render_time": metric(&d.metric_name, "render_time", d.value),
            "network_latency": metric(&d.metric_name, "network_latency", d.value),
            "metadata": d.context.clone().unwrap_or_default(),
        }),
        EventData::Interaction(d) => json!({
            "action": d.action,
            "element": d.element,
            "duration": d.duration,
            "coordinates": d.position,
            "metadata": {},
        }),
        EventData::BackendComputation(d) => json!({
            "type": d.computation_type,
            "computationId": d.computation_id,
            "status": d.status,
            "duration": d.duration,
            "progress": d.progress,
            "resultSize": d.result_size,
            "success": d.status != effm_core::ComputationStatus::Error,
            "error": d.error_message,
            "metadata": {},
        }),
        EventData::TaskStatus(d) => json!({
            "type": d.status,
            "taskId": event.task_id,
            "duration": d.time_spent,
            "success": d.status == effm_core::TaskStatus::Completed,
            "annotationCount": Value::Null,
            "error": Value::Null,
            "metadata": {},
        }),
        EventData::Error(d) => json!({
            "type": d.error_type,
            "message": d.message,
            "stack": d.stack,
            "severity": d.severity,
            "context": d.context,
        }),
        EventData::ToolEfficiency(d) => json!({
            "tool": event.tool_type,
            "action": d.tool_action,
            "duration": d.duration,
            "success": d.success,
            "efficiency_score": Value::Null,
            "metadata": {},
        }),
    }
}
