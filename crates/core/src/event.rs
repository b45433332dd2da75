//! Event model - the unit of telemetry collected from annotation tools.

use crate::id::{EventId, SessionId};
use serde::{Deserialize, Serialize};

/// Free-form metadata attached to events.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Annotation tool that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ToolType {
    /// 2D image annotation tool
    ImageTool,
    /// 3D point-cloud annotation tool
    #[default]
    PcTool,
    /// Text annotation tool
    TextTool,
}

impl ToolType {
    /// Wire name of the tool.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::ImageTool => "image-tool",
            ToolType::PcTool => "pc-tool",
            ToolType::TextTool => "text-tool",
        }
    }
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image-tool" => Ok(ToolType::ImageTool),
            "pc-tool" => Ok(ToolType::PcTool),
            "text-tool" => Ok(ToolType::TextTool),
            other => Err(format!("unknown tool type: {}", other)),
        }
    }
}

/// A telemetry event: common envelope plus a kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier (unique within a process lifetime)
    pub event_id: EventId,

    /// Wall clock, milliseconds since epoch
    pub timestamp: i64,

    /// User that produced the event
    pub user_id: String,

    /// Project the work belongs to
    pub project_id: String,

    /// Task the work belongs to
    pub task_id: String,

    /// Tool that produced the event
    pub tool_type: ToolType,

    /// Active tracking session
    pub session_id: SessionId,

    /// Kind-specific payload
    pub data: EventData,
}

impl Event {
    /// The kind of this event.
    pub fn kind(&self) -> EventKind {
        self.data.kind()
    }
}

/// Discriminant of [`EventData`], used for listener routing and raw collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Annotation lifecycle
    Annotation,
    /// Client performance metric
    Performance,
    /// User interaction
    Interaction,
    /// Backend computation progress
    BackendComputation,
    /// Task status change
    TaskStatus,
    /// Error report
    Error,
    /// Tool efficiency measurement
    ToolEfficiency,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 7] = [
        EventKind::Annotation,
        EventKind::Performance,
        EventKind::Interaction,
        EventKind::BackendComputation,
        EventKind::TaskStatus,
        EventKind::Error,
        EventKind::ToolEfficiency,
    ];

    /// Tag used in serialized events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Annotation => "annotation",
            EventKind::Performance => "performance",
            EventKind::Interaction => "interaction",
            EventKind::BackendComputation => "backend_computation",
            EventKind::TaskStatus => "task_status",
            EventKind::Error => "error",
            EventKind::ToolEfficiency => "tool_efficiency",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event kind: {}", s))
    }
}

/// Kind-specific event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    /// Annotation lifecycle
    Annotation(AnnotationData),
    /// Client performance metric
    Performance(PerformanceData),
    /// User interaction
    Interaction(InteractionData),
    /// Backend computation progress
    BackendComputation(BackendComputationData),
    /// Task status change
    TaskStatus(TaskStatusData),
    /// Error report
    Error(ErrorReportData),
    /// Tool efficiency measurement
    ToolEfficiency(ToolEfficiencyData),
}

impl EventData {
    /// The kind of this payload.
    pub fn kind(&self) -> EventKind {
        match self {
            EventData::Annotation(_) => EventKind::Annotation,
            EventData::Performance(_) => EventKind::Performance,
            EventData::Interaction(_) => EventKind::Interaction,
            EventData::BackendComputation(_) => EventKind::BackendComputation,
            EventData::TaskStatus(_) => EventKind::TaskStatus,
            EventData::Error(_) => EventKind::Error,
            EventData::ToolEfficiency(_) => EventKind::ToolEfficiency,
        }
    }
}

/// 2D/3D position of an object or pointer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
    /// Z coordinate (point-cloud tool only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
}

impl Position {
    /// A 2D position.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }
}

/// Annotation action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationAction {
    /// Annotation started
    Start,
    /// Annotation completed
    Complete,
    /// Annotation modified
    Modify,
    /// Annotation deleted
    Delete,
    /// Annotation saved
    Save,
}

/// Shape or class of annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationType {
    /// 3D box
    Cuboid,
    /// Closed polygon
    Polygon,
    /// Open polyline
    Polyline,
    /// Single point
    Point,
    /// Text span
    Text,
    /// Whole-item classification
    Classification,
    /// Pixel/point segmentation
    Segmentation,
}

/// Annotation event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationData {
    /// Action taken
    pub action: AnnotationAction,
    /// Annotation shape
    pub annotation_type: AnnotationType,
    /// Annotated object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    /// Duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Object position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Additional metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

impl AnnotationData {
    /// Create an annotation payload.
    pub fn new(action: AnnotationAction, annotation_type: AnnotationType) -> Self {
        Self {
            action,
            annotation_type,
            object_id: None,
            duration: None,
            position: None,
            metadata: Metadata::new(),
        }
    }
}

/// Metric unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    /// Milliseconds
    Ms,
    /// Frames per second
    Fps,
    /// Megabytes
    Mb,
    /// Plain count
    Count,
}

/// Rendering context of a performance sample.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceContext {
    /// Render mode in use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_mode: Option<String>,
    /// Size of the data being rendered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_size: Option<f64>,
    /// Scene complexity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<f64>,
}

/// Performance event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceData {
    /// Metric name (e.g. `fps`, `memory_usage`)
    pub metric_name: String,
    /// Metric value
    pub value: f64,
    /// Metric unit
    pub unit: MetricUnit,
    /// Rendering context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<PerformanceContext>,
}

/// Interaction action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    /// Pointer click
    Click,
    /// Pointer drag
    Drag,
    /// Scroll
    Scroll,
    /// Key press
    Keyboard,
    /// Pointer movement
    MouseMove,
}

/// User interaction event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionData {
    /// Interaction action
    pub action: InteractionAction,
    /// Target element selector
    pub element: String,
    /// Duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Pointer or scroll position
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Key code for keyboard interactions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_code: Option<String>,
    /// Active modifier keys
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modifiers: Vec<String>,
}

impl InteractionData {
    /// Create an interaction payload.
    pub fn new(action: InteractionAction, element: impl Into<String>) -> Self {
        Self {
            action,
            element: element.into(),
            duration: None,
            position: None,
            key_code: None,
            modifiers: Vec::new(),
        }
    }
}

/// Kind of backend computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationType {
    /// Automatic annotation
    AutoAnnotation,
    /// Model inference
    ModelInference,
    /// Data processing
    DataProcessing,
    /// Quality check
    QualityCheck,
}

/// Backend computation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputationStatus {
    /// Started
    Start,
    /// In progress
    Progress,
    /// Completed
    Complete,
    /// Failed
    Error,
}

/// Backend computation event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendComputationData {
    /// Computation kind
    pub computation_type: ComputationType,
    /// Computation status
    pub status: ComputationStatus,
    /// Computation id
    pub computation_id: String,
    /// Duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// Progress percentage (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    /// Result size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_size: Option<u64>,
    /// Error message when status is `error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Assigned to the user
    Assigned,
    /// Work started
    Started,
    /// Work paused
    Paused,
    /// Work resumed
    Resumed,
    /// Work completed
    Completed,
    /// Submitted for review
    Submitted,
    /// Reviewed
    Reviewed,
}

impl TaskStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Assigned => "assigned",
            TaskStatus::Started => "started",
            TaskStatus::Paused => "paused",
            TaskStatus::Resumed => "resumed",
            TaskStatus::Completed => "completed",
            TaskStatus::Submitted => "submitted",
            TaskStatus::Reviewed => "reviewed",
        }
    }
}

/// Task status event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusData {
    /// New status
    pub status: TaskStatus,
    /// Previous status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<String>,
    /// Time spent in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent: Option<f64>,
    /// Completion percentage (0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_percentage: Option<f64>,
    /// Quality score
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

impl TaskStatusData {
    /// Create a task status payload.
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            previous_status: None,
            time_spent: None,
            completion_percentage: None,
            quality_score: None,
        }
    }
}

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Runtime failure
    Runtime,
    /// Network failure
    Network,
    /// Validation failure
    Validation,
    /// UI failure
    Ui,
    /// Performance problem
    Performance,
}

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Low
    Low,
    /// Medium
    Medium,
    /// High
    High,
    /// Critical
    Critical,
}

/// Error report payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReportData {
    /// Error category
    pub error_type: ErrorType,
    /// Error message
    pub message: String,
    /// Stack trace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Severity
    pub severity: Severity,
    /// Additional context
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub context: Metadata,
}

/// Tool efficiency payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEfficiencyData {
    /// Tool action measured
    pub tool_action: String,
    /// Start, milliseconds since epoch
    pub start_time: i64,
    /// End, milliseconds since epoch
    pub end_time: i64,
    /// Duration in milliseconds
    pub duration: f64,
    /// Whether the action succeeded
    pub success: bool,
    /// Retries needed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    /// Failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    /// Additional metadata
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: Metadata,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event {
            event_id: EventId::new(ToolType::PcTool),
            timestamp: 1_700_000_000_000,
            user_id: "u1".to_string(),
            project_id: "p1".to_string(),
            task_id: "t1".to_string(),
            tool_type: ToolType::PcTool,
            session_id: SessionId::new(),
            data: EventData::Interaction(InteractionData::new(InteractionAction::MouseMove, "#canvas")),
        }
    }

    #[test]
    fn test_event_json_shape() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["toolType"], "pc-tool");
        assert_eq!(json["data"]["type"], "interaction");
        assert_eq!(json["data"]["action"], "mouse_move");
        assert!(json["data"].get("modifiers").is_none());

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_kind_names_parse() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("user_interaction".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let raw = serde_json::json!({
            "type": "annotation",
            "action": "explode",
            "annotationType": "cuboid"
        });
        assert!(serde_json::from_value::<EventData>(raw).is_err());
    }
}
