//! Event validation and sanitizing.
//!
//! Everything here is pure: no I/O, no clock reads except where a caller
//! asks for "now" explicitly.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::event::{Event, EventData, EventKind, Metadata};

/// Longest accepted id string.
pub const MAX_ID_LEN: usize = 100;

/// Metadata strings longer than this are truncated by [`sanitize`].
pub const MAX_METADATA_STRING_LEN: usize = 1000;

/// Error stacks longer than this are truncated by [`sanitize`].
pub const MAX_STACK_LEN: usize = 4000;

/// Metadata keys removed by [`anonymize`].
pub const SENSITIVE_METADATA_KEYS: [&str; 4] = ["userName", "email", "phoneNumber", "ipAddress"];

const EVENT_ID_PATTERN: &str = r"^[A-Za-z0-9_-]+$";

fn event_id_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(EVENT_ID_PATTERN).ok()).as_ref()
}

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Field path, as spelled in JSON
    pub field: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// An event failed validation and must not enter the buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} event: {}", join_errors(.errors))]
pub struct ValidationError {
    /// Kind of the rejected event
    pub kind: EventKind,
    /// Every rule that failed
    pub errors: Vec<FieldError>,
}

fn join_errors(errors: &[FieldError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Non-fatal finding about an accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Timestamp is further in the future than the allowed skew
    FutureTimestamp {
        /// How far ahead of "now" the timestamp is
        ahead_ms: i64,
    },
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationWarning::FutureTimestamp { ahead_ms } => {
                write!(f, "event timestamp is {}ms in the future", ahead_ms)
            }
        }
    }
}

/// An event that passed validation, with any warnings raised along the way.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated {
    /// The accepted event
    pub event: Event,
    /// Non-fatal findings
    pub warnings: Vec<ValidationWarning>,
}

/// Result of checking a whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Per-event errors, as `(index, error)`
    pub errors: Vec<(usize, ValidationError)>,
    /// Event ids appearing more than once
    pub duplicate_ids: Vec<String>,
    /// Per-event warnings, as `(index, warning)`
    pub warnings: Vec<(usize, ValidationWarning)>,
}

impl BatchReport {
    /// Whether every event is valid and ids are unique.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.duplicate_ids.is_empty()
    }
}

/// Rule-based event validator.
#[derive(Debug, Clone)]
pub struct Validator {
    max_skew_ms: i64,
}

impl Validator {
    /// Create a validator allowing `max_skew_ms` of future clock skew.
    pub fn new(max_skew_ms: u64) -> Self {
        Self {
            max_skew_ms: i64::try_from(max_skew_ms).unwrap_or(i64::MAX),
        }
    }

    /// Validate an event against the current wall clock.
    pub fn validate(&self, event: Event) -> Result<Validated, ValidationError> {
        self.validate_at(event, crate::now_millis())
    }

    /// Validate an event, treating `now_ms` as the current time.
    pub fn validate_at(&self, event: Event, now_ms: i64) -> Result<Validated, ValidationError> {
        let mut errors = Vec::new();
        check_common(&event, &mut errors);
        check_payload(&event.data, &mut errors);

        if !errors.is_empty() {
            return Err(ValidationError {
                kind: event.kind(),
                errors,
            });
        }

        let mut warnings = Vec::new();
        let ahead = event.timestamp.saturating_sub(now_ms);
        if ahead > self.max_skew_ms {
            warnings.push(ValidationWarning::FutureTimestamp { ahead_ms: ahead });
        }

        Ok(Validated { event, warnings })
    }

    /// Check a batch: every event, plus event id uniqueness.
    pub fn validate_batch(&self, events: &[Event]) -> BatchReport {
        let now = crate::now_millis();
        let mut report = BatchReport::default();
        let mut seen = std::collections::HashSet::new();

        for (index, event) in events.iter().enumerate() {
            match self.validate_at(event.clone(), now) {
                Ok(validated) => report
                    .warnings
                    .extend(validated.warnings.into_iter().map(|w| (index, w))),
                Err(e) => report.errors.push((index, e)),
            }
            let id = event.event_id.as_str();
            if !seen.insert(id) && !report.duplicate_ids.iter().any(|d| d == id) {
                report.duplicate_ids.push(id.to_string());
            }
        }

        report
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(60_000)
    }
}

fn check_id(field: &str, value: &str, errors: &mut Vec<FieldError>) {
    let len = value.chars().count();
    if len == 0 {
        errors.push(FieldError::new(field, "is required"));
    } else if len > MAX_ID_LEN {
        errors.push(FieldError::new(
            field,
            format!("must be no more than {} characters long", MAX_ID_LEN),
        ));
    }
}

fn check_non_empty(field: &str, value: &str, errors: &mut Vec<FieldError>) {
    if value.trim().is_empty() {
        errors.push(FieldError::new(field, "must not be empty"));
    }
}

fn check_non_negative(field: &str, value: Option<f64>, errors: &mut Vec<FieldError>) {
    if let Some(v) = value {
        if !v.is_finite() || v < 0.0 {
            errors.push(FieldError::new(field, "must be a finite number >= 0"));
        }
    }
}

fn check_percentage(field: &str, value: Option<f64>, errors: &mut Vec<FieldError>) {
    if let Some(v) = value {
        if !(0.0..=100.0).contains(&v) {
            errors.push(FieldError::new(field, "must be between 0 and 100"));
        }
    }
}

fn check_common(event: &Event, errors: &mut Vec<FieldError>) {
    let id = event.event_id.as_str();
    check_id("eventId", id, errors);
    if !id.is_empty() && event_id_regex().is_some_and(|re| !re.is_match(id)) {
        errors.push(FieldError::new("eventId", "invalid event ID format"));
    }
    if event.timestamp < 0 {
        errors.push(FieldError::new("timestamp", "must be at least 0"));
    }
    check_id("userId", &event.user_id, errors);
    check_id("projectId", &event.project_id, errors);
    check_id("taskId", &event.task_id, errors);
    check_id("sessionId", event.session_id.as_str(), errors);
}

fn check_payload(data: &EventData, errors: &mut Vec<FieldError>) {
    match data {
        EventData::Annotation(a) => {
            check_non_negative("duration", a.duration, errors);
        }
        EventData::Performance(p) => {
            check_id("metricName", &p.metric_name, errors);
            if !p.value.is_finite() {
                errors.push(FieldError::new("value", "must be a finite number"));
            }
        }
        EventData::Interaction(i) => {
            check_non_empty("element", &i.element, errors);
            check_non_negative("duration", i.duration, errors);
        }
        EventData::BackendComputation(b) => {
            check_non_empty("computationId", &b.computation_id, errors);
            check_non_negative("duration", b.duration, errors);
            check_percentage("progress", b.progress, errors);
        }
        EventData::TaskStatus(t) => {
            check_non_negative("timeSpent", t.time_spent, errors);
            check_percentage("completionPercentage", t.completion_percentage, errors);
        }
        EventData::Error(e) => {
            check_non_empty("message", &e.message, errors);
        }
        EventData::ToolEfficiency(t) => {
            check_non_empty("toolAction", &t.tool_action, errors);
            if t.start_time < 0 {
                errors.push(FieldError::new("startTime", "must be at least 0"));
            }
            if t.end_time < 0 {
                errors.push(FieldError::new("endTime", "must be at least 0"));
            }
            check_non_negative("duration", Some(t.duration), errors);
        }
    }
}

/// Build a payload from untyped producer fields.
///
/// Missing required fields and enum values outside the allowed set are
/// reported as a [`ValidationError`] instead of a panic or a default.
pub fn parse_event_data(kind: EventKind, mut fields: Metadata) -> Result<EventData, ValidationError> {
    fields.insert("type".to_string(), Value::String(kind.as_str().to_string()));
    serde_json::from_value(Value::Object(fields)).map_err(|e| ValidationError {
        kind,
        errors: vec![FieldError::new("data", e.to_string())],
    })
}

/// Normalize an event. Never fails.
///
/// Trims id strings, replaces a non-positive timestamp with now, truncates
/// oversized metadata strings and error stacks.
pub fn sanitize(mut event: Event) -> Event {
    event.event_id.trim_in_place();
    trim_string(&mut event.user_id);
    trim_string(&mut event.project_id);
    trim_string(&mut event.task_id);
    event.session_id.trim_in_place();

    if event.timestamp <= 0 {
        event.timestamp = crate::now_millis();
    }

    match &mut event.data {
        EventData::Annotation(a) => truncate_metadata(&mut a.metadata),
        EventData::Performance(p) => trim_string(&mut p.metric_name),
        EventData::Interaction(i) => trim_string(&mut i.element),
        EventData::BackendComputation(b) => trim_string(&mut b.computation_id),
        EventData::TaskStatus(_) => {}
        EventData::Error(e) => {
            truncate_metadata(&mut e.context);
            if let Some(stack) = &mut e.stack {
                truncate_string(stack, MAX_STACK_LEN);
            }
        }
        EventData::ToolEfficiency(t) => {
            trim_string(&mut t.tool_action);
            truncate_metadata(&mut t.metadata);
        }
    }

    event
}

/// Mask the user id and drop personally identifying metadata.
pub fn anonymize(mut event: Event) -> Event {
    let chars: Vec<char> = event.user_id.chars().collect();
    if chars.len() > 6 {
        let start: String = chars[..3].iter().collect();
        let end: String = chars[chars.len() - 3..].iter().collect();
        event.user_id = format!("{}***{}", start, end);
    }

    let metadata = match &mut event.data {
        EventData::Annotation(a) => Some(&mut a.metadata),
        EventData::Error(e) => Some(&mut e.context),
        EventData::ToolEfficiency(t) => Some(&mut t.metadata),
        _ => None,
    };
    if let Some(metadata) = metadata {
        for key in SENSITIVE_METADATA_KEYS {
            metadata.remove(key);
        }
    }

    event
}

fn trim_string(s: &mut String) {
    let trimmed = s.trim();
    if trimmed.len() != s.len() {
        *s = trimmed.to_string();
    }
}

fn truncate_string(s: &mut String, max_chars: usize) {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
        s.push_str("...");
    }
}

fn truncate_metadata(metadata: &mut Metadata) {
    for value in metadata.values_mut() {
        if let Value::String(s) = value {
            truncate_string(s, MAX_METADATA_STRING_LEN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::*;
    use crate::id::{EventId, SessionId};

    const NOW: i64 = 1_700_000_000_000;

    fn event(data: EventData) -> Event {
        Event {
            event_id: EventId::new(ToolType::ImageTool),
            timestamp: NOW,
            user_id: "user-1".into(),
            project_id: "project-1".into(),
            task_id: "task-1".into(),
            tool_type: ToolType::ImageTool,
            session_id: SessionId::new(),
            data,
        }
    }

    fn annotation() -> EventData {
        EventData::Annotation(AnnotationData::new(AnnotationAction::Start, AnnotationType::Polygon))
    }

    #[test]
    fn test_valid_event_passes() {
        let validated = Validator::default().validate_at(event(annotation()), NOW).unwrap();
        assert!(validated.warnings.is_empty());
    }

    #[test]
    fn test_missing_common_fields_rejected() {
        let mut e = event(annotation());
        e.user_id.clear();
        e.task_id = "x".repeat(101);
        let err = Validator::default().validate_at(e, NOW).unwrap_err();
        let fields: Vec<&str> = err.errors.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(fields, vec!["userId", "taskId"]);
        assert_eq!(err.kind, EventKind::Annotation);
    }

    #[test]
    fn test_bad_event_id_format() {
        let mut e = event(annotation());
        e.event_id = EventId::from_raw("has space!");
        let err = Validator::default().validate_at(e, NOW).unwrap_err();
        assert_eq!(err.errors[0].message, "invalid event ID format");
    }

    #[test]
    fn test_future_timestamp_is_warning_only() {
        let mut e = event(annotation());
        e.timestamp = NOW + 120_000;
        let validated = Validator::new(60_000).validate_at(e, NOW).unwrap();
        assert_eq!(validated.warnings, vec![ValidationWarning::FutureTimestamp { ahead_ms: 120_000 }]);
    }

    #[test]
    fn test_payload_rules() {
        let mut data = BackendComputationData {
            computation_type: ComputationType::ModelInference,
            status: ComputationStatus::Progress,
            computation_id: " ".into(),
            duration: Some(-1.0),
            progress: Some(140.0),
            result_size: None,
            error_message: None,
        };
        let err = Validator::default()
            .validate_at(event(EventData::BackendComputation(data.clone())), NOW)
            .unwrap_err();
        assert_eq!(err.errors.len(), 3);

        data.computation_id = "job-7".into();
        data.duration = Some(12.0);
        data.progress = Some(40.0);
        assert!(Validator::default()
            .validate_at(event(EventData::BackendComputation(data)), NOW)
            .is_ok());

        let perf = PerformanceData {
            metric_name: "fps".into(),
            value: f64::NAN,
            unit: MetricUnit::Fps,
            context: None,
        };
        assert!(Validator::default().validate_at(event(EventData::Performance(perf)), NOW).is_err());
    }

    #[test]
    fn test_parse_event_data_reports_missing_and_enum() {
        let mut fields = Metadata::new();
        fields.insert("action".into(), "start".into());
        let err = parse_event_data(EventKind::Annotation, fields).unwrap_err();
        assert!(err.errors[0].message.contains("annotationType"));

        let mut fields = Metadata::new();
        fields.insert("action".into(), "explode".into());
        fields.insert("annotationType".into(), "cuboid".into());
        let err = parse_event_data(EventKind::Annotation, fields).unwrap_err();
        assert!(err.errors[0].message.contains("explode"));

        let mut fields = Metadata::new();
        fields.insert("status".into(), "submitted".into());
        let data = parse_event_data(EventKind::TaskStatus, fields).unwrap();
        assert_eq!(data.kind(), EventKind::TaskStatus);
    }

    #[test]
    fn test_sanitize_trims_and_truncates() {
        let mut a = AnnotationData::new(AnnotationAction::Save, AnnotationType::Cuboid);
        a.metadata.insert("note".into(), Value::String("y".repeat(1500)));
        let mut e = event(EventData::Annotation(a));
        e.user_id = "  user-1 ".into();
        e.timestamp = 0;

        let e = sanitize(e);
        assert_eq!(e.user_id, "user-1");
        assert!(e.timestamp > 0);
        let EventData::Annotation(a) = &e.data else { panic!("kind changed") };
        let note = a.metadata["note"].as_str().unwrap();
        assert_eq!(note.len(), MAX_METADATA_STRING_LEN + 3);
        assert!(note.ends_with("..."));
    }

    #[test]
    fn test_anonymize() {
        let report = ErrorReportData {
            error_type: ErrorType::Ui,
            message: "boom".into(),
            stack: None,
            severity: Severity::Low,
            context: [("email".to_string(), Value::from("a@b.c")), ("view".to_string(), Value::from("2d"))]
                .into_iter()
                .collect(),
        };
        let mut e = event(EventData::Error(report));
        e.user_id = "annotator42".into();
        let e = anonymize(e);
        assert_eq!(e.user_id, "ann***r42");
        let EventData::Error(r) = &e.data else { panic!("kind changed") };
        assert!(r.context.get("email").is_none());
        assert!(r.context.get("view").is_some());
    }

    #[test]
    fn test_batch_duplicates() {
        let a = event(annotation());
        let b = a.clone();
        let report = Validator::default().validate_batch(&[a, b]);
        assert!(!report.is_valid());
        assert_eq!(report.duplicate_ids.len(), 1);
    }
}
