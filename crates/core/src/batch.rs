//! Batches - the unit of delivery and durable persistence.

use crate::event::{Event, ToolType};
use crate::id::BatchId;
use serde::{Deserialize, Serialize};

/// Descriptors of the client that produced a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvironment {
    /// Producing tool
    pub tool: ToolType,
    /// Client version
    pub version: String,
    /// User agent string
    pub user_agent: String,
    /// Screen resolution (`WxH`) or `unknown`
    pub screen_resolution: String,
    /// Time zone of the client
    pub time_zone: String,
}

impl ClientEnvironment {
    /// Describe the current process.
    pub fn detect(tool: ToolType, version: impl Into<String>) -> Self {
        let version = version.into();
        Self {
            tool,
            user_agent: format!(
                "effm/{} ({}; {})",
                version,
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            version,
            screen_resolution: "unknown".to_string(),
            time_zone: chrono::Local::now().offset().to_string(),
        }
    }
}

/// An ordered group of events submitted together in one delivery attempt.
///
/// Fields are private so a batch cannot change once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    batch_id: BatchId,
    created_at: i64,
    events: Vec<Event>,
    environment: ClientEnvironment,
}

impl Batch {
    /// Create a new batch from events in delivery order.
    pub fn new(events: Vec<Event>, environment: ClientEnvironment) -> Self {
        Self {
            batch_id: BatchId::new(),
            created_at: crate::now_millis(),
            events,
            environment,
        }
    }

    /// Batch identifier.
    pub fn batch_id(&self) -> &BatchId {
        &self.batch_id
    }

    /// Creation time, milliseconds since epoch.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Events in delivery order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Client descriptors.
    pub fn environment(&self) -> &ClientEnvironment {
        &self.environment
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Give the events back, consuming the batch.
    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    /// Split into batches of at most `max` events, preserving order.
    ///
    /// The first chunk keeps the original batch id.
    pub fn split(self, max: usize) -> Vec<Batch> {
        let max = max.max(1);
        if self.events.len() <= max {
            return vec![self];
        }
        let Batch { batch_id, created_at, events, environment } = self;
        let mut chunks = Vec::with_capacity(events.len().div_ceil(max));
        let mut iter = events.into_iter().peekable();
        let mut first = true;
        while iter.peek().is_some() {
            let chunk: Vec<Event> = iter.by_ref().take(max).collect();
            chunks.push(Batch {
                batch_id: if first { batch_id.clone() } else { BatchId::new() },
                created_at,
                events: chunk,
                environment: environment.clone(),
            });
            first = false;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventData, TaskStatus, TaskStatusData};
    use crate::id::{EventId, SessionId};

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

    #[test]
    fn test_split_preserves_order() {
        let env = ClientEnvironment::detect(ToolType::TextTool, "0.1.0");
        let batch = Batch::new((1..=5).map(event).collect(), env);
        let id = batch.batch_id().clone();

        let chunks = batch.split(2);
        assert_eq!(chunks.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(chunks[0].batch_id(), &id);
        assert_ne!(chunks[1].batch_id(), &id);
        let stamps: Vec<i64> = chunks.iter().flat_map(|b| b.events().iter().map(|e| e.timestamp)).collect();
        assert_eq!(stamps, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_split_small_batch_is_untouched() {
        let env = ClientEnvironment::detect(ToolType::TextTool, "0.1.0");
        let batch = Batch::new(vec![event(1)], env);
        let copy = batch.clone();
        assert_eq!(batch.split(10), vec![copy]);
    }
}
