//! Unique identifiers for tracker entities.

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::event::ToolType;

/// Unique identifier for an Event.
///
/// Generated ids have the form `<tool>_<ulid>`. Ids read back from storage
/// or raw producer input are kept verbatim and checked by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a new EventId for the given tool.
    pub fn new(tool: ToolType) -> Self {
        Self(format!("{}_{}", tool.as_str(), Ulid::new()))
    }

    /// Wrap an existing id string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn trim_in_place(&mut self) {
        let trimmed = self.0.trim();
        if trimmed.len() != self.0.len() {
            self.0 = trimmed.to_string();
        }
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a tracking session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new SessionId
    pub fn new() -> Self {
        Self(format!("session_{}", Ulid::new()))
    }

    /// Wrap an existing id string.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn trim_in_place(&mut self) {
        let trimmed = self.0.trim();
        if trimmed.len() != self.0.len() {
            self.0 = trimmed.to_string();
        }
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for a Batch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(String);

impl BatchId {
    /// Generate a new BatchId
    pub fn new() -> Self {
        Self(format!("batch_{}", Ulid::new()))
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_event_ids_are_prefixed_and_unique() {
        let ids: HashSet<EventId> = (0..1000).map(|_| EventId::new(ToolType::ImageTool)).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.as_str().starts_with("image-tool_")));
    }

    #[test]
    fn test_event_id_trim() {
        let mut id = EventId::from_raw("  pc-tool_abc ");
        id.trim_in_place();
        assert_eq!(id.as_str(), "pc-tool_abc");
    }
}
