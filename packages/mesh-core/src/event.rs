//! Event bus message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema and encoding information carried with every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub version: String,
    pub content_type: String,
    pub encoding: String,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            content_type: "application/json".to_string(),
            encoding: "utf-8".to_string(),
        }
    }
}

/// Broker-style routing hints. The in-memory bus routes on `event_type` only.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRouting {
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub queue: Option<String>,
}

/// A published event. Immutable once the bus has stamped `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    /// Publish time (ms since epoch).
    pub timestamp: u64,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    pub data: Value,
    pub metadata: EventMetadata,
    pub routing: EventRouting,
}

impl EventMessage {
    /// Turns the message back into a draft, e.g. to republish it.
    #[must_use]
    pub fn to_draft(&self) -> NewEvent {
        NewEvent {
            event_type: self.event_type.clone(),
            source: self.source.clone(),
            correlation_id: self.correlation_id.clone(),
            causation_id: self.causation_id.clone(),
            data: self.data.clone(),
            metadata: self.metadata.clone(),
            routing: self.routing.clone(),
        }
    }
}

/// An event before publication: everything except `id` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub correlation_id: Option<String>,
    pub causation_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub metadata: EventMetadata,
    #[serde(default)]
    pub routing: EventRouting,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            source: source.into(),
            correlation_id: None,
            causation_id: None,
            data,
            metadata: EventMetadata::default(),
            routing: EventRouting::default(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Stamps the draft into an immutable message.
    #[must_use]
    pub fn into_message(self, id: String, timestamp: u64) -> EventMessage {
        EventMessage {
            id,
            event_type: self.event_type,
            source: self.source,
            timestamp,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            data: self.data,
            metadata: self.metadata,
            routing: self.routing,
        }
    }
}

/// Why one subscriber failed to take an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFailure {
    pub subscription_id: u64,
    /// Topic the subscriber was registered under (`*` for wildcard).
    pub topic: String,
    pub error: String,
}

/// An event with at least one failed delivery, waiting for retry or inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: EventMessage,
    pub failures: Vec<DeliveryFailure>,
    pub dead_lettered_at: u64,
}
