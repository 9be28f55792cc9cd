//! Apply journal events.
//!
//! Every transition the orchestrator makes is recorded as an immutable event.
//! Deployment state (what exists, with which inputs and outputs) is derived by
//! replaying these events in order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::NodeError;
use super::node::{NodeId, Operation};
use super::{Inputs, Outputs};

/// A single event in the append-only apply journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The apply this event belongs to
    pub apply_id: Uuid,

    /// Node this event concerns (if applicable)
    pub node_id: Option<NodeId>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Operation performed (node events)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    /// Idempotency key format: "{node_id}:{inputs_hash}"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    /// Resolved inputs (NodeSucceeded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Inputs>,

    /// Outputs returned by the provisioner (NodeSucceeded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Outputs>,

    /// Attempt number (NodeRetrying, NodeFailed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,

    /// Time taken in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error if failed or skipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,
}

impl ApplyEvent {
    /// Create a new event with the current timestamp
    pub fn new(
        apply_id: Uuid,
        node_id: Option<NodeId>,
        event_type: EventType,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            apply_id,
            node_id,
            event_type,
            summary: summary.into(),
            operation: None,
            idempotency_key: None,
            inputs: None,
            outputs: None,
            attempt: None,
            duration_ms: None,
            error: None,
        }
    }

    /// Attach the operation performed
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Attach the resource record written on success
    pub fn with_record(mut self, idempotency_key: String, inputs: Inputs, outputs: Outputs) -> Self {
        self.idempotency_key = Some(idempotency_key);
        self.inputs = Some(inputs);
        self.outputs = Some(outputs);
        self
    }

    /// Attach the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    /// Attach duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Attach error information
    pub fn with_error(mut self, error: NodeError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// An apply or destroy has started
    ApplyStarted,

    /// Every node succeeded
    ApplyCompleted,

    /// At least one node failed or was skipped
    ApplyFailed,

    /// The apply was cancelled
    ApplyAborted,

    /// A node's operation was dispatched
    NodeStarted,

    /// A node's create/update completed, or it was unchanged
    NodeSucceeded,

    /// A node's operation failed and will be retried
    NodeRetrying,

    /// A node failed permanently
    NodeFailed,

    /// A node was skipped because of an upstream failure
    NodeSkipped,

    /// A node was torn down (or had nothing to tear down)
    NodeDeleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;

    #[test]
    fn test_event_serialization() {
        let event = ApplyEvent::new(
            Uuid::new_v4(),
            Some(NodeId::new("Analytics/Bucket")),
            EventType::NodeStarted,
            "Starting create",
        )
        .with_operation(Operation::Create);

        let json = serde_json::to_string(&event).unwrap();
        let parsed: ApplyEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::NodeStarted);
        assert_eq!(parsed.operation, Some(Operation::Create));
        assert_eq!(parsed.node_id, Some(NodeId::new("Analytics/Bucket")));
        assert!(!json.contains("outputs"));
    }

    #[test]
    fn test_event_with_error() {
        let event = ApplyEvent::new(Uuid::new_v4(), None, EventType::NodeFailed, "failed")
            .with_attempt(3)
            .with_error(NodeError::new(ErrorKind::Timeout, "create exceeded 1s"));

        assert_eq!(event.attempt, Some(3));
        assert_eq!(event.error.unwrap().kind, ErrorKind::Timeout);
    }
}
