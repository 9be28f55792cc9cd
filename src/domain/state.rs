//! Deployment state reconstruction from journal events.
//!
//! A deployment is a named sequence of applies. Its state is the set of
//! resources that currently exist, with the inputs they were created from and
//! the outputs the provisioner returned.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{ApplyEvent, EventType};
use super::node::NodeId;
use super::{Inputs, Outputs};

/// What was recorded for one live resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Key derived from node id and resolved inputs
    pub idempotency_key: String,

    /// Inputs the resource was last created or updated with
    pub inputs: Inputs,

    /// Outputs the provisioner returned
    pub outputs: Outputs,

    /// When the record was written
    pub updated_at: DateTime<Utc>,
}

/// Outcome of the most recent apply in the journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LastApply {
    /// Started but no terminal event was written
    Interrupted,
    Completed,
    Failed,
    Aborted,
}

/// Live resources of a deployment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentState {
    /// Resource records keyed by node id
    pub resources: BTreeMap<NodeId, ResourceRecord>,

    /// Most recent apply id
    pub last_apply_id: Option<Uuid>,

    /// Outcome of the most recent apply
    pub last_apply: Option<LastApply>,

    /// Number of applies in the journal
    pub apply_count: usize,
}

impl DeploymentState {
    /// Reconstruct state from a sequence of events
    pub fn from_events(events: &[ApplyEvent]) -> Self {
        let mut state = Self::default();
        for event in events {
            state.apply_event(event);
        }
        state
    }

    /// Apply a single event to update state
    pub fn apply_event(&mut self, event: &ApplyEvent) {
        match event.event_type {
            EventType::ApplyStarted => {
                self.last_apply_id = Some(event.apply_id);
                self.last_apply = Some(LastApply::Interrupted);
                self.apply_count += 1;
            }
            EventType::ApplyCompleted => self.last_apply = Some(LastApply::Completed),
            EventType::ApplyFailed => self.last_apply = Some(LastApply::Failed),
            EventType::ApplyAborted => self.last_apply = Some(LastApply::Aborted),
            EventType::NodeSucceeded => {
                let (Some(node_id), Some(key), Some(inputs), Some(outputs)) = (
                    &event.node_id,
                    &event.idempotency_key,
                    &event.inputs,
                    &event.outputs,
                ) else {
                    return;
                };
                self.resources.insert(
                    node_id.clone(),
                    ResourceRecord {
                        idempotency_key: key.clone(),
                        inputs: inputs.clone(),
                        outputs: outputs.clone(),
                        updated_at: event.timestamp,
                    },
                );
            }
            EventType::NodeDeleted => {
                if let Some(ref node_id) = event.node_id {
                    self.resources.remove(node_id);
                }
            }
            EventType::NodeStarted
            | EventType::NodeRetrying
            | EventType::NodeFailed
            | EventType::NodeSkipped => {}
        }
    }

    /// Record for a node, if the resource exists
    pub fn get(&self, node_id: &NodeId) -> Option<&ResourceRecord> {
        self.resources.get(node_id)
    }

    /// Whether any resource is recorded
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Number of recorded resources
    pub fn len(&self) -> usize {
        self.resources.len()
    }
}
