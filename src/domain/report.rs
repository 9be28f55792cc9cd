//! Apply reports.
//!
//! A report is what the caller gets back from one apply: one entry per node
//! with its final state, plus an overall verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::NodeError;
use super::node::{NodeId, NodeState, Operation};
use super::{Inputs, Outputs};

/// Whether the apply creates/updates or tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyKind {
    Apply,
    Destroy,
}

/// Overall outcome of an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every node succeeded
    Succeeded,

    /// At least one node failed or was skipped
    Failed,

    /// Cancelled before the graph drained
    Aborted,
}

impl Verdict {
    /// Process exit status for a CLI caller
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed => 1,
            Self::Aborted => 130,
        }
    }
}

/// Final outcome of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    /// Node identifier
    pub node_id: NodeId,

    /// Provisioner type name
    pub provisioner: String,

    /// Final state
    pub state: NodeState,

    /// Operation performed, if the node ran
    pub operation: Option<Operation>,

    /// Number of provisioner calls made
    pub attempts: u32,

    /// When the operation was dispatched
    pub started_at: Option<DateTime<Utc>>,

    /// When the node reached its final state
    pub finished_at: Option<DateTime<Utc>>,

    /// Time spent running, in milliseconds
    pub duration_ms: Option<u64>,

    /// Resolved inputs
    pub inputs: Option<Inputs>,

    /// Outputs returned by the provisioner
    pub outputs: Option<Outputs>,

    /// Failure, upstream failure or abort reason
    pub error: Option<NodeError>,
}

impl NodeReport {
    /// Fresh report for a node that has not run yet
    pub fn pending(node_id: NodeId, provisioner: impl Into<String>) -> Self {
        Self {
            node_id,
            provisioner: provisioner.into(),
            state: NodeState::Pending,
            operation: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            inputs: None,
            outputs: None,
            error: None,
        }
    }
}

/// Consolidated result of one apply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    /// Unique identifier for this apply
    pub apply_id: Uuid,

    /// Name of the root component group
    pub name: String,

    /// Apply or destroy
    pub kind: ApplyKind,

    /// Overall outcome
    pub verdict: Verdict,

    /// When the apply started
    pub started_at: DateTime<Utc>,

    /// When the graph drained
    pub completed_at: DateTime<Utc>,

    /// Per-node outcomes in declaration order
    pub nodes: Vec<NodeReport>,
}

impl ApplyReport {
    /// Check if every node succeeded
    pub fn is_success(&self) -> bool {
        self.verdict == Verdict::Succeeded
    }

    /// Process exit status for a CLI caller
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    /// Report for a specific node
    pub fn node(&self, node_id: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.node_id.as_str() == node_id)
    }

    /// Nodes that ended in the given state
    pub fn nodes_in(&self, state: NodeState) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(move |n| n.state == state)
    }

    /// Count nodes by final state
    pub fn count(&self, state: NodeState) -> usize {
        self.nodes_in(state).count()
    }
}
