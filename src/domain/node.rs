//! Node identity and lifecycle.
//!
//! Every resource in a deployment is addressed by a `/`-separated path made
//! of the names of its enclosing component groups plus its own name.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Globally unique identifier of a resource node within one apply
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from a full path
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Create a node id for `name` inside the group at `scope`
    pub fn scoped(scope: &str, name: &str) -> Self {
        if scope.is_empty() {
            Self(name.to_string())
        } else {
            Self(format!("{}/{}", scope, name))
        }
    }

    /// The full path
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The last path segment (the name the node was declared with)
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for NodeId {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// Lifecycle state of a node during one apply.
///
/// `Pending -> Ready -> Running -> {Succeeded, Failed, Skipped}`. Only the
/// orchestrator drives transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on dependencies
    Pending,

    /// All dependencies succeeded, waiting for a concurrency slot
    Ready,

    /// Provisioner operation in flight
    Running,

    /// Operation completed and outputs resolved
    Succeeded,

    /// Operation failed after exhausting retries
    Failed,

    /// Never started because an upstream node failed
    Skipped,
}

impl NodeState {
    /// Whether the node reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The provisioner operation a node performed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// No recorded state, `create` was called
    Create,

    /// Recorded state with different inputs, `update` was called
    Update,

    /// Recorded state with identical inputs, recorded outputs reused
    Unchanged,

    /// Teardown of a recorded resource, `delete` was called
    Delete,

    /// Teardown of a resource with no recorded state
    Absent,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Unchanged => "unchanged",
            Self::Delete => "delete",
            Self::Absent => "absent",
        };
        f.write_str(s)
    }
}
