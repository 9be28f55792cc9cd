//! Domain types for the nuage orchestrator.
//!
//! This module contains the core data structures:
//! - Node: identifiers, lifecycle states, operations
//! - Error: per-node failures
//! - Events: immutable records of apply transitions
//! - Report: the consolidated outcome of one apply
//! - State: deployment state replayed from events

use std::collections::BTreeMap;

pub mod error;
pub mod events;
pub mod node;
pub mod report;
pub mod state;

// Re-export commonly used types
pub use error::{ErrorKind, NodeError};
pub use events::{ApplyEvent, EventType};
pub use node::{NodeId, NodeState, Operation};
pub use report::{ApplyKind, ApplyReport, NodeReport, Verdict};
pub use state::{DeploymentState, LastApply, ResourceRecord};

/// Resolved values passed to a provisioner
pub type Inputs = BTreeMap<String, serde_json::Value>;

/// Values returned by a provisioner
pub type Outputs = BTreeMap<String, serde_json::Value>;
