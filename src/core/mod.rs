//! Core orchestration logic.
//!
//! This module contains:
//! - Cell: write-once output cells
//! - Resource / Group: the declaration tree
//! - Graph: dependency graph builder
//! - Orchestrator: concurrent execution engine
//! - Journal: append-only apply journal and deployment lock
//! - Definition: YAML definitions

pub mod cell;
pub mod definition;
pub mod error;
pub mod graph;
pub mod group;
pub mod journal;
pub mod orchestrator;
pub mod resource;
pub mod retry;

// Re-export commonly used types
pub use cell::{CellError, CellOutcome, CellStatus, OutputCell};
pub use definition::{Definition, InputSpec, ProvisionerSpec, ResourceSpec};
pub use error::{DefinitionError, GraphError};
pub use graph::{DependencyGraph, EdgeKind};
pub use group::{ComponentGroup, GroupHandle};
pub use journal::{hash_inputs, idempotency_key, DeploymentLock, Journal};
pub use orchestrator::Orchestrator;
pub use resource::{DependencyRef, InputValue, ResourceBuilder, ResourceHandle, ResourceNode};
pub use retry::RetryPolicy;
