//! nuage - Dependency-ordered provisioning orchestrator
//!
//! Builds a graph of resources from nested component groups, then creates,
//! updates or tears them down through pluggable provisioners, running
//! independent resources concurrently.
//!
//! # Architecture
//!
//! - Resources declare inputs in terms of other resources' output cells;
//!   every cell an input reads becomes a dependency edge
//! - The orchestrator dispatches nodes as their dependencies succeed and
//!   resolves each node's cells exactly once
//! - Every transition is journaled; deployment state is derived by replaying
//!   the journal, which makes re-applies idempotent
//!
//! # Modules
//!
//! - `core`: Cells, resources, groups, graph, orchestrator, journal
//! - `domain`: Data structures (NodeId, ApplyEvent, ApplyReport, state)
//! - `provisioners`: The provisioner trait and built-in implementations
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Show the execution plan
//! nuage plan analytics.yaml
//!
//! # Apply, then re-apply (unchanged resources are left alone)
//! nuage apply analytics.yaml --deployment prod
//!
//! # Tear down in reverse dependency order
//! nuage destroy analytics.yaml --deployment prod
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod provisioners;

// Re-export main types at crate root for convenience
pub use config::EngineConfig;
pub use core::{
    ComponentGroup, DependencyGraph, Definition, InputValue, Journal, Orchestrator, OutputCell,
    RetryPolicy,
};
pub use domain::{ApplyReport, DeploymentState, NodeError, NodeId, NodeState, Operation, Verdict};
pub use provisioners::{CommandProvisioner, DelayProvisioner, ProvisionError, Provisioner, StaticProvisioner};
