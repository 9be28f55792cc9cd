//! Build-time errors.
//!
//! These abort an apply before any provisioner is called. Runtime failures
//! are per node and live in [`crate::domain::NodeError`].

use thiserror::Error;

use crate::domain::NodeId;

/// Errors raised while declaring resources and groups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("'{node}' has no declared output '{output}'")]
    UnknownOutput { node: String, output: String },

    #[error("group '{group}' must be created with '{parent}'.subgroup() to be added to it")]
    ForeignGroup { group: String, parent: String },

    #[error("'{scope}' has no resource or component named '{name}' declared before '{referrer}'")]
    UnknownReference {
        scope: String,
        name: String,
        referrer: String,
    },

    #[error("invalid reference '{reference}' in '{referrer}': expected <name>.<output>")]
    InvalidReference { reference: String, referrer: String },

    #[error("unterminated '${{' in template for '{referrer}'")]
    UnterminatedTemplate { referrer: String },

    #[error("definition '{name}' is invalid: {reason}")]
    Invalid { name: String, reason: String },
}

/// Errors raised while building the dependency graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected { cycle: Vec<NodeId> },

    #[error("duplicate identifier '{id}'")]
    DuplicateIdentifier { id: String },

    #[error("'{node}' depends on unknown resource or group '{dependency}'")]
    UnknownDependency { node: NodeId, dependency: String },
}

fn format_cycle(cycle: &[NodeId]) -> String {
    cycle
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}
