//! Per-node runtime errors.
//!
//! These are recorded in reports and journal events rather than unwound, so
//! they are plain data: a kind, a message and, for skipped nodes, the chain
//! of nodes that led back to the original failure.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::node::NodeId;

/// Classification of a node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provisioner reported a retryable failure
    ProvisionerTransient,

    /// Provisioner reported a failure that retrying will not fix
    ProvisionerPermanent,

    /// Operation exceeded its timeout
    Timeout,

    /// Node was skipped because a dependency failed
    UpstreamFailure,

    /// An output cell was resolved twice
    DoubleResolution,

    /// Provisioner did not return a declared output
    MissingOutput,

    /// Apply was cancelled before the node started
    Aborted,
}

impl ErrorKind {
    /// Whether the retry policy applies to this kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProvisionerTransient | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProvisionerTransient => "transient provisioner error",
            Self::ProvisionerPermanent => "permanent provisioner error",
            Self::Timeout => "timeout",
            Self::UpstreamFailure => "upstream failure",
            Self::DoubleResolution => "double resolution",
            Self::MissingOutput => "missing output",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// A failure attributed to one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    /// What went wrong
    pub kind: ErrorKind,

    /// Human-readable detail
    pub message: String,

    /// For `UpstreamFailure`: the failed node first, this node last
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstream_chain: Vec<NodeId>,
}

impl NodeError {
    /// Create an error of the given kind
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            upstream_chain: Vec::new(),
        }
    }

    /// Error for a node skipped because of the failure at the head of `chain`
    pub fn upstream(chain: Vec<NodeId>) -> Self {
        let message = match chain.first() {
            Some(root) => format!("skipped due to upstream failure of '{}'", root),
            None => "skipped due to upstream failure".to_string(),
        };
        Self {
            kind: ErrorKind::UpstreamFailure,
            message,
            upstream_chain: chain,
        }
    }

    /// Error for a node that never started because the apply was cancelled
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "apply was aborted before the node started")
    }

    /// The node whose failure caused this one, if this is an upstream failure
    pub fn root_cause(&self) -> Option<&NodeId> {
        match self.kind {
            ErrorKind::UpstreamFailure => self.upstream_chain.first(),
            _ => None,
        }
    }
}
