//! Provisioner interfaces for external systems.
//!
//! A provisioner creates, updates and deletes one kind of resource. The
//! orchestrator only calls it with fully resolved inputs and may call
//! `create` more than once for the same logical resource after a transient
//! failure, so implementations must be idempotent.

pub mod command;
pub mod delay;
pub mod static_resource;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{ErrorKind, Inputs, NodeId, Outputs};

pub use command::CommandProvisioner;
pub use delay::DelayProvisioner;
pub use static_resource::StaticProvisioner;

/// Failure reported by a provisioner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    /// Worth retrying (throttling, eventual consistency, network)
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help (bad input, quota, permission)
    #[error("{0}")]
    Permanent(String),
}

impl ProvisionError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Error kind recorded against the node
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::ProvisionerTransient,
            Self::Permanent(_) => ErrorKind::ProvisionerPermanent,
        }
    }
}

/// Trait for resource provisioners
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Resource type name (for reports and logs)
    fn name(&self) -> &str;

    /// Create the resource and return its outputs
    async fn create(&self, resource: &NodeId, inputs: &Inputs) -> Result<Outputs, ProvisionError>;

    /// Bring an existing resource in line with new inputs.
    ///
    /// Defaults to `create`, which idempotent provisioners treat as an upsert.
    async fn update(
        &self,
        resource: &NodeId,
        previous_inputs: &Inputs,
        previous_outputs: &Outputs,
        inputs: &Inputs,
    ) -> Result<Outputs, ProvisionError> {
        let _ = (previous_inputs, previous_outputs);
        self.create(resource, inputs).await
    }

    /// Delete the resource described by its recorded outputs
    async fn delete(&self, resource: &NodeId, outputs: &Outputs) -> Result<(), ProvisionError> {
        let _ = (resource, outputs);
        Ok(())
    }
}
