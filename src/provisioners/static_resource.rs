//! Static provisioner.
//!
//! Stands in for a resource that already exists or has no side effects:
//! create returns the inputs merged with a fixed set of outputs. Useful for
//! wiring externally managed values (account ids, regions) into a graph.

use async_trait::async_trait;

use super::{ProvisionError, Provisioner};
use crate::domain::{Inputs, NodeId, Outputs};

/// Provisioner that echoes inputs plus fixed outputs
#[derive(Debug, Clone, Default)]
pub struct StaticProvisioner {
    outputs: Outputs,
}

impl StaticProvisioner {
    /// Echo inputs only
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo inputs, adding (and overriding with) `outputs`
    pub fn with_outputs(outputs: Outputs) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    fn name(&self) -> &str {
        "static"
    }

    async fn create(&self, _resource: &NodeId, inputs: &Inputs) -> Result<Outputs, ProvisionError> {
        let mut outputs = inputs.clone();
        outputs.extend(self.outputs.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(outputs)
    }
}
