//! Delay provisioner.
//!
//! Some resources are not usable as soon as they are created. An access
//! policy, for example, takes a while to propagate before a service that
//! assumes the role can be created. A delay node placed between the two makes
//! that wait part of the graph:
//!
//! ```text
//! role_policy -> propagation_delay -> event_stream
//! ```
//!
//! The wait is an async sleep, so the delay holds its own concurrency slot
//! but never blocks other ready nodes.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{ProvisionError, Provisioner};
use crate::domain::{Inputs, NodeId, Outputs};

/// Input that overrides the configured duration
pub const DELAY_SECONDS_INPUT: &str = "delay_seconds";

/// Provisioner whose create waits, then echoes its inputs
#[derive(Debug, Clone)]
pub struct DelayProvisioner {
    duration: Duration,
}

impl DelayProvisioner {
    /// Create a delay of the given duration
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Create a delay of whole seconds
    pub fn from_secs(seconds: u64) -> Self {
        Self::new(Duration::from_secs(seconds))
    }

    /// The configured duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Duration for this call, honouring a `delay_seconds` input
    fn effective_duration(&self, resource: &NodeId, inputs: &Inputs) -> Duration {
        match inputs.get(DELAY_SECONDS_INPUT) {
            None => self.duration,
            Some(value) => match value.as_f64().and_then(|seconds| Duration::try_from_secs_f64(seconds).ok()) {
                Some(duration) => duration,
                None => {
                    warn!(%resource, %value, "Ignoring invalid delay_seconds input");
                    self.duration
                }
            },
        }
    }
}

#[async_trait]
impl Provisioner for DelayProvisioner {
    fn name(&self) -> &str {
        "delay"
    }

    async fn create(&self, resource: &NodeId, inputs: &Inputs) -> Result<Outputs, ProvisionError> {
        let duration = self.effective_duration(resource, inputs);
        debug!(%resource, delay_ms = duration.as_millis() as u64, "Waiting");
        tokio::time::sleep(duration).await;
        Ok(inputs.clone())
    }
}
