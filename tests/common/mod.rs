//! Test provisioners shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::Instant;

use nuage::domain::{Inputs, NodeId, Outputs};
use nuage::provisioners::{ProvisionError, Provisioner};

/// One provisioner call boundary
#[derive(Debug, Clone)]
pub struct Entry {
    pub node: String,
    pub operation: &'static str,
    pub phase: &'static str,
    pub at: Instant,
}

/// Ordered record of provisioner calls across every provisioner sharing it
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Entry>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, node: &NodeId, operation: &'static str, phase: &'static str) {
        self.0.lock().unwrap().push(Entry {
            node: node.to_string(),
            operation,
            phase,
            at: Instant::now(),
        });
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first matching entry
    pub fn position(&self, node: &str, phase: &str) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| e.node == node && e.phase == phase)
    }

    /// Index of the first entry for `operation` on `node` at `phase`
    pub fn index_of(&self, node: &str, operation: &str, phase: &str) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| e.node == node && e.operation == operation && e.phase == phase)
    }

    /// When the first matching entry was recorded
    pub fn time_of(&self, node: &str, phase: &str) -> Option<Instant> {
        self.entries()
            .into_iter()
            .find(|e| e.node == node && e.phase == phase)
            .map(|e| e.at)
    }

    /// Number of started calls of `operation`
    pub fn count(&self, operation: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.operation == operation && e.phase == "start")
            .count()
    }

    /// Nodes in the order their `operation` calls started
    pub fn started(&self, operation: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.operation == operation && e.phase == "start")
            .map(|e| e.node)
            .collect()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// In-memory cloud: create is an upsert keyed by node id, so a second
/// create for the same node answers "already exists" with the same outputs
pub struct FakeCloud {
    kind: String,
    log: CallLog,
    latency: Duration,
    resources: Mutex<HashMap<NodeId, Outputs>>,
    counter: AtomicU32,
}

impl FakeCloud {
    pub fn new(kind: &str, log: &CallLog) -> Self {
        Self {
            kind: kind.to_string(),
            log: log.clone(),
            latency: Duration::from_millis(10),
            resources: Mutex::new(HashMap::new()),
            counter: AtomicU32::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn exists(&self, node: &str) -> bool {
        self.resources.lock().unwrap().contains_key(node)
    }

    fn outputs_for(&self, resource: &NodeId, inputs: &Inputs) -> Outputs {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut outputs = inputs.clone();
        outputs.insert("id".to_string(), json!(format!("{}-{}", self.kind, n)));
        outputs.insert("name".to_string(), json!(resource.name()));
        outputs.insert(
            "arn".to_string(),
            json!(format!("arn:fake:{}:::{}", self.kind, resource.name())),
        );
        outputs
    }
}

#[async_trait]
impl Provisioner for FakeCloud {
    fn name(&self) -> &str {
        &self.kind
    }

    async fn create(&self, resource: &NodeId, inputs: &Inputs) -> Result<Outputs, ProvisionError> {
        self.log.push(resource, "create", "start");
        tokio::time::sleep(self.latency).await;

        let outputs = {
            let mut resources = self.resources.lock().unwrap();
            match resources.get(resource) {
                Some(existing) => existing.clone(),
                None => {
                    let outputs = self.outputs_for(resource, inputs);
                    resources.insert(resource.clone(), outputs.clone());
                    outputs
                }
            }
        };

        self.log.push(resource, "create", "end");
        Ok(outputs)
    }

    async fn update(
        &self,
        resource: &NodeId,
        _previous_inputs: &Inputs,
        previous_outputs: &Outputs,
        inputs: &Inputs,
    ) -> Result<Outputs, ProvisionError> {
        self.log.push(resource, "update", "start");
        tokio::time::sleep(self.latency).await;

        // Identity survives the update; everything else follows the inputs
        let mut outputs = previous_outputs.clone();
        outputs.extend(inputs.clone());
        self.resources
            .lock()
            .unwrap()
            .insert(resource.clone(), outputs.clone());

        self.log.push(resource, "update", "end");
        Ok(outputs)
    }

    async fn delete(&self, resource: &NodeId, _outputs: &Outputs) -> Result<(), ProvisionError> {
        self.log.push(resource, "delete", "start");
        tokio::time::sleep(self.latency).await;
        self.resources.lock().unwrap().remove(resource);
        self.log.push(resource, "delete", "end");
        Ok(())
    }
}

/// Always fails permanently
pub struct Broken;

#[async_trait]
impl Provisioner for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn create(&self, _resource: &NodeId, _inputs: &Inputs) -> Result<Outputs, ProvisionError> {
        Err(ProvisionError::permanent("AccessDenied"))
    }
}
