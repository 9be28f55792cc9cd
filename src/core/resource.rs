//! Resource nodes and their declarations.
//!
//! A resource node pairs one provisioner with the inputs it will be called
//! with, the outputs it promises, and any explicit `depends_on` edges.
//! Inputs are declared as literals or in terms of other nodes' output cells;
//! every cell an input touches is recorded so the graph builder can add the
//! implied edge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::cell::OutputCell;
use super::error::DefinitionError;
use super::group::ComponentGroup;
use super::retry::RetryPolicy;
use crate::domain::{ErrorKind, Inputs, NodeError, NodeId};
use crate::provisioners::Provisioner;

type ComputeFn = dyn Fn(&[Value]) -> Value + Send + Sync;

/// How one input of a node is produced
#[derive(Clone)]
pub enum InputValue {
    /// A value known at declaration time
    Literal(Value),

    /// The resolved value of another node's output
    Output(OutputCell),

    /// A value computed from several outputs once all of them resolve
    Computed {
        sources: Vec<OutputCell>,
        compute: Arc<ComputeFn>,
    },
}

impl InputValue {
    /// A literal input
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// An input computed from `sources`, in order, once all resolved
    pub fn computed<F>(sources: Vec<OutputCell>, compute: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self::Computed {
            sources,
            compute: Arc::new(compute),
        }
    }

    /// Every output cell this input reads
    pub fn references(&self) -> &[OutputCell] {
        match self {
            Self::Literal(_) => &[],
            Self::Output(cell) => std::slice::from_ref(cell),
            Self::Computed { sources, .. } => sources,
        }
    }

    /// Wait for referenced cells and produce the concrete value
    pub async fn resolve(&self) -> Result<Value, NodeError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Output(cell) => read_cell(cell).await,
            Self::Computed { sources, compute } => {
                let mut values = Vec::with_capacity(sources.len());
                for cell in sources {
                    values.push(read_cell(cell).await?);
                }
                Ok(compute(&values))
            }
        }
    }
}

async fn read_cell(cell: &OutputCell) -> Result<Value, NodeError> {
    cell.wait().await.map_err(|upstream| {
        let chain = if upstream.upstream_chain.is_empty() {
            vec![cell.owner().clone()]
        } else {
            upstream.upstream_chain.clone()
        };
        NodeError {
            kind: ErrorKind::UpstreamFailure,
            message: format!("input '{}' is unavailable: {}", cell.qualified_name(), upstream),
            upstream_chain: chain,
        }
    })
}

impl fmt::Debug for InputValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            Self::Output(cell) => f.debug_tuple("Output").field(&cell.qualified_name()).finish(),
            Self::Computed { sources, .. } => f
                .debug_struct("Computed")
                .field(
                    "sources",
                    &sources.iter().map(OutputCell::qualified_name).collect::<Vec<_>>(),
                )
                .finish(),
        }
    }
}

impl From<Value> for InputValue {
    fn from(value: Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for InputValue {
    fn from(value: &str) -> Self {
        Self::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for InputValue {
    fn from(value: String) -> Self {
        Self::Literal(Value::String(value))
    }
}

impl From<OutputCell> for InputValue {
    fn from(cell: OutputCell) -> Self {
        Self::Output(cell)
    }
}

impl From<&OutputCell> for InputValue {
    fn from(cell: &OutputCell) -> Self {
        Self::Output(cell.clone())
    }
}

/// Anything a node can declare an explicit dependency on.
///
/// Resolves to a path: a node id or a component group path.
pub trait DependencyRef {
    fn dependency_path(&self) -> String;
}

impl DependencyRef for str {
    fn dependency_path(&self) -> String {
        self.to_string()
    }
}

impl DependencyRef for String {
    fn dependency_path(&self) -> String {
        self.clone()
    }
}

impl DependencyRef for NodeId {
    fn dependency_path(&self) -> String {
        self.as_str().to_string()
    }
}

impl DependencyRef for OutputCell {
    fn dependency_path(&self) -> String {
        self.owner().as_str().to_string()
    }
}

impl DependencyRef for ResourceHandle {
    fn dependency_path(&self) -> String {
        self.id.as_str().to_string()
    }
}

/// A schedulable unit wrapping one provisioner operation
#[derive(Clone)]
pub struct ResourceNode {
    id: NodeId,
    provisioner: Arc<dyn Provisioner>,
    inputs: BTreeMap<String, InputValue>,
    outputs: BTreeMap<String, OutputCell>,
    depends_on: Vec<String>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
}

impl ResourceNode {
    /// Node identifier
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Provisioner backing this node
    pub fn provisioner(&self) -> &Arc<dyn Provisioner> {
        &self.provisioner
    }

    /// Declared inputs
    pub fn inputs(&self) -> &BTreeMap<String, InputValue> {
        &self.inputs
    }

    /// Declared output cells
    pub fn outputs(&self) -> &BTreeMap<String, OutputCell> {
        &self.outputs
    }

    /// Explicit `depends_on` paths, as declared
    pub fn explicit_dependencies(&self) -> &[String] {
        &self.depends_on
    }

    /// Owners of every output cell read by the inputs
    pub fn implicit_dependencies(&self) -> BTreeSet<NodeId> {
        self.inputs
            .values()
            .flat_map(InputValue::references)
            .map(|cell| cell.owner().clone())
            .collect()
    }

    /// Per-node timeout override
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Per-node retry override
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    /// Resolve every input, suspending on cells that are still pending
    pub async fn resolve_inputs(&self) -> Result<Inputs, NodeError> {
        let mut resolved = Inputs::new();
        for (name, input) in &self.inputs {
            resolved.insert(name.clone(), input.resolve().await?);
        }
        Ok(resolved)
    }
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("id", &self.id)
            .field("provisioner", &self.provisioner.name())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs.keys().collect::<Vec<_>>())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}

/// Handle to a declared resource, used to reference its outputs
#[derive(Debug, Clone)]
pub struct ResourceHandle {
    id: NodeId,
    outputs: BTreeMap<String, OutputCell>,
}

impl ResourceHandle {
    /// Node identifier
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Cell for a declared output
    pub fn output(&self, name: &str) -> Result<OutputCell, DefinitionError> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownOutput {
                node: self.id.to_string(),
                output: name.to_string(),
            })
    }

    /// All declared output cells
    pub fn outputs(&self) -> &BTreeMap<String, OutputCell> {
        &self.outputs
    }
}

/// Builder for a resource inside a component group.
///
/// Created by [`ComponentGroup::resource`]; the node is added to the group
/// by [`ResourceBuilder::build`].
pub struct ResourceBuilder<'g> {
    group: &'g mut ComponentGroup,
    id: NodeId,
    provisioner: Arc<dyn Provisioner>,
    inputs: BTreeMap<String, InputValue>,
    output_names: Vec<String>,
    depends_on: Vec<String>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
}

impl<'g> ResourceBuilder<'g> {
    pub(crate) fn new(group: &'g mut ComponentGroup, id: NodeId, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            group,
            id,
            provisioner,
            inputs: BTreeMap::new(),
            output_names: Vec::new(),
            depends_on: Vec::new(),
            timeout: None,
            retry_policy: None,
        }
    }

    /// Set an input
    pub fn input(mut self, name: impl Into<String>, value: impl Into<InputValue>) -> Self {
        self.inputs.insert(name.into(), value.into());
        self
    }

    /// Declare an output the provisioner must return
    pub fn output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.output_names.contains(&name) {
            self.output_names.push(name);
        }
        self
    }

    /// Declare several outputs
    pub fn outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for name in names {
            self = self.output(name);
        }
        self
    }

    /// Add an explicit dependency on a resource or component group
    pub fn depends_on<D: DependencyRef + ?Sized>(mut self, dependency: &D) -> Self {
        self.depends_on.push(dependency.dependency_path());
        self
    }

    /// Override the engine's default per-operation timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override the engine's default retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Add the node to its group and return a handle to its outputs
    pub fn build(self) -> ResourceHandle {
        let outputs: BTreeMap<String, OutputCell> = self
            .output_names
            .into_iter()
            .map(|name| {
                let cell = OutputCell::new(self.id.clone(), name.clone());
                (name, cell)
            })
            .collect();

        let handle = ResourceHandle {
            id: self.id.clone(),
            outputs: outputs.clone(),
        };

        self.group.push_resource(ResourceNode {
            id: self.id,
            provisioner: self.provisioner,
            inputs: self.inputs,
            outputs,
            depends_on: self.depends_on,
            timeout: self.timeout,
            retry_policy: self.retry_policy,
        });

        handle
    }
}
