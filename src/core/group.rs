//! Component groups: named, nestable aggregations of resources.
//!
//! A group owns its children and exposes an explicit set of output cells to
//! its parent. Groups are never scheduled; the graph builder flattens them
//! into their leaf resources and expands a dependency on a group into edges
//! to the leaves behind its exposed outputs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::cell::OutputCell;
use super::error::DefinitionError;
use super::resource::{DependencyRef, ResourceBuilder, ResourceNode};
use crate::domain::NodeId;
use crate::provisioners::{DelayProvisioner, Provisioner};

#[derive(Debug)]
enum Child {
    Resource(ResourceNode),
    Group(ComponentGroup),
}

/// A named group of resources and subgroups
#[derive(Debug)]
pub struct ComponentGroup {
    path: String,
    children: Vec<Child>,
    exposed: BTreeMap<String, OutputCell>,
}

impl ComponentGroup {
    /// Create a root group. An empty name leaves resource ids unscoped.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            path: name.into(),
            children: Vec::new(),
            exposed: BTreeMap::new(),
        }
    }

    /// Create a group scoped under this one.
    ///
    /// The subgroup is detached until passed to [`ComponentGroup::add_group`].
    pub fn subgroup(&self, name: &str) -> ComponentGroup {
        ComponentGroup::new(NodeId::scoped(&self.path, name).as_str())
    }

    /// Full `/`-separated path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last path segment
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Declare a resource in this group
    pub fn resource(&mut self, name: &str, provisioner: Arc<dyn Provisioner>) -> ResourceBuilder<'_> {
        let id = NodeId::scoped(&self.path, name);
        ResourceBuilder::new(self, id, provisioner)
    }

    /// Declare a delay resource that waits `duration` before succeeding
    pub fn delay(&mut self, name: &str, duration: Duration) -> ResourceBuilder<'_> {
        self.resource(name, Arc::new(DelayProvisioner::new(duration)))
    }

    pub(crate) fn push_resource(&mut self, node: ResourceNode) {
        self.children.push(Child::Resource(node));
    }

    /// Attach a subgroup created with [`ComponentGroup::subgroup`]
    pub fn add_group(&mut self, group: ComponentGroup) -> Result<GroupHandle, DefinitionError> {
        let expected = NodeId::scoped(&self.path, group.name());
        if expected.as_str() != group.path {
            return Err(DefinitionError::ForeignGroup {
                group: group.path.clone(),
                parent: self.path.clone(),
            });
        }

        let handle = group.handle();
        self.children.push(Child::Group(group));
        Ok(handle)
    }

    /// Expose a cell to the parent under `name`
    pub fn expose(&mut self, name: impl Into<String>, cell: OutputCell) -> &mut Self {
        self.exposed.insert(name.into(), cell);
        self
    }

    /// An exposed output
    pub fn output(&self, name: &str) -> Result<OutputCell, DefinitionError> {
        self.exposed
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownOutput {
                node: self.path.clone(),
                output: name.to_string(),
            })
    }

    /// Merged mapping of exposed outputs
    pub fn outputs(&self) -> &BTreeMap<String, OutputCell> {
        &self.exposed
    }

    /// Handle for referencing this group's outputs and depending on it
    pub fn handle(&self) -> GroupHandle {
        GroupHandle {
            path: self.path.clone(),
            outputs: self.exposed.clone(),
        }
    }

    /// Leaf resources, depth first in declaration order
    pub fn resources(&self) -> impl Iterator<Item = &ResourceNode> + '_ {
        let mut leaves = Vec::new();
        self.collect_resources(&mut leaves);
        leaves.into_iter()
    }

    fn collect_resources<'a>(&'a self, leaves: &mut Vec<&'a ResourceNode>) {
        for child in &self.children {
            match child {
                Child::Resource(node) => leaves.push(node),
                Child::Group(group) => group.collect_resources(leaves),
            }
        }
    }

    /// This group and every nested group, parents before children
    pub fn groups(&self) -> Vec<&ComponentGroup> {
        let mut groups = vec![self];
        for child in &self.children {
            if let Child::Group(group) = child {
                groups.extend(group.groups());
            }
        }
        groups
    }

    /// Consume the tree into its leaf resources
    pub(crate) fn into_resources(self) -> Vec<ResourceNode> {
        let mut leaves = Vec::new();
        for child in self.children {
            match child {
                Child::Resource(node) => leaves.push(node),
                Child::Group(group) => leaves.extend(group.into_resources()),
            }
        }
        leaves
    }

    /// True if the group declares nothing
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Handle to an attached group
#[derive(Debug, Clone)]
pub struct GroupHandle {
    path: String,
    outputs: BTreeMap<String, OutputCell>,
}

impl GroupHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// An exposed output
    pub fn output(&self, name: &str) -> Result<OutputCell, DefinitionError> {
        self.outputs
            .get(name)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownOutput {
                node: self.path.clone(),
                output: name.to_string(),
            })
    }

    pub fn outputs(&self) -> &BTreeMap<String, OutputCell> {
        &self.outputs
    }
}

impl DependencyRef for GroupHandle {
    fn dependency_path(&self) -> String {
        self.path.clone()
    }
}
