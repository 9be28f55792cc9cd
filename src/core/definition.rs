//! YAML definitions and loading.
//!
//! A definition describes one component group: its resources, nested
//! components and the outputs it exposes. Inputs are literals, references
//! to an earlier resource's (or component's) output, or format strings
//! interpolating such references:
//!
//! ```yaml
//! name: analytics
//! outputs:
//!   bucket_name: { ref: bucket.id }
//! resources:
//!   - name: bucket
//!     provisioner: { command: ["./bucket.sh"] }
//!     inputs:
//!       acl: private
//!     outputs: [id, arn]
//!   - name: stream
//!     depends_on: [bucket]
//!     inputs:
//!       bucket_arn: { ref: bucket.arn }
//!       log_group: { format: "/aws/firehose/${bucket.id}" }
//! components:
//!   - name: gtm
//!     resources: []
//! ```
//!
//! Within a scope, resources are declared before components, each list in
//! order. A reference resolves against what is already declared in the
//! current scope or any enclosing one; forward references are rejected.
//! `depends_on` names may point anywhere in scope.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cell::OutputCell;
use super::error::DefinitionError;
use super::group::{ComponentGroup, GroupHandle};
use super::resource::{InputValue, ResourceHandle};
use super::retry::RetryPolicy;
use crate::domain::{NodeId, Outputs};
use crate::provisioners::{CommandProvisioner, DelayProvisioner, Provisioner, StaticProvisioner};

/// A component group definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Group name (root name scopes every resource id)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Outputs exposed to the parent (or reported for the root)
    #[serde(default)]
    pub outputs: BTreeMap<String, InputSpec>,

    /// Resources, in declaration order
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,

    /// Nested components, declared after this scope's resources
    #[serde(default)]
    pub components: Vec<Definition>,

    /// Directory relative command paths run in
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

/// A single resource declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Name (unique within its scope)
    pub name: String,

    /// Which provisioner manages the resource
    #[serde(default)]
    pub provisioner: ProvisionerSpec,

    #[serde(default)]
    pub inputs: BTreeMap<String, InputSpec>,

    /// Output names the provisioner must return
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Names of resources or components that must succeed first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Override the default per-operation timeout
    pub timeout_seconds: Option<u64>,

    /// Override the default retry policy
    pub retry_policy: Option<RetryPolicy>,
}

/// Provisioner selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProvisionerSpec {
    /// `static`
    Named(String),

    /// `{ command: [program, args...] }`
    Command(CommandSpec),

    /// `{ delay: seconds }`
    Delay(DelaySpec),

    /// `{ static: { key: value } }`: echo inputs plus fixed outputs
    Static(StaticSpec),
}

impl Default for ProvisionerSpec {
    fn default() -> Self {
        Self::Named("static".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelaySpec {
    pub delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticSpec {
    #[serde(rename = "static")]
    pub outputs: Outputs,
}

/// How an input value is produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSpec {
    /// `{ ref: name.output }`
    Reference(ReferenceSpec),

    /// `{ format: "text ${name.output} text" }`
    Format(FormatSpec),

    /// Any other YAML value
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReferenceSpec {
    #[serde(rename = "ref")]
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormatSpec {
    pub format: String,
}

impl Definition {
    /// Load a definition from a YAML file.
    ///
    /// Relative command paths run from the file's directory.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read definition file: {}", path.display()))?;

        let mut definition = Self::from_yaml(&content)
            .with_context(|| format!("Failed to load definition: {}", path.display()))?;
        definition.base_dir = path.parent().map(Path::to_path_buf);
        Ok(definition)
    }

    /// Parse a definition from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse definition YAML")
    }

    /// Build the component group tree
    pub fn build(&self) -> Result<ComponentGroup, DefinitionError> {
        validate_name(&self.name)?;
        let mut root = ComponentGroup::new(self.name.as_str());
        let mut builder = TreeBuilder {
            base_dir: self.base_dir.clone(),
            scopes: Vec::new(),
        };
        builder.build_group(self, &mut root)?;
        Ok(root)
    }

    /// Total number of resources, including nested components
    pub fn resource_count(&self) -> usize {
        self.resources.len()
            + self
                .components
                .iter()
                .map(Definition::resource_count)
                .sum::<usize>()
    }
}

/// Something a reference can name
#[derive(Clone)]
enum Declared {
    Resource(ResourceHandle),
    Component(GroupHandle),
}

impl Declared {
    fn output(&self, name: &str) -> Result<OutputCell, DefinitionError> {
        match self {
            Self::Resource(handle) => handle.output(name),
            Self::Component(handle) => handle.output(name),
        }
    }
}

struct Scope {
    path: String,
    /// Every name in the scope mapped to its full path
    paths: HashMap<String, String>,
    /// Names declared so far
    declared: HashMap<String, Declared>,
}

struct TreeBuilder {
    base_dir: Option<PathBuf>,
    scopes: Vec<Scope>,
}

impl TreeBuilder {
    fn build_group(&mut self, def: &Definition, group: &mut ComponentGroup) -> Result<(), DefinitionError> {
        let mut paths = HashMap::new();
        let names = def
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .chain(def.components.iter().map(|c| c.name.as_str()));
        for name in names {
            validate_name(name)?;
            let path = NodeId::scoped(group.path(), name).to_string();
            if paths.insert(name.to_string(), path).is_some() {
                return Err(DefinitionError::Invalid {
                    name: name.to_string(),
                    reason: format!("declared twice in '{}'", group.path()),
                });
            }
        }

        self.scopes.push(Scope {
            path: group.path().to_string(),
            paths,
            declared: HashMap::new(),
        });
        let result = self.build_scope(def, group);
        self.scopes.pop();
        result
    }

    fn build_scope(&mut self, def: &Definition, group: &mut ComponentGroup) -> Result<(), DefinitionError> {
        for spec in &def.resources {
            let handle = self.build_resource(spec, group)?;
            self.declare(&spec.name, Declared::Resource(handle));
        }

        for component in &def.components {
            let mut subgroup = group.subgroup(&component.name);
            self.build_group(component, &mut subgroup)?;
            let handle = group.add_group(subgroup)?;
            self.declare(&component.name, Declared::Component(handle));
        }

        for (name, spec) in &def.outputs {
            let referrer = format!("{}.outputs.{}", group.path(), name);
            let InputSpec::Reference(ref reference) = spec else {
                return Err(DefinitionError::Invalid {
                    name: referrer,
                    reason: "exposed outputs must be references".to_string(),
                });
            };
            let cell = self.lookup(&reference.reference, &referrer)?;
            group.expose(name.clone(), cell);
        }
        Ok(())
    }

    fn build_resource(
        &self,
        spec: &ResourceSpec,
        group: &mut ComponentGroup,
    ) -> Result<ResourceHandle, DefinitionError> {
        let provisioner = self.provisioner(spec)?;
        let referrer = NodeId::scoped(group.path(), &spec.name).to_string();

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        for (name, input) in &spec.inputs {
            inputs.push((name.clone(), self.input(input, &referrer)?));
        }
        let depends_on: Vec<String> = spec.depends_on.iter().map(|name| self.dependency_path(name)).collect();

        let mut builder = group.resource(&spec.name, provisioner);
        for (name, value) in inputs {
            builder = builder.input(name, value);
        }
        for path in &depends_on {
            builder = builder.depends_on(path);
        }
        builder = builder.outputs(spec.outputs.iter().cloned());
        if let Some(secs) = spec.timeout_seconds {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(ref policy) = spec.retry_policy {
            builder = builder.retry_policy(policy.clone());
        }
        Ok(builder.build())
    }

    fn provisioner(&self, spec: &ResourceSpec) -> Result<Arc<dyn Provisioner>, DefinitionError> {
        let invalid = |reason: String| DefinitionError::Invalid {
            name: spec.name.clone(),
            reason,
        };

        match spec.provisioner {
            ProvisionerSpec::Named(ref name) if name == "static" => Ok(Arc::new(StaticProvisioner::new())),
            ProvisionerSpec::Named(ref name) => Err(invalid(format!(
                "unknown provisioner '{}' (expected static, {{delay: seconds}} or {{command: [...]}})",
                name
            ))),
            ProvisionerSpec::Static(ref fixed) => Ok(Arc::new(StaticProvisioner::with_outputs(fixed.outputs.clone()))),
            ProvisionerSpec::Delay(DelaySpec { delay }) => {
                if !delay.is_finite() || delay < 0.0 {
                    return Err(invalid(format!("delay must be a non-negative number of seconds, got {}", delay)));
                }
                let duration = Duration::try_from_secs_f64(delay)
                    .map_err(|e| invalid(format!("delay of {} seconds is out of range: {}", delay, e)))?;
                Ok(Arc::new(DelayProvisioner::new(duration)))
            }
            ProvisionerSpec::Command(ref command) => {
                let Some((program, args)) = command.command.split_first() else {
                    return Err(invalid("command must name a program".to_string()));
                };
                let mut provisioner = CommandProvisioner::new(program.clone()).with_args(args.iter().cloned());
                if let Some(ref dir) = self.base_dir {
                    provisioner = provisioner.with_working_dir(dir.clone());
                }
                Ok(Arc::new(provisioner))
            }
        }
    }

    fn input(&self, spec: &InputSpec, referrer: &str) -> Result<InputValue, DefinitionError> {
        match spec {
            InputSpec::Literal(value) => Ok(InputValue::Literal(value.clone())),
            InputSpec::Reference(reference) => Ok(InputValue::Output(self.lookup(&reference.reference, referrer)?)),
            InputSpec::Format(format) => {
                let segments = parse_template(&format.format, referrer)?;
                let mut cells = Vec::new();
                let mut parts = Vec::with_capacity(segments.len());
                for segment in segments {
                    match segment {
                        Segment::Text(text) => parts.push(Part::Text(text)),
                        Segment::Reference(reference) => {
                            cells.push(self.lookup(&reference, referrer)?);
                            parts.push(Part::Value(cells.len() - 1));
                        }
                    }
                }

                if cells.is_empty() {
                    return Ok(InputValue::Literal(Value::String(render(&parts, &[]))));
                }
                Ok(InputValue::computed(cells, move |values| Value::String(render(&parts, values))))
            }
        }
    }

    fn declare(&mut self, name: &str, declared: Declared) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.declared.insert(name.to_string(), declared);
        }
    }

    /// Resolve `name.output` against declarations so far, innermost scope first
    fn lookup(&self, reference: &str, referrer: &str) -> Result<OutputCell, DefinitionError> {
        let Some((name, output)) = reference.split_once('.') else {
            return Err(DefinitionError::InvalidReference {
                reference: reference.to_string(),
                referrer: referrer.to_string(),
            });
        };
        if name.is_empty() || output.is_empty() {
            return Err(DefinitionError::InvalidReference {
                reference: reference.to_string(),
                referrer: referrer.to_string(),
            });
        }

        for scope in self.scopes.iter().rev() {
            if let Some(declared) = scope.declared.get(name) {
                return declared.output(output);
            }
        }

        Err(DefinitionError::UnknownReference {
            scope: self.scopes.last().map(|s| s.path.clone()).unwrap_or_default(),
            name: name.to_string(),
            referrer: referrer.to_string(),
        })
    }

    /// Map a `depends_on` name to a path; unknown names pass through for the
    /// graph builder to reject
    fn dependency_path(&self, name: &str) -> String {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.paths.get(name).cloned())
            .unwrap_or_else(|| name.to_string())
    }
}

fn validate_name(name: &str) -> Result<(), DefinitionError> {
    let reason = if name.is_empty() {
        Some("name cannot be empty")
    } else if name.contains(['/', '.']) {
        Some("name cannot contain '/' or '.'")
    } else if name.chars().any(char::is_whitespace) {
        Some("name cannot contain whitespace")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(DefinitionError::Invalid {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, PartialEq)]
enum Segment {
    Text(String),
    Reference(String),
}

enum Part {
    Text(String),
    Value(usize),
}

/// Split `a ${x.y} b` into text and reference segments
fn parse_template(template: &str, referrer: &str) -> Result<Vec<Segment>, DefinitionError> {
    let mut segments = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        if start > 0 {
            segments.push(Segment::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(DefinitionError::UnterminatedTemplate {
                referrer: referrer.to_string(),
            });
        };
        segments.push(Segment::Reference(after[..end].trim().to_string()));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }
    Ok(segments)
}

fn render(parts: &[Part], values: &[Value]) -> String {
    let mut rendered = String::new();
    for part in parts {
        match part {
            Part::Text(text) => rendered.push_str(text),
            Part::Value(i) => match values.get(*i) {
                Some(Value::String(s)) => rendered.push_str(s),
                Some(other) => rendered.push_str(&other.to_string()),
                None => {}
            },
        }
    }
    rendered
}
