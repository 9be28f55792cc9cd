//! Command provisioner for externally implemented resource types.
//!
//! Spawns an executable per operation, writes a JSON request to its stdin
//! and reads a JSON object of outputs from its stdout:
//!
//! ```json
//! {"operation": "create", "resource": "Analytics/Bucket", "inputs": {"acl": "private"}}
//! ```
//!
//! Exit status 0 is success, 75 (`EX_TEMPFAIL`) is a transient failure and
//! anything else is permanent. Timeouts are enforced by the orchestrator;
//! dropping the in-flight call kills the child.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ProvisionError, Provisioner};
use crate::domain::{Inputs, NodeId, Outputs};

/// Exit status signalling a retryable failure
pub const EXIT_TEMPFAIL: i32 = 75;

/// Request document written to the child's stdin
#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    operation: &'static str,
    resource: &'a NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    inputs: Option<&'a Inputs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_inputs: Option<&'a Inputs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_outputs: Option<&'a Outputs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outputs: Option<&'a Outputs>,
}

/// Provisioner backed by an external executable
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    /// Program to run
    program: String,

    /// Arguments passed before the request is piped in
    args: Vec<String>,

    /// Working directory for the child (inherits ours if unset)
    working_dir: Option<PathBuf>,

    /// Name reported in logs
    type_name: String,
}

impl CommandProvisioner {
    /// Create a provisioner running `program`
    pub fn new(program: impl Into<String>) -> Self {
        let program = program.into();
        Self {
            type_name: format!("command:{}", program),
            program,
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Append arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run the child in `dir`
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run one operation and parse the child's stdout
    async fn invoke(&self, request: &CommandRequest<'_>) -> Result<Outputs, ProvisionError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| ProvisionError::permanent(format!("Failed to encode request: {}", e)))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("NUAGE_OPERATION", request.operation)
            .env("NUAGE_RESOURCE", request.resource.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            ProvisionError::permanent(format!("Failed to spawn '{}': {}", self.program, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.map_err(|e| {
                ProvisionError::transient(format!("Failed to write to '{}' stdin: {}", self.program, e))
            })?;
            // Drop stdin to signal EOF
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ProvisionError::transient(format!("Failed to wait for '{}': {}", self.program, e))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            let message = format!(
                "'{}' {} failed with exit code {}: {}",
                self.program,
                request.operation,
                exit_code,
                stderr.trim()
            );
            return Err(if exit_code == EXIT_TEMPFAIL {
                ProvisionError::Transient(message)
            } else {
                ProvisionError::Permanent(message)
            });
        }

        parse_outputs(&output.stdout)
    }
}

/// Parse stdout as a JSON object; empty output means no outputs
fn parse_outputs(stdout: &[u8]) -> Result<Outputs, ProvisionError> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(Outputs::new());
    }

    serde_json::from_str::<Outputs>(text).map_err(|e| {
        ProvisionError::permanent(format!("Provisioner output is not a JSON object: {}", e))
    })
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    fn name(&self) -> &str {
        &self.type_name
    }

    async fn create(&self, resource: &NodeId, inputs: &Inputs) -> Result<Outputs, ProvisionError> {
        debug!(%resource, program = %self.program, "Running create");
        self.invoke(&CommandRequest {
            operation: "create",
            resource,
            inputs: Some(inputs),
            previous_inputs: None,
            previous_outputs: None,
            outputs: None,
        })
        .await
    }

    async fn update(
        &self,
        resource: &NodeId,
        previous_inputs: &Inputs,
        previous_outputs: &Outputs,
        inputs: &Inputs,
    ) -> Result<Outputs, ProvisionError> {
        debug!(%resource, program = %self.program, "Running update");
        self.invoke(&CommandRequest {
            operation: "update",
            resource,
            inputs: Some(inputs),
            previous_inputs: Some(previous_inputs),
            previous_outputs: Some(previous_outputs),
            outputs: None,
        })
        .await
    }

    async fn delete(&self, resource: &NodeId, outputs: &Outputs) -> Result<(), ProvisionError> {
        debug!(%resource, program = %self.program, "Running delete");
        self.invoke(&CommandRequest {
            operation: "delete",
            resource,
            inputs: None,
            previous_inputs: None,
            previous_outputs: None,
            outputs: Some(outputs),
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_name() {
        let provisioner = CommandProvisioner::new("./bucket.sh").with_args(["--region", "us-east-1"]);
        assert_eq!(provisioner.name(), "command:./bucket.sh");
        assert_eq!(provisioner.args, vec!["--region", "us-east-1"]);
    }

    #[test]
    fn test_parse_outputs() {
        assert!(parse_outputs(b"  \n").unwrap().is_empty());
        assert_eq!(parse_outputs(br#"{"arn": "arn:x"}"#).unwrap()["arn"], json!("arn:x"));
        assert!(matches!(
            parse_outputs(b"[1, 2]"),
            Err(ProvisionError::Permanent(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_reads_json_outputs() {
        let provisioner = CommandProvisioner::new("sh")
            .with_args(["-c", r#"cat > /dev/null; echo "{\"id\": \"$NUAGE_RESOURCE\"}""#]);

        let outputs = provisioner
            .create(&NodeId::new("Analytics/Bucket"), &Inputs::new())
            .await
            .unwrap();

        assert_eq!(outputs["id"], json!("Analytics/Bucket"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_classification() {
        let transient = CommandProvisioner::new("sh").with_args(["-c", "cat > /dev/null; exit 75"]);
        let permanent = CommandProvisioner::new("sh").with_args(["-c", "cat > /dev/null; exit 1"]);
        let id = NodeId::new("Bucket");

        assert!(matches!(
            transient.create(&id, &Inputs::new()).await,
            Err(ProvisionError::Transient(_))
        ));
        assert!(matches!(
            permanent.create(&id, &Inputs::new()).await,
            Err(ProvisionError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_permanent() {
        let provisioner = CommandProvisioner::new("/nonexistent/nuage-provisioner");
        let result = provisioner.create(&NodeId::new("Bucket"), &Inputs::new()).await;
        assert!(matches!(result, Err(ProvisionError::Permanent(_))));
    }
}
