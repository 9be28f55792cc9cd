//! Append-only apply journal with file-based persistence.
//!
//! Each deployment gets a directory under the deployments dir holding an
//! `events.jsonl` file (one [`ApplyEvent`] per line) and an `apply.lock`
//! file guarding against concurrent applies.

use std::fs::OpenOptions as StdOpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{ApplyEvent, DeploymentState, EventType, Inputs, NodeId};

const EVENTS_FILE: &str = "events.jsonl";
const LOCK_FILE: &str = "apply.lock";

/// File-based journal for one deployment
#[derive(Debug)]
pub struct Journal {
    deployment: String,
    dir: PathBuf,
    events_path: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    /// Create or open the journal for `deployment` under `base_dir`
    pub async fn open(base_dir: &Path, deployment: &str) -> Result<Self> {
        validate_deployment_name(deployment)?;

        let dir = base_dir.join(deployment);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create deployment directory: {}", dir.display()))?;

        Ok(Self {
            deployment: deployment.to_string(),
            events_path: dir.join(EVENTS_FILE),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Deployment name
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the deployment directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the deployment's apply lock without blocking.
    ///
    /// Fails if another process holds it. Released when the guard drops.
    pub fn lock(&self) -> Result<DeploymentLock> {
        let path = self.dir.join(LOCK_FILE);
        let file = StdOpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if FileExt::try_lock_exclusive(&file).is_err() {
            bail!(
                "Deployment '{}' is locked by another apply ({})",
                self.deployment,
                path.display()
            );
        }

        debug!(deployment = %self.deployment, "Acquired apply lock");
        Ok(DeploymentLock { file, path })
    }

    /// Append an event to the journal
    pub async fn append(&self, event: &ApplyEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;

        // Concurrent node tasks share the journal; keep lines whole
        let _guard = self.write_lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<ApplyEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ApplyEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Deployment state as of the last recorded event
    pub async fn state(&self) -> Result<DeploymentState> {
        let events = self.replay().await?;
        Ok(DeploymentState::from_events(&events))
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<ApplyEvent>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List deployment names under `base_dir`
    pub async fn list_deployments(base_dir: &Path) -> Result<Vec<String>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut deployments = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read deployments directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() && entry.path().join(EVENTS_FILE).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    deployments.push(name.to_string());
                }
            }
        }

        deployments.sort();
        Ok(deployments)
    }
}

fn validate_deployment_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        bail!(
            "Invalid deployment name '{}': use letters, digits, '-', '_' or '.'",
            name
        );
    }
    Ok(())
}

/// Exclusive apply lock on a deployment
#[derive(Debug)]
pub struct DeploymentLock {
    file: std::fs::File,
    path: PathBuf,
}

impl DeploymentLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Generate an idempotency key for a node
pub fn idempotency_key(node_id: &NodeId, inputs: &Inputs) -> String {
    format!("{}:{}", node_id, hash_inputs(inputs))
}

/// Hash resolved inputs (first 16 chars of SHA256 over canonical JSON)
pub fn hash_inputs(inputs: &Inputs) -> String {
    // BTreeMap keys and serde_json object keys both serialize sorted
    let canonical = serde_json::to_vec(inputs).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
