//! Configuration for nuage.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (NUAGE_HOME, NUAGE_CONCURRENCY)
//! 2. Config file (.nuage/config.yaml)
//! 3. Defaults (~/.nuage, unbounded concurrency, 600s timeout, 3 attempts)
//!
//! Config file discovery:
//! - Searches the starting directory and its parents for .nuage/config.yaml
//! - Paths in the config file are relative to the .nuage/ directory
//!
//! Loaded configuration is returned by value and threaded into the
//! orchestrator; nothing is cached globally.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::RetryPolicy;

/// Default per-operation timeout
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub engine: Option<EngineSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .nuage/)
    pub home: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    pub concurrency_limit: Option<usize>,
    pub default_timeout_seconds: Option<u64>,
    pub retry: Option<RetryPolicy>,
}

/// Settings the orchestrator runs with
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum nodes running at once (`None` = unbounded)
    pub concurrency_limit: Option<usize>,

    /// Timeout per provisioner call unless a node overrides it
    pub default_timeout: Option<Duration>,

    /// Retry policy unless a node overrides it
    pub retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: None,
            default_timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Bound concurrent node operations. Zero means unbounded.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = (limit > 0).then_some(limit);
        self
    }

    /// Set the default per-operation timeout
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Disable the default timeout
    pub fn without_timeout(mut self) -> Self {
        self.default_timeout = None;
        self
    }

    /// Set the default retry policy
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to nuage home (journals, locks)
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Engine settings
    pub engine: EngineConfig,
}

impl ResolvedConfig {
    /// Directory holding one subdirectory per deployment
    pub fn deployments_dir(&self) -> PathBuf {
        self.home.join("deployments")
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".nuage").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn engine_config(section: Option<&EngineSection>) -> EngineConfig {
    let mut engine = EngineConfig::default();
    let Some(section) = section else {
        return engine;
    };

    if let Some(limit) = section.concurrency_limit {
        engine = engine.with_concurrency_limit(limit);
    }
    match section.default_timeout_seconds {
        Some(0) => engine = engine.without_timeout(),
        Some(secs) => engine = engine.with_default_timeout(Duration::from_secs(secs)),
        None => {}
    }
    if let Some(ref retry) = section.retry {
        engine = engine.with_retry_policy(retry.clone());
    }
    engine
}

/// Load configuration from all sources, starting discovery at the
/// current directory
pub fn load_config() -> Result<ResolvedConfig> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    load_config_from(&cwd)
}

/// Load configuration from all sources, starting discovery at `start`
pub fn load_config_from(start: &Path) -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".nuage");

    let config_file = find_config_file(start);

    let (mut home, mut engine) = if let Some(ref config_path) = config_file {
        let config = load_config_file(config_path)?;
        let nuage_dir = config_path.parent().unwrap_or(Path::new("."));

        let home = match config.paths.home {
            Some(ref home_path) => resolve_path(nuage_dir, home_path),
            None => default_home,
        };
        (home, engine_config(config.engine.as_ref()))
    } else {
        (default_home, EngineConfig::default())
    };

    if let Ok(env_home) = std::env::var("NUAGE_HOME") {
        home = PathBuf::from(env_home);
    }
    if let Ok(env_limit) = std::env::var("NUAGE_CONCURRENCY") {
        let limit: usize = env_limit
            .parse()
            .with_context(|| format!("NUAGE_CONCURRENCY must be a number, got '{}'", env_limit))?;
        engine = engine.with_concurrency_limit(limit);
    }

    Ok(ResolvedConfig {
        home,
        config_file,
        engine,
    })
}
