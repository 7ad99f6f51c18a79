//! Configuration for strand-controller

use crate::error::{ControllerError, ControllerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use strand_types::Workflow;

/// Main controller configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Namespace to manage; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Worker pool sizes
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Retry budget for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Archive policy
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Capacity of named semaphores, keyed by `namespace/name` or `name`
    #[serde(default)]
    pub semaphores: BTreeMap<String, usize>,

    /// Cluster-wide defaults merged into every workflow
    #[serde(default)]
    pub workflow_defaults: Option<Workflow>,

    /// Directory of YAML manifests seeding the local cluster
    #[serde(default)]
    pub manifests: Option<PathBuf>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Worker pool sizes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Concurrent workflow operation cycles
    #[serde(default = "default_workflow_workers")]
    pub workflow: usize,

    /// Concurrent pod event handlers
    #[serde(default = "default_pod_workers")]
    pub pod: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workflow: default_workflow_workers(),
            pod: default_pod_workers(),
        }
    }
}

/// Retry behaviour for transient failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Requeues before a transient failure is surfaced as permanent
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff step in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

/// Archive configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Use the in-memory archive instead of the null archive
    #[serde(default)]
    pub enabled: bool,

    /// Which finished workflows are archived; inferred from `label_selector` when unset
    #[serde(default)]
    pub policy: Option<ArchivePolicy>,

    /// Label selector for archivable workflows under the `selector` policy
    #[serde(default)]
    pub label_selector: Option<String>,

    /// Retention after a workflow finishes; forever when unset
    #[serde(default)]
    pub ttl_secs: Option<u64>,

    /// Garbage collection period in seconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: None,
            label_selector: None,
            ttl_secs: None,
            gc_interval_secs: default_gc_interval(),
        }
    }
}

/// Archive eligibility of finished workflows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchivePolicy {
    Everything,
    Nothing,
    Selector,
}

impl ArchiveConfig {
    /// The effective policy: `selector` if a selector is set, else `everything`
    pub fn effective_policy(&self) -> ControllerResult<ArchivePolicy> {
        match (self.policy, &self.label_selector) {
            (None | Some(ArchivePolicy::Selector), Some(_)) => Ok(ArchivePolicy::Selector),
            (None, None) => Ok(ArchivePolicy::Everything),
            (Some(ArchivePolicy::Selector), None) => Err(ControllerError::Config(
                "archive.policy selector requires archive.label_selector".to_string(),
            )),
            (Some(policy), None) => Ok(policy),
            (Some(policy), Some(_)) => Err(ControllerError::Config(format!(
                "archive.label_selector conflicts with archive.policy {:?}",
                policy
            ))),
        }
    }

    pub fn ttl(&self) -> Option<chrono::Duration> {
        self.ttl_secs
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_workflow_workers() -> usize {
    8
}

fn default_pod_workers() -> usize {
    4
}

fn default_max_retries() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    5
}

fn default_max_delay_secs() -> u64 {
    1000
}

fn default_gc_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ControllerConfig {
    /// Load configuration: defaults, then an optional file, then `STRAND_*`
    /// environment variables (`__` separates nested keys, e.g.
    /// `STRAND_ARCHIVE__TTL_SECS`).
    pub fn load(path: Option<&str>) -> ControllerResult<Self> {
        let mut builder = ::config::Config::builder();

        builder = builder.add_source(::config::Config::try_from(&ControllerConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("STRAND")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        if let Some(path) = path {
            if let Some(defaults) = read_workflow_defaults(std::path::Path::new(path))? {
                config.workflow_defaults = Some(defaults);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ControllerResult<()> {
        if self.workers.workflow == 0 || self.workers.pod == 0 {
            return Err(ControllerError::Config(
                "worker counts must be positive".to_string(),
            ));
        }
        if self.archive.enabled && self.archive.gc_interval_secs == 0 {
            return Err(ControllerError::Config(
                "archive.gc_interval_secs must be positive".to_string(),
            ));
        }
        self.archive.effective_policy()?;
        if let Some(zero) = self.semaphores.iter().find(|(_, limit)| **limit == 0) {
            return Err(ControllerError::Config(format!(
                "semaphore {} has zero capacity",
                zero.0
            )));
        }
        Ok(())
    }

    /// Capacity of semaphore `name` as seen from `namespace`
    pub fn semaphore_limit(&self, namespace: &str, name: &str) -> usize {
        self.semaphores
            .get(&format!("{}/{}", namespace, name))
            .or_else(|| self.semaphores.get(name))
            .copied()
            .unwrap_or(1)
    }
}

/// The layered loader does not preserve key case, while the defaults document
/// uses camelCase field names, so it is read from the file verbatim.
fn read_workflow_defaults(path: &std::path::Path) -> ControllerResult<Option<Workflow>> {
    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext, "yaml" | "yml" | "json"));
    if !is_yaml || !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&raw)
        .map_err(|e| ControllerError::Config(format!("{}: {}", path.display(), e)))?;
    match doc.get("workflow_defaults") {
        Some(value) if !value.is_null() => serde_yaml::from_value(value.clone())
            .map(Some)
            .map_err(|e| ControllerError::Config(format!("workflow_defaults: {}", e))),
        _ => Ok(None),
    }
}
