//! Executor configuration
//!
//! Loaded from YAML, then optionally overridden from the environment:
//!
//! ```yaml
//! parallelism: "50%"            # "max", "N%", or an integer
//! failure_policy: continue_on_failure
//! allow_warnings_in_success: false
//! cache:
//!   enabled: true
//! cobuild:
//!   enabled: true
//!   context_id: "ci-pipeline-1234"
//!   lease_ttl_secs: 30
//! ```
//!
//! | Variable                         | Field                 |
//! |----------------------------------|-----------------------|
//! | `BUILDGRAPH_PARALLELISM`         | `parallelism`         |
//! | `BUILDGRAPH_COBUILD_ENABLED`     | `cobuild.enabled`     |
//! | `BUILDGRAPH_COBUILD_CONTEXT_ID`  | `cobuild.context_id`  |
//! | `BUILDGRAPH_COBUILD_RUNNER_ID`   | `cobuild.runner_id`   |

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::cobuild::CobuildMode;

pub const ENV_PARALLELISM: &str = "BUILDGRAPH_PARALLELISM";
pub const ENV_COBUILD_ENABLED: &str = "BUILDGRAPH_COBUILD_ENABLED";
pub const ENV_COBUILD_CONTEXT_ID: &str = "BUILDGRAPH_COBUILD_CONTEXT_ID";
pub const ENV_COBUILD_RUNNER_ID: &str = "BUILDGRAPH_COBUILD_RUNNER_ID";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid parallelism '{0}': expected \"max\", \"N%\" or a positive integer")]
    InvalidParallelism(String),

    #[error("Invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Worker slot count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// One slot per logical core
    Max,
    /// Percentage of logical cores, rounded down, at least one
    Percent(u32),
    Fixed(usize),
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Max
    }
}

impl Parallelism {
    pub fn resolve(&self) -> usize {
        self.resolve_with_cores(num_cpus::get())
    }

    pub fn resolve_with_cores(&self, cores: usize) -> usize {
        let slots = match self {
            Parallelism::Max => cores,
            Parallelism::Percent(pct) => cores * (*pct as usize) / 100,
            Parallelism::Fixed(n) => *n,
        };
        slots.max(1)
    }
}

impl FromStr for Parallelism {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("max") {
            return Ok(Parallelism::Max);
        }
        if let Some(pct) = trimmed.strip_suffix('%') {
            return match pct.trim().parse::<u32>() {
                Ok(p) if p > 0 => Ok(Parallelism::Percent(p)),
                _ => Err(ConfigError::InvalidParallelism(s.to_string())),
            };
        }
        match trimmed.parse::<usize>() {
            Ok(n) if n > 0 => Ok(Parallelism::Fixed(n)),
            _ => Err(ConfigError::InvalidParallelism(s.to_string())),
        }
    }
}

impl std::fmt::Display for Parallelism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Parallelism::Max => write!(f, "max"),
            Parallelism::Percent(p) => write!(f, "{}%", p),
            Parallelism::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Parallelism {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Parallelism {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n.to_string().parse().map_err(serde::de::Error::custom),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Block only the dependents of a failed operation; independent work continues
    #[default]
    ContinueOnFailure,
    /// Stop dispatching on the first failure; in-flight work finishes
    StopOnFirstFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Consult the cache before executing
    pub read: bool,
    /// Save successful results
    pub write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read: true,
            write: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CobuildConfig {
    pub enabled: bool,
    pub context_id: Option<String>,
    pub runner_id: Option<String>,
    pub lease_ttl_secs: u64,
    pub completed_ttl_secs: u64,
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for CobuildConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            context_id: None,
            runner_id: None,
            lease_ttl_secs: 30,
            completed_ttl_secs: 3600,
            heartbeat_interval_ms: 10_000,
            poll_interval_ms: 1_000,
        }
    }
}

impl CobuildConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub parallelism: Parallelism,
    pub failure_policy: FailurePolicy,
    pub allow_warnings_in_success: bool,
    pub cache: CacheConfig,
    pub cobuild: CobuildConfig,
}

impl ExecutorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: ExecutorConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn with_parallelism(mut self, parallelism: Parallelism) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_cobuild(mut self, context_id: impl Into<String>, runner_id: impl Into<String>) -> Self {
        self.cobuild.enabled = true;
        self.cobuild.context_id = Some(context_id.into());
        self.cobuild.runner_id = Some(runner_id.into());
        self
    }

    /// Apply `BUILDGRAPH_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_PARALLELISM) {
            self.parallelism = value.parse()?;
        }
        if let Some(value) = lookup(ENV_COBUILD_ENABLED) {
            self.cobuild.enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    return Err(ConfigError::invalid(
                        ENV_COBUILD_ENABLED,
                        format!("expected a boolean, got '{}'", other),
                    ))
                }
            };
        }
        if let Some(value) = lookup(ENV_COBUILD_CONTEXT_ID).filter(|v| !v.trim().is_empty()) {
            self.cobuild.context_id = Some(value);
        }
        if let Some(value) = lookup(ENV_COBUILD_RUNNER_ID).filter(|v| !v.trim().is_empty()) {
            self.cobuild.runner_id = Some(value);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.parallelism {
            Parallelism::Fixed(0) | Parallelism::Percent(0) => {
                return Err(ConfigError::InvalidParallelism(self.parallelism.to_string()))
            }
            _ => {}
        }

        let cobuild = &self.cobuild;
        if cobuild.lease_ttl_secs == 0 {
            return Err(ConfigError::invalid("cobuild.lease_ttl_secs", "must be positive"));
        }
        if cobuild.completed_ttl_secs == 0 {
            return Err(ConfigError::invalid("cobuild.completed_ttl_secs", "must be positive"));
        }
        if cobuild.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("cobuild.poll_interval_ms", "must be positive"));
        }
        if cobuild.heartbeat_interval_ms == 0
            || cobuild.heartbeat_interval() >= cobuild.lease_ttl()
        {
            return Err(ConfigError::invalid(
                "cobuild.heartbeat_interval_ms",
                format!(
                    "must be positive and shorter than the lease TTL ({}s)",
                    cobuild.lease_ttl_secs
                ),
            ));
        }
        Ok(())
    }

    /// Cobuild is active only when enabled and a context id is known.
    /// A missing runner id is generated once per call.
    pub fn cobuild_mode(&self) -> CobuildMode {
        match (&self.cobuild.enabled, &self.cobuild.context_id) {
            (true, Some(context_id)) => CobuildMode::Enabled {
                context_id: context_id.clone(),
                runner_id: self
                    .cobuild
                    .runner_id
                    .clone()
                    .unwrap_or_else(|| format!("runner-{}", Uuid::new_v4())),
            },
            _ => CobuildMode::Disabled,
        }
    }
}
