// src/config/model.rs

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [dispatcher]
/// parallelism = 2
///
/// [policy.default]
/// max_attempts = 3
/// retry_on_failure_result = true
///
/// [policy.operation.build]
/// timeout_secs = 600
///
/// [command.build]
/// cmd = "cargo build"
/// priority = 1
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub dispatcher: DispatcherSection,

    #[serde(default)]
    pub policy: PolicySection,

    /// Commands to run from the CLI, keyed by table name.
    #[serde(default)]
    pub command: BTreeMap<String, CommandConfig>,
}

/// Validated configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub dispatcher: DispatcherSection,
    pub policy: PolicySection,
    pub command: BTreeMap<String, CommandConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        dispatcher: DispatcherSection,
        policy: PolicySection,
        command: BTreeMap<String, CommandConfig>,
    ) -> Self {
        Self {
            dispatcher,
            policy,
            command,
        }
    }
}

/// `[dispatcher]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    /// Number of worker loops, i.e. the maximum number of commands running
    /// at the same time.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// How long finished commands stay visible in snapshots.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
}

fn default_parallelism() -> usize {
    2
}

fn default_completed_retention_secs() -> u64 {
    300
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            completed_retention_secs: default_completed_retention_secs(),
        }
    }
}

impl DispatcherSection {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

/// `[policy]` section: a default policy plus per-operation overrides.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PolicySection {
    #[serde(default)]
    pub default: PolicySettings,

    /// `[policy.operation.<name>]` tables.
    #[serde(default)]
    pub operation: BTreeMap<String, PolicyOverride>,
}

/// A complete retry/timeout/backoff policy.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PolicySettings {
    /// Per-attempt timeout in seconds; 0 disables it.
    #[serde(default)]
    pub timeout_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub retry_on_failure_result: bool,

    #[serde(default = "default_true")]
    pub retry_on_exception: bool,

    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,

    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: f64,

    #[serde(default = "default_true")]
    pub exponential: bool,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_backoff_base_secs() -> f64 {
    1.0
}

fn default_backoff_max_secs() -> f64 {
    30.0
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            max_attempts: default_max_attempts(),
            retry_on_failure_result: false,
            retry_on_exception: true,
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            exponential: true,
        }
    }
}

/// Per-operation policy tweaks; unset fields inherit from `[policy.default]`.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct PolicyOverride {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub retry_on_failure_result: Option<bool>,
    #[serde(default)]
    pub retry_on_exception: Option<bool>,
    #[serde(default)]
    pub backoff_base_secs: Option<f64>,
    #[serde(default)]
    pub backoff_max_secs: Option<f64>,
    #[serde(default)]
    pub exponential: Option<bool>,
}

impl PolicyOverride {
    pub fn apply_to(&self, base: &PolicySettings) -> PolicySettings {
        PolicySettings {
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            retry_on_failure_result: self
                .retry_on_failure_result
                .unwrap_or(base.retry_on_failure_result),
            retry_on_exception: self.retry_on_exception.unwrap_or(base.retry_on_exception),
            backoff_base_secs: self.backoff_base_secs.unwrap_or(base.backoff_base_secs),
            backoff_max_secs: self.backoff_max_secs.unwrap_or(base.backoff_max_secs),
            exponential: self.exponential.unwrap_or(base.exponential),
        }
    }
}

/// `[command.<name>]` section: a shell command run by the CLI.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandConfig {
    /// Shell command line.
    pub cmd: String,

    /// Operation name used for policy lookup and display. Defaults to the
    /// table key.
    #[serde(default)]
    pub operation: Option<String>,

    #[serde(default = "default_priority")]
    pub priority: u8,

    #[serde(default)]
    pub scope: Option<String>,

    /// Regex matched against stdout lines; needs a `step` group and may have
    /// `max` and `desc` groups.
    #[serde(default)]
    pub progress_on_stdout: Option<String>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_priority() -> u8 {
    2
}

impl CommandConfig {
    /// Effective operation name given the table key.
    pub fn effective_operation<'a>(&'a self, key: &'a str) -> &'a str {
        match self.operation.as_deref() {
            Some(op) if !op.trim().is_empty() => op,
            _ => key,
        }
    }
}
