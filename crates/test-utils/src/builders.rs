#![allow(dead_code)]

use std::collections::BTreeMap;

use cmddispatch::config::{
    CommandConfig, ConfigFile, PolicyOverride, PolicySettings, RawConfigFile,
};
use cmddispatch::dispatch::RetryPolicy;
use std::time::Duration;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.config.dispatcher.parallelism = n;
        self
    }

    pub fn completed_retention_secs(mut self, secs: u64) -> Self {
        self.config.dispatcher.completed_retention_secs = secs;
        self
    }

    pub fn default_policy(mut self, policy: PolicySettings) -> Self {
        self.config.policy.default = policy;
        self
    }

    pub fn operation_policy(mut self, operation: &str, policy: PolicyOverride) -> Self {
        self.config
            .policy
            .operation
            .insert(operation.to_string(), policy);
        self
    }

    pub fn with_command(mut self, name: &str, command: CommandConfig) -> Self {
        self.config.command.insert(name.to_string(), command);
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `CommandConfig`.
pub struct CommandConfigBuilder {
    command: CommandConfig,
}

impl CommandConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            command: CommandConfig {
                cmd: cmd.to_string(),
                operation: None,
                priority: 2,
                scope: None,
                progress_on_stdout: None,
                metadata: BTreeMap::new(),
            },
        }
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.command.operation = Some(operation.to_string());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.command.priority = priority;
        self
    }

    pub fn scope(mut self, scope: &str) -> Self {
        self.command.scope = Some(scope.to_string());
        self
    }

    pub fn progress_on_stdout(mut self, pattern: &str) -> Self {
        self.command.progress_on_stdout = Some(pattern.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: &str) -> Self {
        self.command
            .metadata
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> CommandConfig {
        self.command
    }
}

/// Retry policy with millisecond-scale backoff, suitable for real-time tests.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        retry_on_failure_result: true,
        retry_on_exception: true,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        exponential: true,
        timeout: None,
    }
}
