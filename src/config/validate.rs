// src/config/validate.rs

use std::time::Duration;

use regex::Regex;

use crate::config::model::{
    CommandConfig, ConfigFile, PolicyOverride, PolicySettings, RawConfigFile,
};
use crate::errors::{DispatchError, Result};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::DispatchError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.dispatcher, raw.policy, raw.command))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_dispatcher(cfg)?;
    validate_policy("policy.default", &cfg.policy.default)?;
    for (name, o) in cfg.policy.operation.iter() {
        validate_override(name, o, &cfg.policy.default)?;
    }
    for (name, cmd) in cfg.command.iter() {
        validate_command(name, cmd)?;
    }
    Ok(())
}

fn validate_dispatcher(cfg: &RawConfigFile) -> Result<()> {
    if cfg.dispatcher.parallelism == 0 {
        return Err(DispatchError::ConfigError(
            "[dispatcher].parallelism must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_policy(section: &str, p: &PolicySettings) -> Result<()> {
    if p.max_attempts == 0 {
        return Err(DispatchError::ConfigError(format!(
            "[{section}].max_attempts must be >= 1 (got 0)"
        )));
    }
    for (field, value) in [
        ("backoff_base_secs", p.backoff_base_secs),
        ("backoff_max_secs", p.backoff_max_secs),
    ] {
        if Duration::try_from_secs_f64(value).is_err() {
            return Err(DispatchError::ConfigError(format!(
                "[{section}].{field} must be a non-negative, representable duration (got {value})"
            )));
        }
    }
    if p.backoff_max_secs < p.backoff_base_secs {
        return Err(DispatchError::ConfigError(format!(
            "[{section}].backoff_max_secs ({}) is smaller than backoff_base_secs ({})",
            p.backoff_max_secs, p.backoff_base_secs
        )));
    }
    Ok(())
}

fn validate_override(name: &str, o: &PolicyOverride, default: &PolicySettings) -> Result<()> {
    // Validate the merged result, which is what the resolver will hand out.
    validate_policy(&format!("policy.operation.{name}"), &o.apply_to(default))
}

fn validate_command(name: &str, cmd: &CommandConfig) -> Result<()> {
    if cmd.cmd.trim().is_empty() {
        return Err(DispatchError::ConfigError(format!(
            "command '{name}' has an empty `cmd`"
        )));
    }
    if cmd.priority == 0 {
        return Err(DispatchError::ConfigError(format!(
            "command '{name}' has priority 0; priorities start at 1 (highest)"
        )));
    }
    if let Some(pattern) = cmd.progress_on_stdout.as_deref() {
        let re = Regex::new(pattern).map_err(|e| {
            DispatchError::ConfigError(format!(
                "command '{name}' has an invalid progress_on_stdout regex: {e}"
            ))
        })?;
        if !re.capture_names().flatten().any(|n| n == "step") {
            return Err(DispatchError::ConfigError(format!(
                "command '{name}': progress_on_stdout must contain a named group `step`"
            )));
        }
    }
    Ok(())
}
