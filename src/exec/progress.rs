// src/exec/progress.rs

//! Stdout progress parsing.
//!
//! A progress pattern is a regex with a named `step` group and optional
//! `max` and `desc` groups, e.g. `^\[(?P<step>\d+)/(?P<max>\d+)\] (?P<desc>.*)$`.

use regex::Regex;

use crate::errors::{DispatchError, Result};

/// One progress report extracted from a stdout line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub current_step: u32,
    pub max_step: Option<u32>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProgressPattern {
    regex: Regex,
}

impl ProgressPattern {
    /// Compile `pattern`, requiring a `step` capture group.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| DispatchError::InvalidArgument(format!("invalid progress pattern: {e}")))?;
        Self::from_regex(regex)
    }

    pub fn from_regex(regex: Regex) -> Result<Self> {
        if !regex.capture_names().flatten().any(|n| n == "step") {
            return Err(DispatchError::InvalidArgument(format!(
                "progress pattern '{}' has no `step` group",
                regex.as_str()
            )));
        }
        Ok(Self { regex })
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Lines that match but carry a non-numeric step are ignored.
    pub fn parse(&self, line: &str) -> Option<ProgressUpdate> {
        let caps = self.regex.captures(line)?;
        let current_step = caps.name("step")?.as_str().trim().parse().ok()?;
        let max_step = caps
            .name("max")
            .and_then(|m| m.as_str().trim().parse().ok());
        let description = caps
            .name("desc")
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty());

        Some(ProgressUpdate {
            current_step,
            max_step,
            description,
        })
    }
}
