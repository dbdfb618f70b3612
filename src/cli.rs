// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::default_config_path;

/// Command-line arguments for `cmddispatch`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "cmddispatch",
    version,
    about = "Run configured shell commands through a priority dispatcher.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Cmddispatch.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_config_path())]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `CMDDISPATCH_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the resolved commands, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Override `[dispatcher].parallelism`.
    #[arg(long, value_name = "N")]
    pub parallelism: Option<usize>,

    /// Print every snapshot list to stdout as one JSON line.
    #[arg(long)]
    pub snapshots: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
