// src/exec/mod.rs

//! Process execution layer.
//!
//! Turns a shell command line into a dispatcher [`Handler`](crate::dispatch::Handler):
//!
//! - [`shell`] spawns the process, waits for it and maps its exit status to a
//!   `CommandResult`, killing the child when the attempt is cancelled.
//! - [`progress`] parses `progress_on_stdout` matches into step updates.

pub mod progress;
pub mod shell;

pub use progress::{ProgressPattern, ProgressUpdate};
pub use shell::ShellCommand;
