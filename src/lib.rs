// src/lib.rs

pub mod cli;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod types;

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{load_and_validate, CommandConfig, ConfigFile};
use crate::dispatch::{
    ConfigPolicyResolver, Dispatcher, DispatcherOptions, EnqueueRequest, JsonLinesBroadcaster,
    LoggingBroadcaster, LoggingFailureReporter, SnapshotBroadcaster,
};
use crate::exec::{ProgressPattern, ShellCommand};
use crate::types::CommandResult;

pub use crate::dispatch::{CommandHandle, ExecutionContext};
pub use crate::errors::{DispatchError, HandlerError};
pub use crate::types::{CommandStatus, CANCELLED_MESSAGE};

/// Final result of one configured command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `[command.<name>]` table key.
    pub name: String,
    pub run_id: String,
    pub result: CommandResult,
}

/// What `run` hands back to `main`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub outcomes: Vec<CommandOutcome>,
}

impl RunSummary {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &CommandOutcome> {
        self.outcomes.iter().filter(|o| !o.result.success)
    }

    pub fn print(&self) {
        for outcome in &self.outcomes {
            let mark = if outcome.result.success { "ok" } else { "FAILED" };
            println!("{:<8} {} ({})", mark, outcome.name, outcome.result.message);
        }
        let failed = self.failed().count();
        println!(
            "{} command(s), {} succeeded, {} failed",
            self.outcomes.len(),
            self.outcomes.len() - failed,
            failed
        );
    }
}

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - dispatcher with config-driven retry policies
/// - one shell command handler per `[command.<name>]`
/// - Ctrl-C handling (cancels every command, then lets the run finish)
pub async fn run(args: CliArgs) -> Result<RunSummary> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        print_dry_run(&cfg);
        return Ok(RunSummary::default());
    }

    let dispatcher = build_dispatcher(&cfg, args.parallelism, args.snapshots);

    // Ctrl-C → cancel everything; pending waits then resolve as cancelled.
    {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            warn!("Ctrl+C received; cancelling all commands");
            dispatcher.cancel_all();
        });
    }

    run_commands(&dispatcher, &cfg).await
}

/// Dispatcher configured from `cfg`, optionally overriding parallelism.
pub fn build_dispatcher(
    cfg: &ConfigFile,
    parallelism: Option<usize>,
    json_snapshots: bool,
) -> Dispatcher {
    let mut options = DispatcherOptions::from_config(cfg);
    if let Some(n) = parallelism {
        options.parallelism = n.max(1);
    }

    let broadcaster: Arc<dyn SnapshotBroadcaster> = if json_snapshots {
        Arc::new(JsonLinesBroadcaster::stdout())
    } else {
        Arc::new(LoggingBroadcaster)
    };

    Dispatcher::builder(options)
        .policy_resolver(Arc::new(ConfigPolicyResolver::from_config(cfg)))
        .broadcaster(broadcaster)
        .failure_reporter(Arc::new(LoggingFailureReporter))
        .build()
}

/// Queue every configured command, start `dispatcher`, wait for all of them
/// and stop the pool.
///
/// Workers only start once the whole batch is queued, so dispatch follows
/// priority rather than table order.
pub async fn run_commands(dispatcher: &Dispatcher, cfg: &ConfigFile) -> Result<RunSummary> {
    let mut pending = Vec::with_capacity(cfg.command.len());
    for (name, command) in &cfg.command {
        let enqueued = shell_request(name, command).and_then(|req| dispatcher.enqueue(req));
        match enqueued {
            Ok(handle) => pending.push((name.clone(), handle)),
            Err(e) => {
                dispatcher.stop().await;
                return Err(anyhow::Error::new(e).context(format!("enqueueing command '{name}'")));
            }
        }
    }
    info!(commands = pending.len(), "all commands queued");

    if let Err(e) = dispatcher.start() {
        dispatcher.stop().await;
        return Err(e.into());
    }

    let mut outcomes = Vec::with_capacity(pending.len());
    for (name, handle) in pending {
        let run_id = handle.run_id.clone();
        let result = handle.wait().await;
        debug!(command = %name, run_id = %run_id, success = result.success, "command finished");
        outcomes.push(CommandOutcome {
            name,
            run_id,
            result,
        });
    }

    dispatcher.stop().await;
    Ok(RunSummary { outcomes })
}

/// Enqueue request running `command` through the shell. The table key is
/// used as run id.
pub fn shell_request(name: &str, command: &CommandConfig) -> errors::Result<EnqueueRequest> {
    let mut shell = ShellCommand::new(command.cmd.clone());
    if let Some(pattern) = command.progress_on_stdout.as_deref() {
        shell = shell.with_progress(ProgressPattern::new(pattern)?);
    }

    let mut request = EnqueueRequest::new(command.effective_operation(name), shell.into_handler())
        .run_id(name)
        .priority(command.priority)
        .metadata(command.metadata.clone());
    if let Some(scope) = command.scope.as_deref() {
        request = request.scope(scope);
    }
    Ok(request)
}

/// Simple dry-run output: dispatcher settings, policies and commands.
fn print_dry_run(cfg: &ConfigFile) {
    println!("cmddispatch dry-run");
    println!("  dispatcher.parallelism = {}", cfg.dispatcher.parallelism);
    println!(
        "  dispatcher.completed_retention_secs = {}",
        cfg.dispatcher.completed_retention_secs
    );
    println!("  policy.default = {:?}", cfg.policy.default);
    for (op, policy) in &cfg.policy.operation {
        println!("  policy.operation.{op} = {:?}", policy.apply_to(&cfg.policy.default));
    }
    println!();

    let mut commands: Vec<_> = cfg.command.iter().collect();
    commands.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then_with(|| a.0.cmp(b.0)));

    println!("commands ({}), in dispatch order:", commands.len());
    for (name, command) in commands {
        println!("  - {name}");
        println!("      cmd: {}", command.cmd);
        println!("      operation: {}", command.effective_operation(name));
        println!("      priority: {}", command.priority);
        if let Some(ref scope) = command.scope {
            println!("      scope: {scope}");
        }
        if let Some(ref s) = command.progress_on_stdout {
            println!("      progress_on_stdout: {s}");
        }
        if !command.metadata.is_empty() {
            println!("      metadata: {:?}", command.metadata);
        }
    }

    debug!("dry-run complete (no execution)");
}
