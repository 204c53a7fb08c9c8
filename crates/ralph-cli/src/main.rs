//! Minimal command-line front end for the iteration controller.
//!
//! Deliberately thin: load a config file, wire up the real agent
//! subprocess runner, and drive the loop until it stops. Task import,
//! PRD decomposition, linting, and reporting surfaces live outside this
//! crate's scope; an operator wanting those builds them against
//! `ralph-core` directly.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ralph_core::{AgentRunner, AgentRunnerConfig, Config, Controller, LoopOutcome, Task};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "ralph", version, about = "Autonomous coding-agent iteration controller")]
struct Cli {
    /// Path to a TOML or YAML config file.
    #[arg(short, long, default_value = "ralph.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive the iteration loop under the given parent task id (empty
    /// string scopes to the whole tree).
    Run {
        #[arg(long, default_value = "")]
        parent: String,
    },
    /// Add a task to the task store.
    AddTask {
        id: String,
        title: String,
        #[arg(long)]
        parent: Option<String>,
    },
    /// Drop the pause flag so a running loop stops before its next iteration.
    Pause,
    /// Clear the pause flag.
    Resume,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    match cli.command {
        Command::Run { parent } => run(config, &parent).await,
        Command::AddTask { id, title, parent } => add_task(config, id, title, parent),
        Command::Pause => {
            let agent = Arc::new(AgentRunner::new(agent_runner_config(&config)));
            let controller = Controller::new(config, agent)?;
            controller.pause()?;
            Ok(())
        }
        Command::Resume => {
            let agent = Arc::new(AgentRunner::new(agent_runner_config(&config)));
            let controller = Controller::new(config, agent)?;
            controller.resume()?;
            Ok(())
        }
    }
}

fn agent_runner_config(config: &Config) -> AgentRunnerConfig {
    AgentRunnerConfig {
        command: config.agent_command.clone(),
        working_dir: config.working_dir.clone(),
        stream_echo: config.stream_echo,
    }
}

async fn run(config: Config, parent: &str) -> Result<()> {
    let agent = Arc::new(AgentRunner::new(agent_runner_config(&config)));
    let mut controller = Controller::new(config, agent)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt signal, cancelling in-flight iteration");
            shutdown.cancel();
        }
    });

    match controller.run_loop(parent, cancel).await {
        Ok(LoopOutcome::AllTasksCompleted) => {
            info!("all tasks completed");
            Ok(())
        }
        Ok(LoopOutcome::NoReadyTask) => {
            info!("no ready task; remaining work is blocked on dependencies or operators");
            Ok(())
        }
        Ok(LoopOutcome::Paused) => {
            info!("loop paused by operator");
            Ok(())
        }
        Ok(LoopOutcome::BudgetExceeded(reason)) => {
            info!(?reason, "budget exceeded, stopping");
            Ok(())
        }
        Ok(LoopOutcome::GutterDetected(status)) => {
            error!(?status, "stall detected, stopping for operator review");
            std::process::exit(1);
        }
        Err(e) => {
            error!(error = %e, "iteration loop failed");
            Err(e.into())
        }
    }
}

fn add_task(config: Config, id: String, title: String, parent: Option<String>) -> Result<()> {
    let mut task = Task::new(id, title);
    task.parent_id = parent;
    let agent = Arc::new(AgentRunner::new(agent_runner_config(&config)));
    let controller = Controller::new(config, agent)?;
    controller.task_store().save(task)?;
    Ok(())
}
