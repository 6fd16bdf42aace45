//! Human-gated, resumable step execution runner.
//!
//! State lives under `<workspace>/.stepflow/`: config, plan, variables, checkpoint,
//! and per-attempt artifacts. The final todo list is written to
//! `<workspace>/todo_final.json`.

use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stepflow::agents::Collaborators;
use stepflow::agents::command::CommandAgent;
use stepflow::core::cancel::CancelToken;
use stepflow::exit_codes;
use stepflow::io::actor::CommandActor;
use stepflow::io::checkpoint::CheckpointStore;
use stepflow::io::config::load_config;
use stepflow::io::gateway::ConsoleGateway;
use stepflow::io::paths::{InitOptions, WorkspacePaths, init_workspace};
use stepflow::logging;
use stepflow::run::run;

#[derive(Parser)]
#[command(
    name = "stepflow",
    version,
    about = "Human-gated, resumable step execution for objective-driven agent runs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.stepflow/` and a default `config.toml`.
    Init {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
        /// Overwrite an existing config with defaults.
        #[arg(short, long)]
        force: bool,
    },
    /// Plan, execute, and summarize an objective.
    Run {
        #[arg(short, long)]
        objective: String,
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
        /// Log progress at info level (overridden by `RUST_LOG`).
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print checkpoint progress.
    Status {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Delete the checkpoint so the next run starts fresh.
    Reset {
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let verbose = matches!(cli.command, Command::Run { verbose: true, .. });
    logging::init(verbose);

    let code = match dispatch(cli.command) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::for_error(&err)
        }
    };
    std::process::exit(code);
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Init { workspace, force } => cmd_init(&workspace, force),
        Command::Run {
            objective,
            workspace,
            ..
        } => cmd_run(&workspace, &objective),
        Command::Status { workspace } => cmd_status(&workspace),
        Command::Reset { workspace } => cmd_reset(&workspace),
    }
}

fn cmd_init(workspace: &Path, force: bool) -> Result<()> {
    let paths = init_workspace(workspace, &InitOptions { force })?;
    println!("initialized {}", paths.stepflow_dir.display());
    Ok(())
}

fn cmd_run(workspace: &Path, objective: &str) -> Result<()> {
    let paths = WorkspacePaths::new(workspace);
    let config = load_config(&paths.config_path)?;
    config.validate().context("invalid config")?;

    let agent = CommandAgent::new(
        CommandActor::from_config(&config.actor),
        paths.clone(),
        &config,
    );
    let collaborators = Collaborators::uniform(&agent);
    let gateway = ConsoleGateway::new(BufReader::new(io::stdin()), io::stdout());
    let cancel = CancelToken::new();

    let outcome = run(&paths, &config, &collaborators, &gateway, objective, &cancel)?;
    let summary = serde_json::to_string_pretty(&outcome).context("serialize run outcome")?;
    println!("{summary}");
    Ok(())
}

fn cmd_status(workspace: &Path) -> Result<()> {
    let paths = WorkspacePaths::new(workspace);
    let store = CheckpointStore::new(&paths.checkpoint_path);
    match store.load()? {
        Some(progress) => println!(
            "{}/{} steps completed (last updated {})",
            progress.completed_count(),
            progress.total_steps,
            progress.last_updated.to_rfc3339()
        ),
        None => println!("no checkpoint"),
    }
    Ok(())
}

fn cmd_reset(workspace: &Path) -> Result<()> {
    let paths = WorkspacePaths::new(workspace);
    CheckpointStore::new(&paths.checkpoint_path).delete()?;
    println!("checkpoint cleared");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["stepflow", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true, .. }));
    }

    #[test]
    fn parse_run_requires_objective() {
        assert!(Cli::try_parse_from(["stepflow", "run"]).is_err());
        let cli = Cli::parse_from(["stepflow", "run", "--objective", "Ship it", "-w", "/tmp/ws"]);
        match cli.command {
            Command::Run {
                objective,
                workspace,
                verbose,
            } => {
                assert_eq!(objective, "Ship it");
                assert_eq!(workspace, PathBuf::from("/tmp/ws"));
                assert!(!verbose);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn status_and_reset_on_empty_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        cmd_status(dir.path()).expect("status");
        cmd_reset(dir.path()).expect("reset");
    }
}
