//! Actor abstraction for agent CLI invocation.
//!
//! The [`Actor`] trait decouples the collaborator prompts from the agent backend
//! (by default `codex exec`). Tests use fake actors that write predetermined
//! outputs without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::io::config::ActorConfig;
use crate::io::process::run_command_with_timeout;

/// Parameters for one actor invocation.
#[derive(Debug, Clone)]
pub struct ActorRequest {
    /// Working directory for the actor process.
    pub workdir: PathBuf,
    /// Prompt text fed on stdin.
    pub prompt: String,
    /// JSON Schema that constrains the actor's final message.
    pub output_schema_path: PathBuf,
    /// Where the actor must write its final JSON message.
    pub output_path: PathBuf,
    /// Where captured stdout/stderr are written.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over agent backends. Must write output JSON to `request.output_path`.
pub trait Actor {
    fn invoke(&self, request: &ActorRequest, cancel: &CancelToken) -> Result<()>;
}

/// Actor that spawns the configured agent CLI.
#[derive(Debug, Clone)]
pub struct CommandActor {
    command: Vec<String>,
}

impl CommandActor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    pub fn from_config(config: &ActorConfig) -> Self {
        Self::new(config.command.clone())
    }
}

impl Actor for CommandActor {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, request: &ActorRequest, cancel: &CancelToken) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("actor command is empty"))?;
        info!(program = %program, workdir = %request.workdir.display(), "starting actor");

        if !request.output_schema_path.exists() {
            return Err(anyhow!(
                "missing output schema {}",
                request.output_schema_path.display()
            ));
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            cancel,
        )
        .with_context(|| format!("run {program}"))?;

        write_actor_log(
            &request.log_path,
            &output.render_log("actor"),
            request.output_limit_bytes,
        )?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "actor timed out");
            return Err(anyhow!("{program} timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "actor failed");
            return Err(anyhow!(
                "{program} failed with status {:?}",
                output.status.code()
            ));
        }

        debug!("actor completed successfully");
        Ok(())
    }
}

/// Invoke the actor and load its output as JSON of type `T`.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn invoke_and_load_json<A: Actor + ?Sized, T: DeserializeOwned>(
    actor: &A,
    request: &ActorRequest,
    cancel: &CancelToken,
) -> Result<T> {
    let value = invoke_and_load_value(actor, request, cancel)?;
    serde_json::from_value(value)
        .with_context(|| format!("deserialize {}", request.output_path.display()))
}

/// Invoke the actor and load its output as untyped JSON.
pub fn invoke_and_load_value<A: Actor + ?Sized>(
    actor: &A,
    request: &ActorRequest,
    cancel: &CancelToken,
) -> Result<Value> {
    cancel.check()?;
    // Stale output from an earlier attempt must not be mistaken for this one.
    remove_if_exists(&request.output_path)?;
    actor.invoke(request, cancel)?;
    if !request.output_path.exists() {
        return Err(anyhow!(
            "missing actor output {}",
            request.output_path.display()
        ));
    }
    let contents = fs::read_to_string(&request.output_path)
        .with_context(|| format!("read actor output {}", request.output_path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("parse {}", request.output_path.display()))
}

/// Validate a JSON instance against a JSON Schema document.
pub fn validate_against_schema(schema: &str, instance: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(schema).context("parse output schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn write_actor_log(path: &Path, log: &str, output_limit: usize) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create actor log dir {}", parent.display()))?;
    }
    let body = if log.len() > output_limit {
        let mut cut = output_limit;
        while !log.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n[truncated {} bytes]\n", &log[..cut], log.len() - cut)
    } else {
        log.to_string()
    };
    fs::write(path, body).with_context(|| format!("write actor log {}", path.display()))
}
