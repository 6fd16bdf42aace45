//! Stepflow configuration stored under `.stepflow/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::core::types::LearningDetail;

/// Stepflow configuration (TOML).
///
/// Intended to be edited by humans. Missing fields fall back to the defaults
/// below, and a missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StepflowConfig {
    /// Automatic execute/validate attempts per step before the human gate.
    pub max_step_attempts: u32,

    /// Plan drafts a human may reject before the run aborts.
    pub max_plan_revisions: u32,

    /// Variable manifests a human may reject before the run aborts.
    pub max_variable_revisions: u32,

    /// Writer passes judged by the automated critique.
    pub max_writer_revisions: u32,

    pub learning_detail: LearningDetail,

    /// Prompt size ceiling; droppable sections go first.
    pub prompt_budget_bytes: usize,

    pub actor: ActorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ActorConfig {
    /// Agent CLI argv; output-schema and prompt arguments are appended.
    pub command: Vec<String>,

    /// Wall-clock limit for a single actor invocation, in seconds.
    pub timeout_secs: u64,

    /// Truncate actor stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl ActorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for StepflowConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            max_plan_revisions: 20,
            max_variable_revisions: 10,
            max_writer_revisions: 3,
            learning_detail: LearningDetail::General,
            prompt_budget_bytes: 40_000,
            actor: ActorConfig::default(),
        }
    }
}

impl StepflowConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_step_attempts", self.max_step_attempts),
            ("max_plan_revisions", self.max_plan_revisions),
            ("max_variable_revisions", self.max_variable_revisions),
            ("max_writer_revisions", self.max_writer_revisions),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        if self.prompt_budget_bytes == 0 {
            return Err(anyhow!("prompt_budget_bytes must be > 0"));
        }
        if self.actor.timeout_secs == 0 {
            return Err(anyhow!("actor.timeout_secs must be > 0"));
        }
        if self.actor.output_limit_bytes == 0 {
            return Err(anyhow!("actor.output_limit_bytes must be > 0"));
        }
        if self.actor.command.is_empty() || self.actor.command[0].trim().is_empty() {
            return Err(anyhow!("actor.command must be a non-empty array"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `StepflowConfig::default()`.
pub fn load_config(path: &Path) -> Result<StepflowConfig> {
    if !path.exists() {
        let cfg = StepflowConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: StepflowConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &StepflowConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
