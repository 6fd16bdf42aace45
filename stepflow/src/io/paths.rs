//! Canonical paths within `.stepflow/` and workspace scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use super::config::{StepflowConfig, write_config};

/// All canonical paths for a workspace root.
#[derive(Debug, Clone)]
pub struct WorkspacePaths {
    pub root: PathBuf,
    pub stepflow_dir: PathBuf,
    pub state_dir: PathBuf,
    pub schemas_dir: PathBuf,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub planning_dir: PathBuf,
    pub plan_markdown_path: PathBuf,
    pub plan_json_path: PathBuf,
    pub variables_path: PathBuf,
    pub execution_dir: PathBuf,
    pub validation_dir: PathBuf,
    pub learnings_dir: PathBuf,
    pub writer_dir: PathBuf,
    pub todo_path: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let stepflow_dir = root.join(".stepflow");
        let state_dir = stepflow_dir.join("state");
        let planning_dir = stepflow_dir.join("planning");
        Self {
            root: root.clone(),
            stepflow_dir: stepflow_dir.clone(),
            state_dir: state_dir.clone(),
            schemas_dir: state_dir.join("schemas"),
            config_path: stepflow_dir.join("config.toml"),
            checkpoint_path: state_dir.join("steps_done.json"),
            planning_dir: planning_dir.clone(),
            plan_markdown_path: planning_dir.join("plan.md"),
            plan_json_path: planning_dir.join("plan.json"),
            variables_path: stepflow_dir.join("variables").join("variables.json"),
            execution_dir: stepflow_dir.join("execution"),
            validation_dir: stepflow_dir.join("validation"),
            learnings_dir: stepflow_dir.join("learnings"),
            writer_dir: stepflow_dir.join("writer"),
            todo_path: root.join("todo_final.json"),
        }
    }

    /// `.stepflow/<phase>/<detail>` scratch directory for one actor invocation.
    pub fn phase_dir(&self, phase: &str, detail: &str) -> PathBuf {
        self.stepflow_dir.join("runs").join(phase).join(detail)
    }
}

/// Options for [`init_workspace`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overwrite an existing `config.toml` with defaults.
    pub force: bool,
}

/// Create `.stepflow/` and a default `config.toml`.
///
/// Existing config is preserved unless `force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<WorkspacePaths> {
    let paths = WorkspacePaths::new(root);
    for dir in [&paths.state_dir, &paths.planning_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &StepflowConfig::default())?;
        info!(path = %paths.config_path.display(), "wrote default config");
    }
    Ok(paths)
}

/// Remove the plan files and every per-step artifact directory.
///
/// Used when the human chooses to create a brand-new plan. The checkpoint is owned
/// by the caller and is not touched here.
pub fn clear_plan_artifacts(paths: &WorkspacePaths) -> Result<()> {
    for file in [&paths.plan_markdown_path, &paths.plan_json_path] {
        match fs::remove_file(file) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {}", file.display())),
        }
    }
    for dir in [
        &paths.execution_dir,
        &paths.validation_dir,
        &paths.learnings_dir,
    ] {
        if dir.exists() {
            fs::remove_dir_all(dir).with_context(|| format!("remove {}", dir.display()))?;
        }
    }
    info!("cleared previous plan artifacts");
    Ok(())
}
