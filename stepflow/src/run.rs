//! The whole control flow for one objective.
//!
//! Variables, then the plan, then execution against the checkpoint, then the
//! writer. Each phase function receives the [`RunState`] it needs explicitly.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::{Collaborators, StepHistory};
use crate::approval::{
    ExistingPlanChoice, PlanSeed, PlanSource, approve_plan, approve_variables,
    choose_existing_plan,
};
use crate::core::cancel::CancelToken;
use crate::core::progress::{
    CheckpointAssessment, ExecutionWindow, ResumeChoice, StepProgress, apply_resume_choice,
    assess_checkpoint,
};
use crate::core::types::{LearningDetail, PlanStep};
use crate::core::variables::{VariableMap, variable_map};
use crate::execution::{ExecutionLoop, ExecutionSummary, choose_resume};
use crate::io::artifacts::ArtifactLog;
use crate::io::checkpoint::CheckpointStore;
use crate::io::config::StepflowConfig;
use crate::io::gateway::ApprovalGateway;
use crate::io::paths::{WorkspacePaths, clear_plan_artifacts};
use crate::io::plan_store::{load_plan_steps, read_plan_markdown, write_plan_steps};
use crate::writer::{WriterInput, WriterReviewLoop};

/// In-memory state for one invocation.
#[derive(Debug, Clone)]
pub struct RunState {
    /// Objective as the collaborators see it, with `{{NAME}}` placeholders when
    /// variables were approved.
    pub objective: String,
    pub workspace: PathBuf,
    pub run_id: String,
    pub session_id: String,
    pub variables: VariableMap,
    pub window: ExecutionWindow,
    pub learning_detail: LearningDetail,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub plan_source: PlanSource,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub stopped_early: bool,
    pub todo_path: Option<PathBuf>,
    pub critique_passed: bool,
}

/// Run the full flow for `objective` in the workspace at `paths`.
#[instrument(skip_all, fields(root = %paths.root.display()))]
pub fn run(
    paths: &WorkspacePaths,
    config: &StepflowConfig,
    collaborators: &Collaborators<'_>,
    gateway: &dyn ApprovalGateway,
    objective: &str,
    cancel: &CancelToken,
) -> Result<RunOutcome> {
    config.validate()?;
    if objective.trim().is_empty() {
        bail!("objective is empty");
    }
    for dir in [&paths.state_dir, &paths.planning_dir] {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }

    let started = Utc::now();
    let run_id = format!("run-{}", started.format("%Y%m%dT%H%M%S%.3fZ"));
    let session_id = format!("{run_id}-{}", std::process::id());
    info!(run_id = %run_id, "starting run");

    let manifest = approve_variables(
        collaborators.variables,
        gateway,
        paths,
        objective,
        config.max_variable_revisions,
        cancel,
    )?;
    let (objective, variables) = match &manifest {
        Some(manifest) => (manifest.objective.clone(), variable_map(manifest)),
        None => (objective.to_string(), VariableMap::new()),
    };

    let checkpoint = CheckpointStore::new(&paths.checkpoint_path);
    let (plan_source, mut plan) =
        establish_plan(paths, config, collaborators, gateway, &checkpoint, &objective, cancel)?;
    if plan.is_empty() {
        bail!("plan has no steps");
    }

    let mut state = RunState {
        objective,
        workspace: paths.root.clone(),
        run_id,
        session_id,
        variables,
        window: ExecutionWindow::from_start(),
        learning_detail: config.learning_detail,
    };

    let summary = match assess_checkpoint(checkpoint.load()?, plan.len()) {
        CheckpointAssessment::AllComplete(progress) => {
            info!(steps = progress.total_steps, "every step already complete, skipping execution");
            ExecutionSummary {
                history: completed_history(&plan),
                stopped_early: false,
            }
        }
        assessment => {
            let mut progress = match assessment {
                CheckpointAssessment::Partial {
                    progress,
                    next_incomplete,
                    last_completed,
                } => {
                    let choice =
                        choose_resume(gateway, &progress, next_incomplete, last_completed, cancel)?;
                    if choice == ResumeChoice::Restart {
                        checkpoint.delete()?;
                    }
                    let (window, progress) =
                        apply_resume_choice(choice, progress, next_incomplete, last_completed);
                    state.window = window;
                    progress
                }
                _ => StepProgress::new(plan.len()),
            };
            let artifacts = ArtifactLog::new(paths);
            ExecutionLoop::new(
                collaborators,
                gateway,
                &checkpoint,
                &artifacts,
                &paths.plan_json_path,
                config.max_step_attempts,
            )
            .run(&state, &mut plan, &mut progress, cancel)?
        }
    };

    let steps_completed = checkpoint
        .load()?
        .filter(|progress| progress.matches_plan(plan.len()))
        .map_or(0, |progress| progress.completed_count());

    let writer = WriterReviewLoop::new(
        collaborators.writer,
        gateway,
        paths,
        config.max_writer_revisions,
    )
    .run(
        &WriterInput {
            objective: &state.objective,
            plan: &plan,
            history: &summary.history,
            variables: &state.variables,
        },
        cancel,
    )?;

    let outcome = RunOutcome {
        run_id: state.run_id,
        plan_source,
        steps_total: plan.len(),
        steps_completed,
        stopped_early: summary.stopped_early,
        todo_path: writer.todo_path,
        critique_passed: writer.critique_passed,
    };
    info!(
        steps_completed = outcome.steps_completed,
        steps_total = outcome.steps_total,
        stopped_early = outcome.stopped_early,
        "run finished"
    );
    Ok(outcome)
}

/// Resolve the plan for this run: reuse, create, or update.
fn establish_plan(
    paths: &WorkspacePaths,
    config: &StepflowConfig,
    collaborators: &Collaborators<'_>,
    gateway: &dyn ApprovalGateway,
    checkpoint: &CheckpointStore,
    objective: &str,
    cancel: &CancelToken,
) -> Result<(PlanSource, Vec<PlanStep>)> {
    let (source, seed) = match choose_existing_plan(gateway, paths, cancel)? {
        Some(ExistingPlanChoice::Use) => {
            if let Some(steps) = load_plan_steps(&paths.plan_json_path)? {
                info!(steps = steps.len(), "using existing plan");
                return Ok((PlanSource::Existing, steps));
            }
            let markdown = read_plan_markdown(&paths.plan_markdown_path)?
                .context("existing plan disappeared")?;
            let steps = collaborators.plan_reader.read_plan(&markdown, cancel)?;
            write_plan_steps(&paths.plan_json_path, &steps)?;
            return Ok((PlanSource::Existing, steps));
        }
        Some(ExistingPlanChoice::Update(change)) => {
            let previous = read_plan_markdown(&paths.plan_markdown_path)?.unwrap_or_default();
            (PlanSource::Updated, PlanSeed::update(previous, change))
        }
        Some(ExistingPlanChoice::CreateNew) | None => {
            clear_plan_artifacts(paths)?;
            checkpoint.delete()?;
            (PlanSource::Created, PlanSeed::default())
        }
    };

    let markdown = approve_plan(
        collaborators.plan_author,
        gateway,
        paths,
        objective,
        seed,
        config.max_plan_revisions,
        cancel,
    )?;
    let steps = collaborators
        .plan_reader
        .read_plan(&markdown, cancel)
        .context("convert approved plan")?;
    write_plan_steps(&paths.plan_json_path, &steps)?;
    if source == PlanSource::Updated {
        warn!("plan updated; a checkpoint from the previous plan is only reused if the step count matches");
    }
    info!(steps = steps.len(), source = source.as_str(), "plan ready");
    Ok((source, steps))
}

fn completed_history(plan: &[PlanStep]) -> Vec<StepHistory> {
    plan.iter()
        .enumerate()
        .map(|(i, step)| StepHistory {
            step_number: i + 1,
            title: step.title.clone(),
            status_summary: format!("Step {} completed in an earlier session", i + 1),
        })
        .collect()
}
