//! The per-step outer loop: skip logic, step runs, and the human gate.

use std::path::Path;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::agents::{Collaborators, StepHistory};
use crate::core::cancel::CancelToken;
use crate::core::progress::{ResumeChoice, StepProgress};
use crate::core::types::PlanStep;
use crate::io::artifacts::ArtifactLog;
use crate::io::checkpoint::CheckpointStore;
use crate::io::gateway::{
    ApprovalGateway, ApprovalRequest, ChoiceSet, DecisionOutcome, decide, request_id,
};
use crate::io::plan_store::write_plan_steps;
use crate::learning::LearningRecorder;
use crate::run::RunState;
use crate::step_runner::{StepInput, StepRunResult, StepRunner};

const STOP_LABEL: &str = "Stop execution and write the todo list";
const REEXECUTE_LABEL: &str = "Re-execute step with feedback";

/// What happened across the plan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionSummary {
    /// One entry per step that is complete or was attempted, in plan order.
    pub history: Vec<StepHistory>,
    /// The human chose to stop before the end of the plan.
    pub stopped_early: bool,
}

/// Answer from the step review gate.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GateVerdict {
    Approved,
    Rejected { feedback: String },
}

pub struct ExecutionLoop<'a> {
    collaborators: &'a Collaborators<'a>,
    gateway: &'a dyn ApprovalGateway,
    checkpoint: &'a CheckpointStore,
    artifacts: &'a ArtifactLog,
    plan_json_path: &'a Path,
    max_step_attempts: u32,
}

impl<'a> ExecutionLoop<'a> {
    pub fn new(
        collaborators: &'a Collaborators<'a>,
        gateway: &'a dyn ApprovalGateway,
        checkpoint: &'a CheckpointStore,
        artifacts: &'a ArtifactLog,
        plan_json_path: &'a Path,
        max_step_attempts: u32,
    ) -> Self {
        Self {
            collaborators,
            gateway,
            checkpoint,
            artifacts,
            plan_json_path,
            max_step_attempts,
        }
    }

    /// Run every step the window does not skip.
    ///
    /// `progress` is saved after every approval, so a failure or cancellation
    /// leaves the checkpoint at the last approved step.
    #[instrument(skip_all, fields(run_id = %state.run_id, steps = plan.len()))]
    pub fn run(
        &self,
        state: &RunState,
        plan: &mut [PlanStep],
        progress: &mut StepProgress,
        cancel: &CancelToken,
    ) -> Result<ExecutionSummary> {
        let total = plan.len();
        let recorder = LearningRecorder::new(
            self.collaborators.analyst,
            self.artifacts,
            state.learning_detail,
        );
        let runner = StepRunner::new(
            self.collaborators.executor,
            self.collaborators.validator,
            recorder,
            self.artifacts,
            self.max_step_attempts,
        );
        let mut summary = ExecutionSummary::default();
        // Rejection feedback from every gate so far; later steps see all of it.
        let mut feedback_history: Vec<String> = Vec::new();

        for index in 0..total {
            let step_number = index + 1;
            if state.window.skips(index, progress) {
                if progress.is_completed(index) {
                    summary.history.push(StepHistory {
                        step_number,
                        title: plan[index].title.clone(),
                        status_summary: format!(
                            "Step {step_number} completed in an earlier session"
                        ),
                    });
                }
                info!(step = step_number, "skipping step");
                continue;
            }

            let fast = state.window.fast_execute.contains(index);
            let mut human_feedback: Option<String> = None;
            let mut notes: Vec<String> = Vec::new();
            // This step's own rejections; they reach later steps once it settles.
            let mut step_feedback: Vec<String> = Vec::new();

            loop {
                cancel.check()?;
                let input = StepInput {
                    objective: &state.objective,
                    index,
                    total_steps: total,
                    variables: &state.variables,
                    human_feedback: human_feedback.as_deref(),
                    prior_step_feedback: &feedback_history,
                    fast,
                };
                let result = runner.run(&input, &mut plan[index], &mut notes, cancel)?;
                let status_summary = result.gate_summary(step_number);

                let verdict = if fast {
                    info!(step = step_number, "fast execute, gate skipped");
                    GateVerdict::Approved
                } else {
                    self.review(&plan[index], step_number, total, &result, cancel)?
                };

                let feedback = match verdict {
                    GateVerdict::Approved => {
                        feedback_history.append(&mut step_feedback);
                        progress.mark_completed(index);
                        self.checkpoint.save(progress)?;
                        write_plan_steps(self.plan_json_path, plan)?;
                        summary.history.push(StepHistory {
                            step_number,
                            title: plan[index].title.clone(),
                            status_summary,
                        });
                        info!(
                            step = step_number,
                            completed = progress.completed_count(),
                            "step approved"
                        );
                        break;
                    }
                    GateVerdict::Rejected { feedback } => feedback,
                };

                if !feedback.is_empty() {
                    step_feedback.push(format!("Step {step_number}/{total} Feedback: {feedback}"));
                }
                if self.ask_reexecute(step_number, &feedback, cancel)? {
                    info!(step = step_number, "re-executing step with human feedback");
                    human_feedback = (!feedback.is_empty()).then_some(feedback);
                    continue;
                }

                warn!(step = step_number, "execution stopped at human request");
                summary.history.push(StepHistory {
                    step_number,
                    title: plan[index].title.clone(),
                    status_summary: format!("{status_summary} (rejected, execution stopped)"),
                });
                summary.stopped_early = true;
                return Ok(summary);
            }
        }

        Ok(summary)
    }

    fn review(
        &self,
        step: &PlanStep,
        step_number: usize,
        total: usize,
        result: &StepRunResult,
        cancel: &CancelToken,
    ) -> Result<GateVerdict> {
        let mut context = format!(
            "{}\nAttempts used: {}/{}",
            result.gate_summary(step_number),
            result.attempts,
            self.max_step_attempts
        );
        if let Some(outcome) = &result.last_outcome
            && !outcome.feedback.is_empty()
        {
            context.push_str("\n\nValidation issues:");
            for item in &outcome.feedback {
                context.push_str("\n- ");
                context.push_str(&item.issue);
            }
        }
        if !result.trace.is_empty() {
            context.push_str("\n\nExecution summary:\n");
            context.push_str(&result.trace);
        }

        let request = ApprovalRequest::new(
            request_id("step_review", step_number),
            format!("Review step {step_number}/{total}: {}", step.title),
            context,
            ChoiceSet::binary("Approve and continue", "Reject with feedback"),
        );
        let decision = decide(self.gateway, &request, cancel)?;
        Ok(match decision.outcome {
            DecisionOutcome::Reject => GateVerdict::Rejected {
                feedback: decision.feedback().to_string(),
            },
            _ => GateVerdict::Approved,
        })
    }

    /// True to run the step again, false to stop execution.
    fn ask_reexecute(
        &self,
        step_number: usize,
        feedback: &str,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let context = if feedback.is_empty() {
            "No feedback was given.".to_string()
        } else {
            format!("Feedback: {feedback}")
        };
        let request = ApprovalRequest::new(
            request_id("step_reexecute", step_number),
            format!("Step {step_number} was rejected. Re-execute it or stop?"),
            context,
            // Stop first: a failed gate resolves to ChoiceA.
            ChoiceSet::labelled(&[STOP_LABEL, REEXECUTE_LABEL]),
        );
        let decision = decide(self.gateway, &request, cancel)?;
        Ok(decision.outcome == DecisionOutcome::ChoiceB)
    }
}

/// Ask how to continue from a partial checkpoint.
pub fn choose_resume(
    gateway: &dyn ApprovalGateway,
    progress: &StepProgress,
    next_incomplete: usize,
    last_completed: usize,
    cancel: &CancelToken,
) -> Result<ResumeChoice> {
    let labels = [
        format!("Resume from step {}", next_incomplete + 1),
        "Start from beginning".to_string(),
        format!(
            "Fast execute steps 1-{} without review, then continue",
            last_completed + 1
        ),
    ];
    let request = ApprovalRequest::new(
        request_id("resume", progress.total_steps),
        "A checkpoint exists for this plan. How do you want to continue?",
        format!(
            "{}/{} steps complete, last updated {}",
            progress.completed_count(),
            progress.total_steps,
            progress.last_updated.to_rfc3339()
        ),
        ChoiceSet::labelled(&labels),
    );
    let decision = decide(gateway, &request, cancel)?;
    let choice = match decision.outcome {
        DecisionOutcome::ChoiceB => ResumeChoice::Restart,
        DecisionOutcome::ChoiceC => ResumeChoice::FastExecute,
        _ => ResumeChoice::Resume,
    };
    info!(choice = ?choice, "resume strategy chosen");
    Ok(choice)
}
