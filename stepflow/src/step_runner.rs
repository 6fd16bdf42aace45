//! Drives one step through execute, validate and learn with bounded retries.
//!
//! The runner ends after a validated success or after the last allowed attempt,
//! whichever comes first. Either way the caller takes the result to the human
//! gate; the runner itself never asks a human anything.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::{StepExecutionRequest, StepExecutor, StepValidator, ValidationRequest};
use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::types::{PlanStep, ValidationOutcome};
use crate::core::variables::{VariableMap, resolve, resolve_step};
use crate::io::artifacts::{ArtifactLog, ExecutionRecord, ValidationRecord};
use crate::learning::{AttemptRef, LearningRecord, LearningRecorder};

/// Everything about the surrounding run that one step cycle needs.
#[derive(Debug, Clone, Copy)]
pub struct StepInput<'a> {
    /// Objective with `{{NAME}}` placeholders.
    pub objective: &'a str,
    /// 0-based position in the plan.
    pub index: usize,
    pub total_steps: usize,
    pub variables: &'a VariableMap,
    /// Feedback from the human who rejected this step's previous result.
    pub human_feedback: Option<&'a str>,
    /// Feedback collected at earlier gates of this run.
    pub prior_step_feedback: &'a [String],
    /// Fast-execute replay: learning is skipped.
    pub fast: bool,
}

impl StepInput<'_> {
    pub fn step_number(&self) -> usize {
        self.index + 1
    }
}

/// What the human gate receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRunResult {
    /// Latest validation produced, if any attempt got that far.
    pub last_outcome: Option<ValidationOutcome>,
    pub attempts: u32,
    /// Summary reported by the last successful execution.
    pub trace: String,
}

impl StepRunResult {
    pub fn succeeded(&self) -> bool {
        self.last_outcome.as_ref().is_some_and(|o| o.success)
    }

    /// One-line status shown at the gate and handed to the writer.
    pub fn gate_summary(&self, step_number: usize) -> String {
        match &self.last_outcome {
            Some(outcome) => outcome.summary(step_number),
            None => {
                format!("Step {step_number} execution failed - no validation response available")
            }
        }
    }
}

pub struct StepRunner<'a> {
    executor: &'a dyn StepExecutor,
    validator: &'a dyn StepValidator,
    learning: LearningRecorder<'a>,
    artifacts: &'a ArtifactLog,
    max_attempts: u32,
}

impl<'a> StepRunner<'a> {
    pub fn new(
        executor: &'a dyn StepExecutor,
        validator: &'a dyn StepValidator,
        learning: LearningRecorder<'a>,
        artifacts: &'a ArtifactLog,
        max_attempts: u32,
    ) -> Self {
        Self {
            executor,
            validator,
            learning,
            artifacts,
            max_attempts,
        }
    }

    /// Run up to `max_attempts` execute/validate cycles for `step`.
    ///
    /// `step` is the in-memory plan entry. Refined descriptions replace its
    /// description and learned patterns are pushed onto it; `notes` collects the
    /// running learning context for this step across gate cycles.
    #[instrument(skip_all, fields(step = input.step_number(), fast = input.fast))]
    pub fn run(
        &self,
        input: &StepInput<'_>,
        step: &mut PlanStep,
        notes: &mut Vec<String>,
        cancel: &CancelToken,
    ) -> Result<StepRunResult> {
        let step_number = input.step_number();
        let mut feedback: Vec<String> = Vec::new();
        let mut last_outcome: Option<ValidationOutcome> = None;
        let mut trace = String::new();
        let mut attempts = 0;

        for attempt in 1..=self.max_attempts {
            cancel.check()?;
            attempts = attempt;
            info!(attempt, max_attempts = self.max_attempts, "executing step");

            let request = StepExecutionRequest {
                objective: resolve(input.objective, input.variables),
                step_number,
                total_steps: input.total_steps,
                attempt,
                max_attempts: self.max_attempts,
                step: resolve_step(step, input.variables),
                learning_context: learning_context(step, notes),
                validation_feedback: feedback.clone(),
                human_feedback: input.human_feedback.map(str::to_string),
                prior_step_feedback: input.prior_step_feedback.to_vec(),
                replay: input.fast,
            };

            let report = match self.executor.execute(&request, cancel) {
                Ok(report) => report,
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    warn!(attempt, phase = "execution", err = %format!("{err:#}"), "execution failed");
                    self.artifacts.record_execution(&ExecutionRecord {
                        step_number,
                        attempt,
                        replay: input.fast,
                        title: &step.title,
                        summary: None,
                        error: Some(format!("{err:#}")),
                        recorded_at: Utc::now(),
                    })?;
                    feedback.push(format!("Attempt {attempt} could not run: {err:#}"));
                    continue;
                }
            };
            self.artifacts.record_execution(&ExecutionRecord {
                step_number,
                attempt,
                replay: input.fast,
                title: &step.title,
                summary: Some(&report.summary),
                error: None,
                recorded_at: Utc::now(),
            })?;
            trace = report.summary;

            cancel.check()?;
            let validation_request = ValidationRequest {
                objective: input.objective.to_string(),
                step_number,
                total_steps: input.total_steps,
                attempt,
                step: step.clone(),
                execution_trace: trace.clone(),
            };
            let outcome = match self.validator.validate(&validation_request, cancel) {
                Ok(outcome) => outcome,
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) => {
                    warn!(attempt, phase = "validation", err = %format!("{err:#}"), "validation failed");
                    self.artifacts.record_validation(&ValidationRecord {
                        step_number,
                        attempt,
                        outcome: None,
                        error: Some(format!("{err:#}")),
                        recorded_at: Utc::now(),
                    })?;
                    feedback.push(format!("Attempt {attempt} could not be validated: {err:#}"));
                    continue;
                }
            };
            self.artifacts.record_validation(&ValidationRecord {
                step_number,
                attempt,
                outcome: Some(&outcome),
                error: None,
                recorded_at: Utc::now(),
            })?;
            info!(
                attempt,
                success = outcome.success,
                status = outcome.status.as_str(),
                issues = outcome.feedback.len(),
                "step validated"
            );

            if !input.fast {
                let at = AttemptRef {
                    objective: input.objective,
                    step_number,
                    attempt,
                };
                match self.learning.record_outcome(at, step, &trace, &outcome, cancel) {
                    Ok(record) => fold_learning(step, notes, &record),
                    Err(err) if is_cancelled(&err) => return Err(err),
                    Err(err) => {
                        warn!(attempt, phase = "learning", err = %format!("{err:#}"), "learning failed");
                    }
                }
            }

            feedback.extend(outcome.feedback.iter().map(|item| item.issue.clone()));
            let success = outcome.success;
            last_outcome = Some(outcome);
            if success {
                break;
            }
        }

        if !last_outcome.as_ref().is_some_and(|o| o.success) {
            warn!(attempts, "attempt budget exhausted without a validated success");
        }
        Ok(StepRunResult {
            last_outcome,
            attempts,
            trace,
        })
    }
}

/// Apply a learning record to the in-memory step.
fn fold_learning(step: &mut PlanStep, notes: &mut Vec<String>, record: &LearningRecord) {
    if !record.appended_context.is_empty() {
        notes.push(record.appended_context.clone());
    }
    if record.succeeded {
        if let Some(pattern) = &record.pattern
            && !step.success_patterns.contains(pattern)
        {
            step.success_patterns.push(pattern.clone());
        }
        return;
    }
    if let Some(refined) = &record.refined_description {
        step.description = refined.clone();
    }
    let failure_note = match (record.category, &record.pattern) {
        (Some(category), Some(pattern)) => Some(format!("{}: {pattern}", category.as_str())),
        (Some(category), None) => Some(category.as_str().to_string()),
        (None, Some(pattern)) => Some(pattern.clone()),
        (None, None) => None,
    };
    if let Some(note) = failure_note
        && !step.failure_patterns.contains(&note)
    {
        step.failure_patterns.push(note);
    }
}

/// Plan patterns plus accumulated notes, rendered for the execution prompt.
pub fn learning_context(step: &PlanStep, notes: &[String]) -> String {
    let mut lines = Vec::new();
    if !step.success_patterns.is_empty() {
        lines.push("Approaches that worked before:".to_string());
        lines.extend(step.success_patterns.iter().map(|p| format!("- {p}")));
    }
    if !step.failure_patterns.is_empty() {
        lines.push("Approaches to avoid:".to_string());
        lines.extend(step.failure_patterns.iter().map(|p| format!("- {p}")));
    }
    if !notes.is_empty() {
        lines.push("Notes from earlier attempts:".to_string());
        lines.extend(notes.iter().map(|n| format!("- {n}")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureCategory, LearningDetail, ValidationStatus};
    use crate::io::paths::WorkspacePaths;
    use crate::test_support::{
        ScriptedAnalyst, ScriptedExecutor, ScriptedValidator, failed, passed, plan_step,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        artifacts: ArtifactLog,
        executor: ScriptedExecutor,
        validator: ScriptedValidator,
        analyst: ScriptedAnalyst,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let artifacts = ArtifactLog::new(&WorkspacePaths::new(temp.path()));
            Self {
                _temp: temp,
                artifacts,
                executor: ScriptedExecutor::new(),
                validator: ScriptedValidator::new(),
                analyst: ScriptedAnalyst::new(),
            }
        }

        fn run(&self, input: &StepInput<'_>, step: &mut PlanStep) -> StepRunResult {
            let recorder =
                LearningRecorder::new(&self.analyst, &self.artifacts, LearningDetail::General);
            let runner = StepRunner::new(
                &self.executor,
                &self.validator,
                recorder,
                &self.artifacts,
                3,
            );
            runner
                .run(input, step, &mut Vec::new(), &CancelToken::new())
                .expect("run step")
        }
    }

    fn input<'a>(vars: &'a VariableMap, fast: bool) -> StepInput<'a> {
        StepInput {
            objective: "Deploy to {{REGION}}",
            index: 0,
            total_steps: 1,
            variables: vars,
            human_feedback: None,
            prior_step_feedback: &[],
            fast,
        }
    }

    #[test]
    fn retries_until_success_and_learns_once_per_attempt() {
        let fx = Fixture::new();
        fx.validator.push_outcome(failed(&["first issue"]));
        fx.validator.push_outcome(failed(&["second issue"]));
        fx.validator.push_outcome(passed());
        fx.analyst.push_failure_refinement("refined once", FailureCategory::Approach);
        fx.analyst.push_failure_refinement("refined twice", FailureCategory::Environment);
        fx.analyst.push_success_pattern("tag at build time");
        let vars = VariableMap::new();
        let mut step = plan_step("Build");

        let result = fx.run(&input(&vars, false), &mut step);

        assert!(result.succeeded());
        assert_eq!(result.attempts, 3);
        assert_eq!(fx.analyst.success_calls(), 1);
        assert_eq!(fx.analyst.failure_calls(), 2);
        assert_eq!(step.description, "refined twice");
        assert_eq!(step.success_patterns, vec!["tag at build time".to_string()]);
        assert_eq!(step.failure_patterns, vec!["approach", "environment"]);

        let requests = fx.executor.requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[1].step.description, "refined once");
        assert_eq!(
            requests[2].validation_feedback,
            vec!["first issue".to_string(), "second issue".to_string()]
        );
        fx.analyst.assert_drained().expect("analyst drained");
        fx.validator.assert_drained().expect("validator drained");
    }

    #[test]
    fn execution_errors_consume_attempts() {
        let fx = Fixture::new();
        fx.executor.push_error("actor crashed");
        fx.executor.push_error("actor crashed");
        fx.executor.push_error("actor crashed");
        let vars = VariableMap::new();
        let mut step = plan_step("Build");

        let result = fx.run(&input(&vars, false), &mut step);

        assert_eq!(result.attempts, 3);
        assert_eq!(result.last_outcome, None);
        assert_eq!(
            result.gate_summary(1),
            "Step 1 execution failed - no validation response available"
        );
        assert!(fx.validator.requests().is_empty());
        assert_eq!(fx.analyst.success_calls() + fx.analyst.failure_calls(), 0);
    }

    #[test]
    fn fast_mode_skips_learning() {
        let fx = Fixture::new();
        fx.validator.push_outcome(failed(&["flaky"]));
        fx.validator.push_outcome(passed());
        let vars = VariableMap::new();
        let mut step = plan_step("Build");

        let result = fx.run(&input(&vars, true), &mut step);

        assert!(result.succeeded());
        assert_eq!(fx.analyst.success_calls() + fx.analyst.failure_calls(), 0);
        assert!(fx.executor.requests().iter().all(|r| r.replay));
    }

    #[test]
    fn executor_sees_resolved_fields_and_validator_sees_templates() {
        let fx = Fixture::new();
        fx.validator.push_outcome(passed());
        fx.analyst.push_success_pattern("ok");
        let vars = VariableMap::from([("REGION".to_string(), "eu-west-1".to_string())]);
        let mut step = plan_step("Build");
        step.description = "Deploy in {{REGION}}".to_string();

        fx.run(&input(&vars, false), &mut step);

        let exec = &fx.executor.requests()[0];
        assert_eq!(exec.objective, "Deploy to eu-west-1");
        assert_eq!(exec.step.description, "Deploy in eu-west-1");
        let validation = &fx.validator.requests()[0];
        assert_eq!(validation.objective, "Deploy to {{REGION}}");
        assert_eq!(validation.step.description, "Deploy in {{REGION}}");
    }

    #[test]
    fn validation_status_reaches_gate_summary() {
        let fx = Fixture::new();
        let mut outcome = failed(&["half done"]);
        outcome.status = ValidationStatus::Partial;
        fx.validator.push_outcome(outcome.clone());
        fx.validator.push_outcome(outcome.clone());
        fx.validator.push_outcome(outcome);
        let vars = VariableMap::new();
        let mut step = plan_step("Build");

        let result = fx.run(&input(&vars, true), &mut step);

        assert_eq!(
            result.gate_summary(1),
            "Step 1 validation completed. Success criteria met: false, status: partial"
        );
    }

    #[test]
    fn learning_context_lists_patterns_then_notes() {
        let mut step = plan_step("Build");
        step.success_patterns = vec!["use buildx".to_string()];
        step.failure_patterns = vec!["environment".to_string()];
        let rendered = learning_context(&step, &["Failed: no tag".to_string()]);
        let worked = rendered.find("use buildx").expect("worked");
        let avoid = rendered.find("environment").expect("avoid");
        let note = rendered.find("no tag").expect("note");
        assert!(worked < avoid && avoid < note);
        assert_eq!(learning_context(&plan_step("x"), &[]), "");
    }
}
