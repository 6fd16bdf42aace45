//! External collaborator seams.
//!
//! Each phase that needs an agent goes through one of these traits with a typed
//! request. [`command::CommandAgent`] implements all of them on top of an
//! [`crate::io::actor::Actor`]; tests substitute scripted doubles from
//! `test_support`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::cancel::CancelToken;
use crate::core::types::{
    FailureCategory, LearningDetail, PlanStep, ValidationOutcome, VariablesManifest,
};

pub mod command;

/// Input for one execution attempt of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepExecutionRequest {
    pub objective: String,
    /// 1-based.
    pub step_number: usize,
    pub total_steps: usize,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Step with `{{NAME}}` placeholders resolved and the latest refined description.
    pub step: PlanStep,
    /// Learned patterns and notes accumulated for this step.
    pub learning_context: String,
    /// Every validation issue from earlier attempts at this step, oldest first.
    pub validation_feedback: Vec<String>,
    /// Feedback from the human who rejected the previous result of this step.
    pub human_feedback: Option<String>,
    /// Feedback given on earlier steps of this run.
    pub prior_step_feedback: Vec<String>,
    /// The step already ran in an earlier session and is being replayed.
    pub replay: bool,
}

/// What the execution actor reports back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationRequest {
    pub objective: String,
    pub step_number: usize,
    pub total_steps: usize,
    pub attempt: u32,
    pub step: PlanStep,
    pub execution_trace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearningRequest {
    pub objective: String,
    pub step_number: usize,
    pub attempt: u32,
    pub step: PlanStep,
    pub execution_trace: String,
    pub validation: ValidationOutcome,
    pub detail: LearningDetail,
}

/// What success or failure analysis returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningReport {
    pub analysis: String,
    /// Replacement description for the next attempt (failure analysis only).
    #[serde(default)]
    pub refined_task: Option<String>,
    #[serde(default)]
    pub category: Option<FailureCategory>,
    /// One-line pattern to remember for this step.
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanDraftRequest {
    pub objective: String,
    /// 1-based draft number.
    pub revision: u32,
    pub previous_draft: Option<String>,
    /// Reviewer feedback so far, oldest first.
    pub feedback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableRequest {
    pub objective: String,
    pub revision: u32,
    pub previous: Option<VariablesManifest>,
    pub feedback: Vec<String>,
}

/// One executed step as the writer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepHistory {
    pub step_number: usize,
    pub title: String,
    pub status_summary: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterRequest {
    pub objective: String,
    pub revision: u32,
    /// Plan with learned patterns, placeholders unresolved.
    pub steps: Vec<PlanStep>,
    pub history: Vec<StepHistory>,
    pub variable_names: Vec<String>,
    /// Critique issues from the previous revision.
    pub critique_feedback: Vec<String>,
    pub human_feedback: Option<String>,
}

/// Performs a step's work.
///
/// Implementations must tolerate replay: a fast-executed step is invoked again
/// with `replay = true` after it already ran in an earlier session.
pub trait StepExecutor {
    fn execute(
        &self,
        request: &StepExecutionRequest,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport>;
}

/// Checks an attempt against the step's success criteria.
pub trait StepValidator {
    fn validate(
        &self,
        request: &ValidationRequest,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome>;
}

pub trait LearningAnalyst {
    fn analyze_success(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport>;

    fn analyze_failure(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport>;
}

/// Drafts a markdown plan.
pub trait PlanAuthor {
    fn draft_plan(&self, request: &PlanDraftRequest, cancel: &CancelToken) -> Result<String>;
}

/// Converts an approved markdown plan into typed steps.
pub trait PlanReader {
    fn read_plan(&self, plan_markdown: &str, cancel: &CancelToken) -> Result<Vec<PlanStep>>;
}

pub trait VariableExtractor {
    fn extract(&self, request: &VariableRequest, cancel: &CancelToken)
    -> Result<VariablesManifest>;
}

/// Produces the final todo list as a JSON document.
pub trait TodoWriter {
    fn write_todo(&self, request: &WriterRequest, cancel: &CancelToken) -> Result<String>;
}

/// Every collaborator a run needs.
pub struct Collaborators<'a> {
    pub executor: &'a dyn StepExecutor,
    pub validator: &'a dyn StepValidator,
    pub analyst: &'a dyn LearningAnalyst,
    pub plan_author: &'a dyn PlanAuthor,
    pub plan_reader: &'a dyn PlanReader,
    pub variables: &'a dyn VariableExtractor,
    pub writer: &'a dyn TodoWriter,
}

impl<'a> Collaborators<'a> {
    /// Use one value for every seam.
    pub fn uniform<T>(agent: &'a T) -> Self
    where
        T: StepExecutor
            + StepValidator
            + LearningAnalyst
            + PlanAuthor
            + PlanReader
            + VariableExtractor
            + TodoWriter,
    {
        Self {
            executor: agent,
            validator: agent,
            analyst: agent,
            plan_author: agent,
            plan_reader: agent,
            variables: agent,
            writer: agent,
        }
    }
}

pub(crate) fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}
