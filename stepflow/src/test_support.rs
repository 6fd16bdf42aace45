//! Test-only doubles for every collaborator seam and the approval gateway.
//!
//! Each double is a FIFO queue of scripted responses plus a log of the requests
//! it received. Queues that run dry fall back to a benign default (a passing
//! validation, an empty learning report) except where noted, so lifecycle tests
//! only script the interesting calls. `assert_drained` checks that every scripted
//! response was consumed.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;

use anyhow::{Result, anyhow, bail};
use tempfile::TempDir;

use crate::agents::{
    Collaborators, ExecutionReport, LearningAnalyst, LearningReport, LearningRequest, PlanAuthor,
    PlanDraftRequest, PlanReader, StepExecutionRequest, StepExecutor, StepValidator, TodoWriter,
    ValidationRequest, VariableExtractor, VariableRequest, WriterRequest,
};
use crate::core::cancel::{CancelToken, Cancelled};
use crate::core::progress::StepProgress;
use crate::core::types::{
    FailureCategory, FeedbackItem, PlanStep, ValidationOutcome, ValidationStatus, Variable,
    VariablesManifest,
};
use crate::io::checkpoint::CheckpointStore;
use crate::io::gateway::{
    ApprovalDecision, ApprovalGateway, ApprovalRequest, ChoiceSet, DecisionOutcome,
};
use crate::io::paths::WorkspacePaths;
use crate::io::plan_store::{write_plan_markdown, write_plan_steps, write_variables};

/// Create a deterministic plan step.
pub fn plan_step(title: &str) -> PlanStep {
    PlanStep {
        title: title.to_string(),
        description: format!("{title} description"),
        success_criteria: format!("{title} done"),
        rationale: String::new(),
        context_dependencies: Vec::new(),
        context_output: format!("out/{}.md", title.to_lowercase().replace(' ', "_")),
        success_patterns: Vec::new(),
        failure_patterns: Vec::new(),
    }
}

/// A plan of `n` steps titled `Step 1` .. `Step n`.
pub fn plan(n: usize) -> Vec<PlanStep> {
    (1..=n).map(|i| plan_step(&format!("Step {i}"))).collect()
}

pub fn passed() -> ValidationOutcome {
    ValidationOutcome {
        success: true,
        status: ValidationStatus::Completed,
        feedback: Vec::new(),
    }
}

pub fn failed(issues: &[&str]) -> ValidationOutcome {
    ValidationOutcome {
        success: false,
        status: ValidationStatus::Failed,
        feedback: issues
            .iter()
            .map(|issue| FeedbackItem {
                issue: (*issue).to_string(),
            })
            .collect(),
    }
}

/// A temporary workspace with `.stepflow/` paths.
pub struct TestWorkspace {
    _temp: TempDir,
    paths: WorkspacePaths,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = WorkspacePaths::new(temp.path());
        Ok(Self { _temp: temp, paths })
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn paths(&self) -> &WorkspacePaths {
        &self.paths
    }

    /// Write an approved plan as both markdown and structured steps.
    pub fn write_plan(&self, steps: &[PlanStep]) -> Result<()> {
        let markdown = steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("## Step {}: {}\n{}\n", i + 1, step.title, step.description))
            .collect::<Vec<_>>()
            .join("\n");
        write_plan_markdown(&self.paths.plan_markdown_path, &markdown)?;
        write_plan_steps(&self.paths.plan_json_path, steps)
    }

    pub fn write_checkpoint(&self, total_steps: usize, completed: &[usize]) -> Result<()> {
        let mut progress = StepProgress::new(total_steps);
        for idx in completed {
            progress.mark_completed(*idx);
        }
        CheckpointStore::new(&self.paths.checkpoint_path).save(&mut progress)
    }

    pub fn load_checkpoint(&self) -> Result<Option<StepProgress>> {
        CheckpointStore::new(&self.paths.checkpoint_path).load()
    }

    pub fn write_variables(&self, manifest: &VariablesManifest) -> Result<()> {
        write_variables(&self.paths.variables_path, manifest)
    }
}

fn drained<T>(name: &str, queue: &RefCell<VecDeque<T>>) -> Result<()> {
    let left = queue.borrow().len();
    if left > 0 {
        bail!("{name} has {left} unconsumed scripted responses");
    }
    Ok(())
}

/// Executor that replays scripted results; an empty queue reports a generic summary.
#[derive(Default)]
pub struct ScriptedExecutor {
    queue: RefCell<VecDeque<ScriptedRun>>,
    requests: RefCell<Vec<StepExecutionRequest>>,
}

enum ScriptedRun {
    Report(ExecutionReport),
    Fail(String),
    Cancel,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_summary(&self, summary: &str) {
        self.queue.borrow_mut().push_back(ScriptedRun::Report(ExecutionReport {
            summary: summary.to_string(),
        }));
    }

    pub fn push_error(&self, message: &str) {
        self.queue
            .borrow_mut()
            .push_back(ScriptedRun::Fail(message.to_string()));
    }

    /// Raise the caller's cancel token when this call is reached.
    pub fn push_cancel(&self) {
        self.queue.borrow_mut().push_back(ScriptedRun::Cancel);
    }

    pub fn requests(&self) -> Vec<StepExecutionRequest> {
        self.requests.borrow().clone()
    }

    /// 0-based plan indices executed, in call order.
    pub fn executed_indices(&self) -> Vec<usize> {
        self.requests
            .borrow()
            .iter()
            .map(|r| r.step_number - 1)
            .collect()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("executor", &self.queue)
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(
        &self,
        request: &StepExecutionRequest,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());
        let scripted = self.queue.borrow_mut().pop_front();
        match scripted {
            Some(ScriptedRun::Report(report)) => Ok(report),
            Some(ScriptedRun::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptedRun::Cancel) => {
                cancel.cancel();
                Err(Cancelled.into())
            }
            None => Ok(ExecutionReport {
                summary: format!("executed {}", request.step.title),
            }),
        }
    }
}

/// Validator that replays scripted outcomes; an empty queue passes.
#[derive(Default)]
pub struct ScriptedValidator {
    queue: RefCell<VecDeque<Result<ValidationOutcome, String>>>,
    requests: RefCell<Vec<ValidationRequest>>,
}

impl ScriptedValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: ValidationOutcome) {
        self.queue.borrow_mut().push_back(Ok(outcome));
    }

    pub fn push_error(&self, message: &str) {
        self.queue.borrow_mut().push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<ValidationRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("validator", &self.queue)
    }
}

impl StepValidator for ScriptedValidator {
    fn validate(
        &self,
        request: &ValidationRequest,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(passed()),
        }
    }
}

/// Analyst with separate success and failure queues; empty queues return a bare report.
#[derive(Default)]
pub struct ScriptedAnalyst {
    success: RefCell<VecDeque<LearningReport>>,
    failure: RefCell<VecDeque<LearningReport>>,
    success_requests: RefCell<Vec<LearningRequest>>,
    failure_requests: RefCell<Vec<LearningRequest>>,
}

impl ScriptedAnalyst {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_success_pattern(&self, pattern: &str) {
        self.success.borrow_mut().push_back(LearningReport {
            analysis: format!("Worked: {pattern}"),
            pattern: Some(pattern.to_string()),
            ..LearningReport::default()
        });
    }

    pub fn push_failure_refinement(&self, refined_task: &str, category: FailureCategory) {
        self.failure.borrow_mut().push_back(LearningReport {
            analysis: format!("Failure Type: {}", category.as_str()),
            refined_task: Some(refined_task.to_string()),
            category: Some(category),
            pattern: None,
        });
    }

    pub fn push_failure_report(&self, report: LearningReport) {
        self.failure.borrow_mut().push_back(report);
    }

    pub fn success_calls(&self) -> usize {
        self.success_requests.borrow().len()
    }

    pub fn failure_calls(&self) -> usize {
        self.failure_requests.borrow().len()
    }

    /// 1-based step numbers that reached any learning branch.
    pub fn learned_steps(&self) -> Vec<usize> {
        let mut steps: Vec<usize> = self
            .success_requests
            .borrow()
            .iter()
            .chain(self.failure_requests.borrow().iter())
            .map(|r| r.step_number)
            .collect();
        steps.sort_unstable();
        steps.dedup();
        steps
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("success analyst", &self.success)?;
        drained("failure analyst", &self.failure)
    }
}

impl LearningAnalyst for ScriptedAnalyst {
    fn analyze_success(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport> {
        cancel.check()?;
        self.success_requests.borrow_mut().push(request.clone());
        Ok(self.success.borrow_mut().pop_front().unwrap_or_default())
    }

    fn analyze_failure(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport> {
        cancel.check()?;
        self.failure_requests.borrow_mut().push(request.clone());
        Ok(self.failure.borrow_mut().pop_front().unwrap_or_default())
    }
}

/// Plan author returning scripted drafts; an empty queue is an error.
#[derive(Default)]
pub struct ScriptedPlanAuthor {
    queue: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<PlanDraftRequest>>,
}

impl ScriptedPlanAuthor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_draft(&self, markdown: &str) {
        self.queue.borrow_mut().push_back(markdown.to_string());
    }

    pub fn requests(&self) -> Vec<PlanDraftRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("plan author", &self.queue)
    }
}

impl PlanAuthor for ScriptedPlanAuthor {
    fn draft_plan(&self, request: &PlanDraftRequest, cancel: &CancelToken) -> Result<String> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());
        self.queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted plan draft for revision {}", request.revision))
    }
}

/// Plan reader returning scripted step lists; an empty queue is an error.
#[derive(Default)]
pub struct ScriptedPlanReader {
    queue: RefCell<VecDeque<Vec<PlanStep>>>,
    inputs: RefCell<Vec<String>>,
}

impl ScriptedPlanReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_steps(&self, steps: Vec<PlanStep>) {
        self.queue.borrow_mut().push_back(steps);
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("plan reader", &self.queue)
    }
}

impl PlanReader for ScriptedPlanReader {
    fn read_plan(&self, plan_markdown: &str, cancel: &CancelToken) -> Result<Vec<PlanStep>> {
        cancel.check()?;
        self.inputs.borrow_mut().push(plan_markdown.to_string());
        self.queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted plan steps"))
    }
}

/// Variable extractor returning scripted manifests; an empty queue is an error.
#[derive(Default)]
pub struct ScriptedVariableExtractor {
    queue: RefCell<VecDeque<Result<VariablesManifest, String>>>,
    requests: RefCell<Vec<VariableRequest>>,
}

impl ScriptedVariableExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_manifest(&self, manifest: VariablesManifest) {
        self.queue.borrow_mut().push_back(Ok(manifest));
    }

    pub fn push_error(&self, message: &str) {
        self.queue.borrow_mut().push_back(Err(message.to_string()));
    }

    pub fn requests(&self) -> Vec<VariableRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("variable extractor", &self.queue)
    }
}

impl VariableExtractor for ScriptedVariableExtractor {
    fn extract(
        &self,
        request: &VariableRequest,
        cancel: &CancelToken,
    ) -> Result<VariablesManifest> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());
        match self.queue.borrow_mut().pop_front() {
            Some(Ok(manifest)) => Ok(manifest),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted variables manifest")),
        }
    }
}

/// Manifest with one variable per `(name, value)` pair.
pub fn manifest(objective: &str, vars: &[(&str, &str)]) -> VariablesManifest {
    VariablesManifest {
        objective: objective.to_string(),
        variables: vars
            .iter()
            .map(|(name, value)| Variable {
                name: (*name).to_string(),
                description: format!("{name} value"),
                value: (*value).to_string(),
            })
            .collect(),
    }
}

/// Writer returning scripted documents. An empty queue renders a todo list that
/// covers every requested step, which passes critique.
#[derive(Default)]
pub struct ScriptedWriter {
    queue: RefCell<VecDeque<String>>,
    requests: RefCell<Vec<WriterRequest>>,
}

impl ScriptedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_document(&self, raw: &str) {
        self.queue.borrow_mut().push_back(raw.to_string());
    }

    pub fn requests(&self) -> Vec<WriterRequest> {
        self.requests.borrow().clone()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("writer", &self.queue)
    }
}

impl TodoWriter for ScriptedWriter {
    fn write_todo(&self, request: &WriterRequest, cancel: &CancelToken) -> Result<String> {
        cancel.check()?;
        self.requests.borrow_mut().push(request.clone());
        if let Some(raw) = self.queue.borrow_mut().pop_front() {
            return Ok(raw);
        }
        let doc = serde_json::json!({
            "objective": request.objective,
            "steps": request.steps,
        });
        Ok(serde_json::to_string_pretty(&doc)?)
    }
}

/// One scripted double per collaborator seam.
#[derive(Default)]
pub struct ScriptedAgents {
    pub executor: ScriptedExecutor,
    pub validator: ScriptedValidator,
    pub analyst: ScriptedAnalyst,
    pub author: ScriptedPlanAuthor,
    pub reader: ScriptedPlanReader,
    pub variables: ScriptedVariableExtractor,
    pub writer: ScriptedWriter,
}

impl ScriptedAgents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            executor: &self.executor,
            validator: &self.validator,
            analyst: &self.analyst,
            plan_author: &self.author,
            plan_reader: &self.reader,
            variables: &self.variables,
            writer: &self.writer,
        }
    }

    pub fn assert_drained(&self) -> Result<()> {
        self.executor.assert_drained()?;
        self.validator.assert_drained()?;
        self.analyst.assert_drained()?;
        self.author.assert_drained()?;
        self.reader.assert_drained()?;
        self.variables.assert_drained()?;
        self.writer.assert_drained()
    }
}

/// Gateway answering from a FIFO queue. An empty queue is a gateway failure, so
/// callers see the fallback decision.
#[derive(Default)]
pub struct ScriptedGateway {
    queue: RefCell<VecDeque<ScriptedAnswer>>,
    requests: RefCell<Vec<ApprovalRequest>>,
}

#[derive(Debug, Clone)]
enum ScriptedAnswer {
    Decide(DecisionOutcome, Option<String>),
    Fail(String),
    Cancel,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approve(&self) -> &Self {
        self.push(ScriptedAnswer::Decide(DecisionOutcome::Approve, None))
    }

    pub fn reject(&self, feedback: &str) -> &Self {
        self.push(ScriptedAnswer::Decide(
            DecisionOutcome::Reject,
            Some(feedback.to_string()),
        ))
    }

    pub fn choose(&self, outcome: DecisionOutcome) -> &Self {
        self.push(ScriptedAnswer::Decide(outcome, None))
    }

    pub fn answer(&self, text: &str) -> &Self {
        self.push(ScriptedAnswer::Decide(
            DecisionOutcome::Approve,
            Some(text.to_string()),
        ))
    }

    pub fn fail(&self, message: &str) -> &Self {
        self.push(ScriptedAnswer::Fail(message.to_string()))
    }

    /// Raise the caller's cancel token when this answer is reached.
    pub fn cancel(&self) -> &Self {
        self.push(ScriptedAnswer::Cancel)
    }

    fn push(&self, answer: ScriptedAnswer) -> &Self {
        self.queue.borrow_mut().push_back(answer);
        self
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests.borrow().clone()
    }

    /// Requests whose id starts with `phase`.
    pub fn requests_for(&self, phase: &str) -> Vec<ApprovalRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.request_id.starts_with(phase))
            .cloned()
            .collect()
    }

    pub fn assert_drained(&self) -> Result<()> {
        drained("gateway", &self.queue)
    }
}

impl ApprovalGateway for ScriptedGateway {
    fn request_decision(
        &self,
        request: &ApprovalRequest,
        cancel: &CancelToken,
    ) -> Result<ApprovalDecision> {
        self.requests.borrow_mut().push(request.clone());
        let answer = self.queue.borrow_mut().pop_front();
        match answer {
            Some(ScriptedAnswer::Decide(outcome, free_text)) => {
                if let ChoiceSet::Labelled(labels) = &request.choices {
                    let index = match outcome {
                        DecisionOutcome::ChoiceA => 0,
                        DecisionOutcome::ChoiceB => 1,
                        DecisionOutcome::ChoiceC => 2,
                        other => bail!("{other:?} answered a labelled gate"),
                    };
                    if index >= labels.len() {
                        bail!("{outcome:?} is out of range for {labels:?}");
                    }
                }
                Ok(ApprovalDecision::new(
                    &request.request_id,
                    outcome,
                    free_text,
                ))
            }
            Some(ScriptedAnswer::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptedAnswer::Cancel) => {
                cancel.cancel();
                Err(Cancelled.into())
            }
            None => Err(anyhow!("no scripted answer for {}", request.request_id)),
        }
    }
}
