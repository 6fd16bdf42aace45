//! Collaborators backed by an agent CLI.
//!
//! Every phase follows the same recipe: render the typed request through its
//! prompt template, write the phase output schema, invoke the [`Actor`], and read
//! back the JSON the actor wrote.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use super::{
    ExecutionReport, LearningAnalyst, LearningReport, LearningRequest, PlanAuthor,
    PlanDraftRequest, PlanReader, StepExecutionRequest, StepExecutor, StepValidator, TodoWriter,
    ValidationRequest, VariableExtractor, VariableRequest, WriterRequest, write_output_schema,
};
use crate::core::cancel::CancelToken;
use crate::core::types::{PlanStep, ValidationOutcome, VariablesManifest};
use crate::io::actor::{
    Actor, ActorRequest, invoke_and_load_json, invoke_and_load_value, validate_against_schema,
};
use crate::io::config::StepflowConfig;
use crate::io::paths::WorkspacePaths;
use crate::io::plan_store::PlanDocument;
use crate::io::prompt::{PromptBuilder, PromptKind};

const EXECUTION_REPORT_SCHEMA: &str = include_str!("../../schemas/execution_report.schema.json");
const VALIDATION_OUTCOME_SCHEMA: &str =
    include_str!("../../schemas/validation_outcome.schema.json");
const LEARNING_REPORT_SCHEMA: &str = include_str!("../../schemas/learning_report.schema.json");
const PLAN_DRAFT_SCHEMA: &str = include_str!("../../schemas/plan_draft.schema.json");
const PLAN_STEPS_SCHEMA: &str = include_str!("../../schemas/plan_steps.schema.json");
const VARIABLES_MANIFEST_SCHEMA: &str =
    include_str!("../../schemas/variables_manifest.schema.json");
const TODO_LIST_SCHEMA: &str = include_str!("../../schemas/todo_list.schema.json");

/// Phase identity: where scratch files go and which schema constrains the output.
struct Phase {
    name: &'static str,
    prompt: PromptKind,
    schema_file: &'static str,
    schema: &'static str,
}

const EXECUTION: Phase = Phase {
    name: "execution",
    prompt: PromptKind::Execution,
    schema_file: "execution_report.schema.json",
    schema: EXECUTION_REPORT_SCHEMA,
};
const VALIDATION: Phase = Phase {
    name: "validation",
    prompt: PromptKind::Validation,
    schema_file: "validation_outcome.schema.json",
    schema: VALIDATION_OUTCOME_SCHEMA,
};
const SUCCESS_LEARNING: Phase = Phase {
    name: "learning",
    prompt: PromptKind::SuccessLearning,
    schema_file: "learning_report.schema.json",
    schema: LEARNING_REPORT_SCHEMA,
};
const FAILURE_LEARNING: Phase = Phase {
    name: "learning",
    prompt: PromptKind::FailureLearning,
    schema_file: "learning_report.schema.json",
    schema: LEARNING_REPORT_SCHEMA,
};
const PLAN_DRAFT: Phase = Phase {
    name: "planning",
    prompt: PromptKind::PlanDraft,
    schema_file: "plan_draft.schema.json",
    schema: PLAN_DRAFT_SCHEMA,
};
const PLAN_READER: Phase = Phase {
    name: "plan_reader",
    prompt: PromptKind::PlanReader,
    schema_file: "plan_steps.schema.json",
    schema: PLAN_STEPS_SCHEMA,
};
const VARIABLES: Phase = Phase {
    name: "variables",
    prompt: PromptKind::Variables,
    schema_file: "variables_manifest.schema.json",
    schema: VARIABLES_MANIFEST_SCHEMA,
};
const WRITER: Phase = Phase {
    name: "writer",
    prompt: PromptKind::Writer,
    schema_file: "todo_list.schema.json",
    schema: TODO_LIST_SCHEMA,
};

#[derive(Deserialize)]
struct PlanDraftOutput {
    plan_markdown: String,
}

/// Implements every collaborator seam on top of one [`Actor`].
#[derive(Debug, Clone)]
pub struct CommandAgent<A: Actor> {
    actor: A,
    paths: WorkspacePaths,
    prompts: PromptBuilder,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<A: Actor> CommandAgent<A> {
    pub fn new(actor: A, paths: WorkspacePaths, config: &StepflowConfig) -> Self {
        Self {
            actor,
            paths,
            prompts: PromptBuilder::new(config.prompt_budget_bytes),
            timeout: config.actor.timeout(),
            output_limit_bytes: config.actor.output_limit_bytes,
        }
    }

    fn prepare<S: Serialize>(
        &self,
        phase: &Phase,
        detail: &str,
        ctx: &S,
    ) -> Result<ActorRequest> {
        let schema_path = self.paths.schemas_dir.join(phase.schema_file);
        write_output_schema(&schema_path, phase.schema)?;
        let prompt = self.prompts.build(phase.prompt, ctx)?;
        let scratch = self.paths.phase_dir(phase.name, detail);
        debug!(phase = phase.name, detail, prompt_bytes = prompt.len(), "prepared prompt");
        Ok(ActorRequest {
            workdir: self.paths.root.clone(),
            prompt,
            output_schema_path: schema_path,
            output_path: scratch.join("output.json"),
            log_path: scratch.join("actor.log"),
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        })
    }

    fn call<S: Serialize, T: DeserializeOwned>(
        &self,
        phase: &Phase,
        detail: &str,
        ctx: &S,
        cancel: &CancelToken,
    ) -> Result<T> {
        let request = self.prepare(phase, detail, ctx)?;
        invoke_and_load_json(&self.actor, &request, cancel)
            .with_context(|| format!("{} phase ({detail})", phase.name))
    }

    /// Like [`Self::call`], but checks the output against the phase schema first.
    fn call_checked<S: Serialize>(
        &self,
        phase: &Phase,
        detail: &str,
        ctx: &S,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let request = self.prepare(phase, detail, ctx)?;
        let value = invoke_and_load_value(&self.actor, &request, cancel)
            .with_context(|| format!("{} phase ({detail})", phase.name))?;
        validate_against_schema(phase.schema, &value)
            .with_context(|| format!("check {}", request.output_path.display()))?;
        Ok(value)
    }
}

impl<A: Actor> StepExecutor for CommandAgent<A> {
    #[instrument(skip_all, fields(step = request.step_number, attempt = request.attempt))]
    fn execute(
        &self,
        request: &StepExecutionRequest,
        cancel: &CancelToken,
    ) -> Result<ExecutionReport> {
        let detail = format!("step_{}_attempt_{}", request.step_number, request.attempt);
        self.call(&EXECUTION, &detail, request, cancel)
    }
}

impl<A: Actor> StepValidator for CommandAgent<A> {
    #[instrument(skip_all, fields(step = request.step_number, attempt = request.attempt))]
    fn validate(
        &self,
        request: &ValidationRequest,
        cancel: &CancelToken,
    ) -> Result<ValidationOutcome> {
        let detail = format!("step_{}_attempt_{}", request.step_number, request.attempt);
        self.call(&VALIDATION, &detail, request, cancel)
    }
}

impl<A: Actor> LearningAnalyst for CommandAgent<A> {
    fn analyze_success(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport> {
        let detail = format!(
            "step_{}_attempt_{}_success",
            request.step_number, request.attempt
        );
        self.call(&SUCCESS_LEARNING, &detail, request, cancel)
    }

    fn analyze_failure(
        &self,
        request: &LearningRequest,
        cancel: &CancelToken,
    ) -> Result<LearningReport> {
        let detail = format!(
            "step_{}_attempt_{}_failure",
            request.step_number, request.attempt
        );
        self.call(&FAILURE_LEARNING, &detail, request, cancel)
    }
}

impl<A: Actor> PlanAuthor for CommandAgent<A> {
    fn draft_plan(&self, request: &PlanDraftRequest, cancel: &CancelToken) -> Result<String> {
        let detail = format!("revision_{}", request.revision);
        let output: PlanDraftOutput = self.call(&PLAN_DRAFT, &detail, request, cancel)?;
        Ok(output.plan_markdown)
    }
}

impl<A: Actor> PlanReader for CommandAgent<A> {
    fn read_plan(&self, plan_markdown: &str, cancel: &CancelToken) -> Result<Vec<PlanStep>> {
        let ctx = json!({ "plan_markdown": plan_markdown });
        let value = self.call_checked(&PLAN_READER, "convert", &ctx, cancel)?;
        let document: PlanDocument =
            serde_json::from_value(value).context("deserialize plan steps")?;
        Ok(document.steps)
    }
}

impl<A: Actor> VariableExtractor for CommandAgent<A> {
    fn extract(
        &self,
        request: &VariableRequest,
        cancel: &CancelToken,
    ) -> Result<VariablesManifest> {
        let detail = format!("revision_{}", request.revision);
        self.call(&VARIABLES, &detail, request, cancel)
    }
}

impl<A: Actor> TodoWriter for CommandAgent<A> {
    fn write_todo(&self, request: &WriterRequest, cancel: &CancelToken) -> Result<String> {
        let detail = format!("revision_{}", request.revision);
        let value = self.call_checked(&WRITER, &detail, request, cancel)?;
        let mut buf = serde_json::to_string_pretty(&value)?;
        buf.push('\n');
        Ok(buf)
    }
}
