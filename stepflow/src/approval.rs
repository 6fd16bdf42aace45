//! Bounded approval loops that gate entry into execution.
//!
//! Variables and plans share one loop shape: generate, show, and feed rejection
//! feedback into the next generation. Running out of revisions is fatal, since
//! execution must never start from an unapproved artifact.

use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::agents::{PlanAuthor, PlanDraftRequest, VariableExtractor, VariableRequest};
use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::types::VariablesManifest;
use crate::io::gateway::{
    ApprovalGateway, ApprovalRequest, ChoiceSet, DecisionOutcome, decide, request_id,
};
use crate::io::paths::WorkspacePaths;
use crate::io::plan_store::{
    load_variables, read_plan_markdown, write_plan_markdown, write_variables,
};

/// An approval loop used every revision without an approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionBudgetExhausted {
    pub phase: &'static str,
    pub max: u32,
}

impl fmt::Display for RevisionBudgetExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} not approved after {} revisions", self.phase, self.max)
    }
}

impl std::error::Error for RevisionBudgetExhausted {}

/// How the plan for this run was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Existing,
    Created,
    Updated,
}

impl PlanSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanSource::Existing => "existing",
            PlanSource::Created => "created",
            PlanSource::Updated => "updated",
        }
    }
}

/// What to do with a plan found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExistingPlanChoice {
    Use,
    CreateNew,
    /// Revise the existing plan with this change description.
    Update(String),
}

/// Generate-review loop over `max` revisions.
///
/// `generate` receives the 1-based revision and the feedback gathered so far.
/// `render` turns an artifact into the gate context.
fn revision_loop<T>(
    phase: &'static str,
    max: u32,
    gateway: &dyn ApprovalGateway,
    cancel: &CancelToken,
    seed_feedback: Vec<String>,
    mut generate: impl FnMut(u32, &[String]) -> Result<T>,
    render: impl Fn(&T) -> String,
) -> Result<T> {
    let mut feedback = seed_feedback;
    for revision in 1..=max {
        cancel.check()?;
        let artifact = generate(revision, &feedback)?;
        let request = ApprovalRequest::new(
            request_id(phase, revision),
            format!("Approve the {phase} (revision {revision}/{max})?"),
            render(&artifact),
            ChoiceSet::binary("Approve", "Reject with feedback"),
        );
        let decision = decide(gateway, &request, cancel)?;
        if decision.outcome != DecisionOutcome::Reject {
            info!(phase, revision, "approved");
            return Ok(artifact);
        }
        let text = decision.feedback();
        info!(phase, revision, feedback = text, "rejected");
        if !text.is_empty() {
            feedback.push(text.to_string());
        }
    }
    warn!(phase, max, "revision budget exhausted");
    Err(RevisionBudgetExhausted { phase, max }.into())
}

/// Variables for this run: reuse the saved manifest, or extract and approve a new one.
///
/// Returns `None` when the extractor fails; the run then uses the objective verbatim.
#[instrument(skip_all)]
pub fn approve_variables(
    extractor: &dyn VariableExtractor,
    gateway: &dyn ApprovalGateway,
    paths: &WorkspacePaths,
    objective: &str,
    max_revisions: u32,
    cancel: &CancelToken,
) -> Result<Option<VariablesManifest>> {
    let existing = load_variables(&paths.variables_path)?;
    if let Some(manifest) = existing.as_ref() {
        let request = ApprovalRequest::new(
            request_id("variables_existing", manifest.variables.len()),
            "Saved variables were found. Use them?",
            render_manifest(manifest),
            ChoiceSet::labelled(&["Use existing variables", "Extract new variables"]),
        );
        let decision = decide(gateway, &request, cancel)?;
        if decision.outcome != DecisionOutcome::ChoiceB {
            info!(count = manifest.variables.len(), "using existing variables");
            return Ok(existing);
        }
    }

    let mut previous: Option<VariablesManifest> = None;
    let result = revision_loop(
        "variables",
        max_revisions,
        gateway,
        cancel,
        Vec::new(),
        |revision, feedback| {
            let manifest = extractor.extract(
                &VariableRequest {
                    objective: objective.to_string(),
                    revision,
                    previous: previous.clone(),
                    feedback: feedback.to_vec(),
                },
                cancel,
            )?;
            previous = Some(manifest.clone());
            Ok(manifest)
        },
        render_manifest,
    );

    match result {
        Ok(manifest) => {
            write_variables(&paths.variables_path, &manifest)?;
            Ok(Some(manifest))
        }
        Err(err) if is_cancelled(&err) || err.is::<RevisionBudgetExhausted>() => Err(err),
        Err(err) => {
            warn!(
                phase = "variables",
                err = %format!("{err:#}"),
                "variable extraction failed, continuing without variables"
            );
            Ok(None)
        }
    }
}

/// Ask what to do with a plan already on disk. `None` when there is no plan.
pub fn choose_existing_plan(
    gateway: &dyn ApprovalGateway,
    paths: &WorkspacePaths,
    cancel: &CancelToken,
) -> Result<Option<ExistingPlanChoice>> {
    let Some(markdown) = read_plan_markdown(&paths.plan_markdown_path)? else {
        return Ok(None);
    };
    let request = ApprovalRequest::new(
        request_id("plan_existing", markdown.len()),
        "A plan already exists. Use it, create a new one, or update it?",
        markdown,
        ChoiceSet::labelled(&["Use existing plan", "Create new plan", "Update plan"]),
    );
    let decision = decide(gateway, &request, cancel)?;
    let choice = match decision.outcome {
        DecisionOutcome::ChoiceB => ExistingPlanChoice::CreateNew,
        DecisionOutcome::ChoiceC => {
            let request = ApprovalRequest::new(
                request_id("plan_update", "changes"),
                "What do you want to change in the plan?",
                "",
                ChoiceSet::FreeText,
            );
            let answer = decide(gateway, &request, cancel)?;
            ExistingPlanChoice::Update(answer.feedback().to_string())
        }
        _ => ExistingPlanChoice::Use,
    };
    info!(choice = ?choice, "existing plan decision");
    Ok(Some(choice))
}

/// Starting point for a plan approval loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanSeed {
    /// Existing plan being revised.
    pub previous_draft: Option<String>,
    /// Change requests to apply from the first draft on.
    pub feedback: Vec<String>,
}

impl PlanSeed {
    pub fn update(previous_draft: String, change: String) -> Self {
        let feedback = if change.trim().is_empty() {
            Vec::new()
        } else {
            vec![change]
        };
        Self {
            previous_draft: Some(previous_draft),
            feedback,
        }
    }
}

/// Draft and approve a plan, then persist the approved markdown.
#[instrument(skip_all)]
pub fn approve_plan(
    author: &dyn PlanAuthor,
    gateway: &dyn ApprovalGateway,
    paths: &WorkspacePaths,
    objective: &str,
    seed: PlanSeed,
    max_revisions: u32,
    cancel: &CancelToken,
) -> Result<String> {
    let mut previous = seed.previous_draft;
    let markdown = revision_loop(
        "plan",
        max_revisions,
        gateway,
        cancel,
        seed.feedback,
        |revision, feedback| {
            let draft = author
                .draft_plan(
                    &PlanDraftRequest {
                        objective: objective.to_string(),
                        revision,
                        previous_draft: previous.clone(),
                        feedback: feedback.to_vec(),
                    },
                    cancel,
                )
                .with_context(|| format!("draft plan revision {revision}"))?;
            previous = Some(draft.clone());
            Ok(draft)
        },
        String::clone,
    )?;
    write_plan_markdown(&paths.plan_markdown_path, &markdown)?;
    Ok(markdown)
}

fn render_manifest(manifest: &VariablesManifest) -> String {
    let mut out = format!("Objective: {}\n", manifest.objective);
    if manifest.variables.is_empty() {
        out.push_str("No variables.");
    }
    for var in &manifest.variables {
        out.push_str(&format!("\n{{{{{}}}}} = {} ({})", var.name, var.value, var.description));
    }
    out
}
