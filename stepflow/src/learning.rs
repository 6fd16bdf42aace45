//! Post-validation learning.
//!
//! Routes each validated attempt to success or failure analysis and returns what
//! the caller should fold into its in-memory step. Nothing here touches the plan
//! files; the execution loop decides when learned patterns are written back.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info, instrument};

use crate::agents::{LearningAnalyst, LearningReport, LearningRequest};
use crate::core::cancel::CancelToken;
use crate::core::types::{FailureCategory, LearningDetail, PlanStep, ValidationOutcome};
use crate::io::artifacts::ArtifactLog;

const REFINED_TASK_HEADER: &str = "### Refined Task:";

static FAILURE_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)failure\s+type\W*:?\W*(tool[\s_-]*selection|approach|assumption|environment)")
        .expect("failure type regex")
});

/// Where the attempt sits in the run.
#[derive(Debug, Clone, Copy)]
pub struct AttemptRef<'a> {
    pub objective: &'a str,
    /// 1-based.
    pub step_number: usize,
    pub attempt: u32,
}

/// What one learning pass produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LearningRecord {
    /// Note to append to the step's running learning context.
    pub appended_context: String,
    /// Replacement description for the next attempt. Failure branch only.
    pub refined_description: Option<String>,
    pub category: Option<FailureCategory>,
    /// Short pattern worth keeping on the plan step.
    pub pattern: Option<String>,
    pub succeeded: bool,
}

pub struct LearningRecorder<'a> {
    analyst: &'a dyn LearningAnalyst,
    artifacts: &'a ArtifactLog,
    detail: LearningDetail,
}

impl<'a> LearningRecorder<'a> {
    pub fn new(
        analyst: &'a dyn LearningAnalyst,
        artifacts: &'a ArtifactLog,
        detail: LearningDetail,
    ) -> Self {
        Self {
            analyst,
            artifacts,
            detail,
        }
    }

    /// Run exactly one analysis branch for a validated attempt.
    #[instrument(skip_all, fields(step = at.step_number, attempt = at.attempt, success = validation.success))]
    pub fn record_outcome(
        &self,
        at: AttemptRef<'_>,
        step: &PlanStep,
        execution_trace: &str,
        validation: &ValidationOutcome,
        cancel: &CancelToken,
    ) -> Result<LearningRecord> {
        cancel.check()?;
        let request = LearningRequest {
            objective: at.objective.to_string(),
            step_number: at.step_number,
            attempt: at.attempt,
            step: step.clone(),
            execution_trace: execution_trace.to_string(),
            validation: validation.clone(),
            detail: self.detail,
        };

        let record = if validation.success {
            let report = self.analyst.analyze_success(&request, cancel)?;
            success_record(&report)
        } else {
            let report = self.analyst.analyze_failure(&request, cancel)?;
            failure_record(&report)
        };

        let heading = match (record.succeeded, record.category) {
            (true, _) => "success".to_string(),
            (false, Some(category)) => format!("failure ({})", category.as_str()),
            (false, None) => "failure".to_string(),
        };
        let mut body = record.appended_context.clone();
        if let Some(refined) = &record.refined_description {
            body.push_str("\n\nRefined task:\n");
            body.push_str(refined);
        }
        let path = self
            .artifacts
            .append_learning(at.step_number, at.attempt, &heading, &body)?;
        debug!(path = %path.display(), "appended learning notes");
        info!(
            refined = record.refined_description.is_some(),
            category = ?record.category,
            "learning recorded"
        );
        Ok(record)
    }
}

fn success_record(report: &LearningReport) -> LearningRecord {
    let pattern = non_empty(report.pattern.as_deref());
    let note = pattern
        .clone()
        .or_else(|| first_line(&report.analysis))
        .unwrap_or_default();
    LearningRecord {
        appended_context: note,
        refined_description: None,
        category: None,
        pattern,
        succeeded: true,
    }
}

fn failure_record(report: &LearningReport) -> LearningRecord {
    let refined = non_empty(report.refined_task.as_deref())
        .or_else(|| extract_refined_task(&report.analysis));
    let category = report
        .category
        .or_else(|| extract_failure_category(&report.analysis));
    let pattern = non_empty(report.pattern.as_deref());
    let summary = pattern
        .clone()
        .or_else(|| first_line(&report.analysis))
        .unwrap_or_default();
    let appended_context = match category {
        Some(category) => format!("Failed ({}): {summary}", category.as_str()),
        None => format!("Failed: {summary}"),
    };
    LearningRecord {
        appended_context,
        refined_description: refined,
        category,
        pattern,
        succeeded: false,
    }
}

/// Body of the `### Refined Task:` section, up to the next `###` header.
pub fn extract_refined_task(analysis: &str) -> Option<String> {
    let mut lines = analysis.lines();
    let mut collected: Vec<&str> = Vec::new();

    for line in lines.by_ref() {
        if let Some(pos) = line.find(REFINED_TASK_HEADER) {
            let rest = line[pos + REFINED_TASK_HEADER.len()..].trim();
            if !rest.is_empty() {
                collected.push(rest);
            }
            break;
        }
    }
    for line in lines {
        if line.trim_start().starts_with("###") {
            break;
        }
        if collected.is_empty() && line.trim().is_empty() {
            continue;
        }
        collected.push(line);
    }

    non_empty(Some(collected.join("\n").trim()))
}

/// Root-cause category named in a `Failure Type:` line.
pub fn extract_failure_category(analysis: &str) -> Option<FailureCategory> {
    let caps = FAILURE_TYPE_RE.captures(analysis)?;
    let word = caps[1].to_ascii_lowercase();
    if word.starts_with("tool") {
        Some(FailureCategory::ToolSelection)
    } else if word == "approach" {
        Some(FailureCategory::Approach)
    } else if word == "assumption" {
        Some(FailureCategory::Assumption)
    } else {
        Some(FailureCategory::Environment)
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
