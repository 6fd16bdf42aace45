//! Prompt rendering for the command-backed collaborators.
//!
//! Each phase has a markdown template under `io/prompts/`. Templates divide their
//! output into sections with `<!-- section:KEY required|droppable -->` markers so
//! that an oversized prompt can shed context before it is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::Environment;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const EXECUTION_TEMPLATE: &str = include_str!("prompts/execution.md");
const VALIDATION_TEMPLATE: &str = include_str!("prompts/validation.md");
const SUCCESS_LEARNING_TEMPLATE: &str = include_str!("prompts/success_learning.md");
const FAILURE_LEARNING_TEMPLATE: &str = include_str!("prompts/failure_learning.md");
const PLAN_DRAFT_TEMPLATE: &str = include_str!("prompts/plan_draft.md");
const PLAN_READER_TEMPLATE: &str = include_str!("prompts/plan_reader.md");
const VARIABLES_TEMPLATE: &str = include_str!("prompts/variables.md");
const WRITER_TEMPLATE: &str = include_str!("prompts/writer.md");

/// Droppable sections, least important first.
const DROP_ORDER: [&str; 3] = ["prior_feedback", "learning", "trace"];

const TRUNCATED_MARKER: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section regex")
});

/// One template per collaborator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Execution,
    Validation,
    SuccessLearning,
    FailureLearning,
    PlanDraft,
    PlanReader,
    Variables,
    Writer,
}

impl PromptKind {
    fn name(&self) -> &'static str {
        match self {
            PromptKind::Execution => "execution",
            PromptKind::Validation => "validation",
            PromptKind::SuccessLearning => "success_learning",
            PromptKind::FailureLearning => "failure_learning",
            PromptKind::PlanDraft => "plan_draft",
            PromptKind::PlanReader => "plan_reader",
            PromptKind::Variables => "variables",
            PromptKind::Writer => "writer",
        }
    }

    fn source(&self) -> &'static str {
        match self {
            PromptKind::Execution => EXECUTION_TEMPLATE,
            PromptKind::Validation => VALIDATION_TEMPLATE,
            PromptKind::SuccessLearning => SUCCESS_LEARNING_TEMPLATE,
            PromptKind::FailureLearning => FAILURE_LEARNING_TEMPLATE,
            PromptKind::PlanDraft => PLAN_DRAFT_TEMPLATE,
            PromptKind::PlanReader => PLAN_READER_TEMPLATE,
            PromptKind::Variables => VARIABLES_TEMPLATE,
            PromptKind::Writer => WRITER_TEMPLATE,
        }
    }

    const ALL: [PromptKind; 8] = [
        PromptKind::Execution,
        PromptKind::Validation,
        PromptKind::SuccessLearning,
        PromptKind::FailureLearning,
        PromptKind::PlanDraft,
        PromptKind::PlanReader,
        PromptKind::Variables,
        PromptKind::Writer,
    ];
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        for kind in PromptKind::ALL {
            env.add_template(kind.name(), kind.source())
                .expect("embedded prompt template should be valid");
        }
        Self { env }
    }

    fn render<S: Serialize>(&self, kind: PromptKind, ctx: &S) -> Result<String> {
        let template = self.env.get_template(kind.name())?;
        template
            .render(ctx)
            .with_context(|| format!("render {} prompt", kind.name()))
    }
}

/// A parsed section from rendered template output.
#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    /// Section content without its marker.
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();

    for (i, caps) in markers.iter().enumerate() {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = &caps[2] == "required";
        if !content.is_empty() || required {
            sections.push(ParsedSection {
                key: caps[1].to_string(),
                required,
                content,
            });
        }
    }

    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

/// Drop droppable sections in [`DROP_ORDER`], then truncate the last section.
fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    if total_len(sections) <= budget {
        return;
    }

    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            break;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let other_len: usize = sections
        .iter()
        .take(sections.len().saturating_sub(1))
        .map(|s| s.content.len())
        .sum();
    let allowed = budget.saturating_sub(other_len);
    if let Some(last) = sections.last_mut() {
        let before_len = last.content.len();
        let keep = if allowed > TRUNCATED_MARKER.len() {
            allowed - TRUNCATED_MARKER.len()
        } else {
            allowed
        };
        let mut cut = keep.min(last.content.len());
        while !last.content.is_char_boundary(cut) {
            cut -= 1;
        }
        last.content.truncate(cut);
        if allowed > TRUNCATED_MARKER.len() {
            last.content.push_str(TRUNCATED_MARKER);
        }
        debug!(
            section = %last.key,
            before_len,
            after_len = last.content.len(),
            "truncated section for budget"
        );
    }
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Builds phase prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Render the template for `kind` with `ctx` and fit it to the budget.
    pub fn build<S: Serialize>(&self, kind: PromptKind, ctx: &S) -> Result<String> {
        let rendered = PromptEngine::new().render(kind, ctx)?;
        let mut sections = parse_sections(&rendered);
        apply_budget(&mut sections, self.budget_bytes);
        Ok(render_sections(&sections))
    }
}
