//! Shared deterministic types for the step state machine.
//!
//! These types define stable contracts between the orchestration modules and the
//! external collaborators. They carry no I/O and serialize to the JSON shapes the
//! collaborators read and write.

use serde::{Deserialize, Serialize};

/// One unit of work in the plan.
///
/// A step's identity is its index in the plan's ordered sequence. `description`,
/// `success_patterns` and `failure_patterns` are rewritten in memory as learning
/// folds back into the plan during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub title: String,
    pub description: String,
    pub success_criteria: String,
    #[serde(default)]
    pub rationale: String,
    /// Relative paths this step reads, in declaration order.
    #[serde(default)]
    pub context_dependencies: Vec<String>,
    /// Relative path this step produces.
    #[serde(default)]
    pub context_output: String,
    #[serde(default)]
    pub success_patterns: Vec<String>,
    #[serde(default)]
    pub failure_patterns: Vec<String>,
}

/// Terminal status reported by the validator for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Completed,
    Failed,
    Partial,
    Incomplete,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Completed => "completed",
            ValidationStatus::Failed => "failed",
            ValidationStatus::Partial => "partial",
            ValidationStatus::Incomplete => "incomplete",
        }
    }
}

/// A single issue raised by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub issue: String,
}

/// Result of validating one execution attempt against the step's success criteria.
///
/// Lives only for the current retry cycle: its feedback is folded into the next
/// attempt's execution request rather than stored on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub success: bool,
    pub status: ValidationStatus,
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
}

impl ValidationOutcome {
    /// One-line summary shown at the human gate.
    pub fn summary(&self, step_number: usize) -> String {
        format!(
            "Step {step_number} validation completed. Success criteria met: {}, status: {}",
            self.success,
            self.status.as_str()
        )
    }
}

/// How much detail learning analysis should capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningDetail {
    /// Exact tool invocations with full arguments.
    Exact,
    /// General strategy patterns.
    #[default]
    General,
}

impl LearningDetail {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningDetail::Exact => "exact",
            LearningDetail::General => "general",
        }
    }
}

/// Root-cause bucket assigned by failure analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Wrong tool chosen for the task.
    ToolSelection,
    /// Right tool, wrong usage or parameters.
    Approach,
    /// Incorrect assumptions about system state.
    Assumption,
    /// External factors such as permissions, network or dependencies.
    Environment,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::ToolSelection => "tool_selection",
            FailureCategory::Approach => "approach",
            FailureCategory::Assumption => "assumption",
            FailureCategory::Environment => "environment",
        }
    }
}

/// One extracted variable from the objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub description: String,
    pub value: String,
}

/// Externally produced variables manifest (`variables.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariablesManifest {
    /// Objective rewritten with `{{NAME}}` placeholders.
    pub objective: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}
