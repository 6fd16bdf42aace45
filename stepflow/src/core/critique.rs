//! Structural critique of the final todo list.
//!
//! The writer's output must be a JSON document of the form
//! `{"objective": "...", "steps": [{"title", "description", "success_criteria", ...}]}`.
//! The critique is deterministic so that it can gate the writer loop without a human.

use std::fmt;

use serde_json::Value;

use crate::core::types::PlanStep;
use crate::core::variables::VariableMap;

/// Step fields that must be present and non-empty in every todo entry.
pub const REQUIRED_STEP_FIELDS: [&str; 3] = ["title", "description", "success_criteria"];

/// Variable values shorter than this are not checked for leaks.
pub const MIN_SECRET_LEN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritiqueIssueKind {
    InvalidEncoding,
    MissingStep,
    MissingField,
    LeakedValue,
    AbsolutePath,
}

impl CritiqueIssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CritiqueIssueKind::InvalidEncoding => "INVALID_ENCODING",
            CritiqueIssueKind::MissingStep => "MISSING_STEP",
            CritiqueIssueKind::MissingField => "MISSING_FIELD",
            CritiqueIssueKind::LeakedValue => "LEAKED_VALUE",
            CritiqueIssueKind::AbsolutePath => "ABSOLUTE_PATH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CritiqueIssue {
    pub kind: CritiqueIssueKind,
    pub detail: String,
}

impl fmt::Display for CritiqueIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CritiqueReport {
    pub issues: Vec<CritiqueIssue>,
}

impl CritiqueReport {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }

    fn push(&mut self, kind: CritiqueIssueKind, detail: impl Into<String>) {
        self.issues.push(CritiqueIssue {
            kind,
            detail: detail.into(),
        });
    }

    /// Issues rendered one per line, for feeding back into the next writer pass.
    pub fn render(&self) -> String {
        self.issues
            .iter()
            .map(|issue| format!("- {issue}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Critique a raw todo document against the executed plan and the variable map.
pub fn critique_todo(raw: &str, plan: &[PlanStep], vars: &VariableMap) -> CritiqueReport {
    let mut report = CritiqueReport::default();

    let doc: Value = match serde_json::from_str(raw) {
        Ok(doc) => doc,
        Err(err) => {
            report.push(CritiqueIssueKind::InvalidEncoding, format!("not valid JSON: {err}"));
            return report;
        }
    };
    let Some(steps) = doc.get("steps").and_then(Value::as_array) else {
        report.push(
            CritiqueIssueKind::InvalidEncoding,
            "document has no `steps` array",
        );
        return report;
    };

    for (idx, entry) in steps.iter().enumerate() {
        check_required_fields(&mut report, idx, entry);
        check_paths(&mut report, idx, entry);
    }

    let titles: Vec<String> = steps
        .iter()
        .filter_map(|entry| entry.get("title").and_then(Value::as_str))
        .map(normalize_title)
        .collect();
    for (idx, step) in plan.iter().enumerate() {
        if !titles.contains(&normalize_title(&step.title)) {
            report.push(
                CritiqueIssueKind::MissingStep,
                format!("plan step {} ({}) is not represented", idx + 1, step.title),
            );
        }
    }

    for (name, value) in vars {
        if value.chars().count() >= MIN_SECRET_LEN && raw.contains(value.as_str()) {
            report.push(
                CritiqueIssueKind::LeakedValue,
                format!("value of {name} appears verbatim; use {{{{{name}}}}}"),
            );
        }
    }

    report
}

fn check_required_fields(report: &mut CritiqueReport, idx: usize, entry: &Value) {
    for field in REQUIRED_STEP_FIELDS {
        let present = entry
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|text| !text.trim().is_empty());
        if !present {
            report.push(
                CritiqueIssueKind::MissingField,
                format!("todo step {} is missing `{field}`", idx + 1),
            );
        }
    }
}

fn check_paths(report: &mut CritiqueReport, idx: usize, entry: &Value) {
    let mut paths: Vec<&str> = entry
        .get("context_dependencies")
        .and_then(Value::as_array)
        .map(|deps| deps.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if let Some(output) = entry.get("context_output").and_then(Value::as_str) {
        paths.push(output);
    }
    for path in paths {
        if is_absolute_path(path) {
            report.push(
                CritiqueIssueKind::AbsolutePath,
                format!("todo step {} uses absolute path `{path}`", idx + 1),
            );
        }
    }
}

/// Unix roots, home expansions and Windows drive prefixes all count as absolute.
pub fn is_absolute_path(path: &str) -> bool {
    let path = path.trim();
    if path.starts_with('/') || path.starts_with('~') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && matches!(bytes[2], b'/' | b'\\')
}

fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}
