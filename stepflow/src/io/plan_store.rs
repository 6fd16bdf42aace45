//! Plan and variables files under `.stepflow/planning/` and `.stepflow/variables/`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::write_atomic;
use crate::core::types::{PlanStep, VariablesManifest};

/// On-disk shape of `plan.json`, also the shape the plan reader returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanDocument {
    pub steps: Vec<PlanStep>,
}

/// Read the approved markdown plan, if one exists.
pub fn read_plan_markdown(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read plan {}", path.display()))?;
    Ok(Some(contents))
}

pub fn write_plan_markdown(path: &Path, markdown: &str) -> Result<()> {
    debug!(path = %path.display(), bytes = markdown.len(), "writing plan markdown");
    let mut buf = markdown.trim_end().to_string();
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load the structured plan, if one exists.
pub fn load_plan_steps(path: &Path) -> Result<Option<Vec<PlanStep>>> {
    Ok(read_json::<PlanDocument>(path, "plan")?.map(|doc| doc.steps))
}

/// Write the structured plan, including learned patterns.
pub fn write_plan_steps(path: &Path, steps: &[PlanStep]) -> Result<()> {
    debug!(path = %path.display(), steps = steps.len(), "writing plan json");
    write_json(
        path,
        &PlanDocument {
            steps: steps.to_vec(),
        },
    )
}

pub fn load_variables(path: &Path) -> Result<Option<VariablesManifest>> {
    read_json(path, "variables")
}

pub fn write_variables(path: &Path, manifest: &VariablesManifest) -> Result<()> {
    debug!(path = %path.display(), count = manifest.variables.len(), "writing variables");
    write_json(path, manifest)
}

fn read_json<T: DeserializeOwned>(path: &Path, label: &str) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {label} {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parse {label} {}", path.display()))?;
    Ok(Some(value))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Variable;

    fn step(title: &str) -> PlanStep {
        PlanStep {
            title: title.to_string(),
            description: format!("{title} description"),
            success_criteria: "done".to_string(),
            rationale: String::new(),
            context_dependencies: Vec::new(),
            context_output: format!("out/{title}.md"),
            success_patterns: vec!["reuse cached listing".to_string()],
            failure_patterns: Vec::new(),
        }
    }

    #[test]
    fn absent_files_load_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(read_plan_markdown(&temp.path().join("plan.md")).expect("md").is_none());
        assert!(load_plan_steps(&temp.path().join("plan.json")).expect("json").is_none());
        assert!(load_variables(&temp.path().join("v.json")).expect("vars").is_none());
    }

    #[test]
    fn plan_steps_keep_learned_patterns() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("planning/plan.json");
        let steps = vec![step("a"), step("b")];

        write_plan_steps(&path, &steps).expect("write");
        let loaded = load_plan_steps(&path).expect("load").expect("present");
        assert_eq!(loaded, steps);
    }

    #[test]
    fn variables_tolerate_missing_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("variables.json");
        fs::write(&path, "{\"objective\": \"plain objective\"}").expect("write");

        let manifest = load_variables(&path).expect("load").expect("present");
        assert!(manifest.variables.is_empty());

        let manifest = VariablesManifest {
            objective: "Use {{ACCOUNT}}".to_string(),
            variables: vec![Variable {
                name: "ACCOUNT".to_string(),
                description: "account id".to_string(),
                value: "42".to_string(),
            }],
        };
        write_variables(&path, &manifest).expect("write");
        assert_eq!(load_variables(&path).expect("load"), Some(manifest));
    }
}
