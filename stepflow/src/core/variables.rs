//! Placeholder substitution for `{{NAME}}` tokens inside step fields.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::core::types::{PlanStep, VariablesManifest};

/// Resolved variable values keyed by placeholder name.
pub type VariableMap = BTreeMap<String, String>;

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder regex"));

/// Build the name -> value map from a manifest.
pub fn variable_map(manifest: &VariablesManifest) -> VariableMap {
    manifest
        .variables
        .iter()
        .map(|var| (var.name.clone(), var.value.clone()))
        .collect()
}

/// Replace every known `{{NAME}}` with its value. Unknown placeholders are left intact.
pub fn resolve(text: &str, vars: &VariableMap) -> String {
    if vars.is_empty() {
        return text.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Resolve every text field the execution actor sees.
pub fn resolve_step(step: &PlanStep, vars: &VariableMap) -> PlanStep {
    PlanStep {
        title: resolve(&step.title, vars),
        description: resolve(&step.description, vars),
        success_criteria: resolve(&step.success_criteria, vars),
        rationale: resolve(&step.rationale, vars),
        context_dependencies: step
            .context_dependencies
            .iter()
            .map(|dep| resolve(dep, vars))
            .collect(),
        context_output: resolve(&step.context_output, vars),
        success_patterns: step.success_patterns.clone(),
        failure_patterns: step.failure_patterns.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Variable;

    fn vars() -> VariableMap {
        let manifest = VariablesManifest {
            objective: "Deploy to {{ACCOUNT_ID}}".to_string(),
            variables: vec![
                Variable {
                    name: "ACCOUNT_ID".to_string(),
                    description: "AWS account".to_string(),
                    value: "123456789012".to_string(),
                },
                Variable {
                    name: "REGION".to_string(),
                    description: "AWS region".to_string(),
                    value: "eu-west-1".to_string(),
                },
            ],
        };
        variable_map(&manifest)
    }

    #[test]
    fn resolves_known_placeholders_and_keeps_unknown() {
        let out = resolve("{{ACCOUNT_ID}} in {{ REGION }} via {{PROFILE}}", &vars());
        assert_eq!(out, "123456789012 in eu-west-1 via {{PROFILE}}");
    }

    #[test]
    fn resolve_is_identity_without_variables() {
        let empty = VariableMap::new();
        assert_eq!(resolve("{{A}} stays", &empty), "{{A}} stays");
    }

    #[test]
    fn resolve_step_touches_paths_but_not_patterns() {
        let step = PlanStep {
            title: "Inspect {{REGION}}".to_string(),
            description: "List buckets in {{ACCOUNT_ID}}".to_string(),
            success_criteria: "bucket list saved".to_string(),
            rationale: String::new(),
            context_dependencies: vec!["out/{{REGION}}/prev.md".to_string()],
            context_output: "out/{{REGION}}/buckets.md".to_string(),
            success_patterns: vec!["used {{REGION}} flag".to_string()],
            failure_patterns: Vec::new(),
        };

        let resolved = resolve_step(&step, &vars());
        assert_eq!(resolved.title, "Inspect eu-west-1");
        assert_eq!(resolved.context_dependencies, vec!["out/eu-west-1/prev.md"]);
        assert_eq!(resolved.context_output, "out/eu-west-1/buckets.md");
        assert_eq!(resolved.success_patterns, step.success_patterns);
    }
}
