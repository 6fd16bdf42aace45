//! Final todo list: generate, critique, and revise within a small budget.
//!
//! Critique is automated. A human only sees the document when the critique is
//! still failing after the last revision.

use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::agents::{StepHistory, TodoWriter, WriterRequest};
use crate::core::cancel::{CancelToken, is_cancelled};
use crate::core::critique::{CritiqueReport, critique_todo};
use crate::core::types::PlanStep;
use crate::core::variables::VariableMap;
use crate::io::gateway::{
    ApprovalGateway, ApprovalRequest, ChoiceSet, DecisionOutcome, decide, request_id,
};
use crate::io::paths::WorkspacePaths;
use crate::io::write_atomic;

/// Result of the writer phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterOutcome {
    /// Where the todo list was written; `None` when the writer never produced one.
    pub todo_path: Option<PathBuf>,
    pub critique_passed: bool,
    pub revisions: u32,
}

/// Inputs the writer phase reads but does not own.
#[derive(Debug, Clone, Copy)]
pub struct WriterInput<'a> {
    /// Objective with `{{NAME}}` placeholders.
    pub objective: &'a str,
    pub plan: &'a [PlanStep],
    pub history: &'a [StepHistory],
    pub variables: &'a VariableMap,
}

pub struct WriterReviewLoop<'a> {
    writer: &'a dyn TodoWriter,
    gateway: &'a dyn ApprovalGateway,
    paths: &'a WorkspacePaths,
    max_revisions: u32,
}

struct Draft {
    raw: String,
    report: CritiqueReport,
}

impl<'a> WriterReviewLoop<'a> {
    pub fn new(
        writer: &'a dyn TodoWriter,
        gateway: &'a dyn ApprovalGateway,
        paths: &'a WorkspacePaths,
        max_revisions: u32,
    ) -> Self {
        Self {
            writer,
            gateway,
            paths,
            max_revisions,
        }
    }

    #[instrument(skip_all, fields(steps = input.plan.len()))]
    pub fn run(&self, input: &WriterInput<'_>, cancel: &CancelToken) -> Result<WriterOutcome> {
        let mut critique_feedback: Vec<String> = Vec::new();
        let mut latest: Option<Draft> = None;

        for revision in 1..=self.max_revisions {
            cancel.check()?;
            match self.draft(input, revision, &critique_feedback, None, cancel)? {
                Some(draft) if draft.report.passed() => {
                    info!(revision, "todo list passed critique");
                    return self.finish(&draft, true, revision);
                }
                Some(draft) => {
                    warn!(
                        revision,
                        issues = draft.report.issues.len(),
                        "todo list failed critique"
                    );
                    critique_feedback = draft.report.issues.iter().map(|i| i.to_string()).collect();
                    latest = Some(draft);
                }
                None => {
                    critique_feedback = vec![format!("Revision {revision} produced no document.")];
                }
            }
        }

        warn!(
            max = self.max_revisions,
            phase = "writer",
            "critique budget exhausted"
        );
        let Some(draft) = latest else {
            warn!("writer never produced a todo list");
            return Ok(WriterOutcome {
                todo_path: None,
                critique_passed: false,
                revisions: self.max_revisions,
            });
        };

        let request = ApprovalRequest::new(
            request_id("writer_review", self.max_revisions),
            "The todo list still fails critique. Accept it as-is?",
            format!("Critique issues:\n{}\n\n{}", draft.report.render(), draft.raw),
            ChoiceSet::binary("Accept as-is", "Request one more revision"),
        );
        let decision = decide(self.gateway, &request, cancel)?;
        if decision.outcome != DecisionOutcome::Reject {
            warn!("writing todo list that failed critique");
            return self.finish(&draft, false, self.max_revisions);
        }

        let revision = self.max_revisions + 1;
        let human = decision.feedback().to_string();
        match self.draft(
            input,
            revision,
            &critique_feedback,
            (!human.is_empty()).then_some(human),
            cancel,
        )? {
            Some(revised) => {
                let passed = revised.report.passed();
                if !passed {
                    warn!(revision, "final revision still fails critique, writing it anyway");
                }
                self.finish(&revised, passed, revision)
            }
            None => {
                warn!(revision, "final revision failed, keeping the previous document");
                self.finish(&draft, false, revision)
            }
        }
    }

    /// One writer call plus critique. `None` when the writer itself errors.
    fn draft(
        &self,
        input: &WriterInput<'_>,
        revision: u32,
        critique_feedback: &[String],
        human_feedback: Option<String>,
        cancel: &CancelToken,
    ) -> Result<Option<Draft>> {
        let request = WriterRequest {
            objective: input.objective.to_string(),
            revision,
            steps: input.plan.to_vec(),
            history: input.history.to_vec(),
            variable_names: input.variables.keys().cloned().collect(),
            critique_feedback: critique_feedback.to_vec(),
            human_feedback,
        };
        let raw = match self.writer.write_todo(&request, cancel) {
            Ok(raw) => raw,
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!(revision, phase = "writer", err = %format!("{err:#}"), "writer failed");
                return Ok(None);
            }
        };
        let report = critique_todo(&raw, input.plan, input.variables);
        let attempt_path = self
            .paths
            .writer_dir
            .join(format!("revision_{revision}.json"));
        write_atomic(&attempt_path, &raw)?;
        if !report.passed() {
            let critique_path = self
                .paths
                .writer_dir
                .join(format!("revision_{revision}_critique.md"));
            write_atomic(&critique_path, &report.render())?;
        }
        Ok(Some(Draft { raw, report }))
    }

    fn finish(&self, draft: &Draft, passed: bool, revisions: u32) -> Result<WriterOutcome> {
        let mut body = draft.raw.trim_end().to_string();
        body.push('\n');
        write_atomic(&self.paths.todo_path, &body)?;
        info!(path = %self.paths.todo_path.display(), passed, "todo list written");
        Ok(WriterOutcome {
            todo_path: Some(self.paths.todo_path.clone()),
            critique_passed: passed,
            revisions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedGateway, ScriptedWriter, TestWorkspace, plan};
    use std::fs;

    fn run(
        ws: &TestWorkspace,
        writer: &ScriptedWriter,
        gateway: &ScriptedGateway,
        vars: &VariableMap,
    ) -> WriterOutcome {
        let steps = plan(2);
        let input = WriterInput {
            objective: "Ship {{APP}}",
            plan: &steps,
            history: &[],
            variables: vars,
        };
        WriterReviewLoop::new(writer, gateway, ws.paths(), 3)
            .run(&input, &CancelToken::new())
            .expect("writer phase")
    }

    const MISSING_STEP_2: &str =
        r#"{"objective":"x","steps":[{"title":"Step 1","description":"d","success_criteria":"c"}]}"#;

    #[test]
    fn critique_feedback_drives_next_revision() {
        let ws = TestWorkspace::new().expect("workspace");
        let writer = ScriptedWriter::new();
        writer.push_document(MISSING_STEP_2);
        let gateway = ScriptedGateway::new();

        let outcome = run(&ws, &writer, &gateway, &VariableMap::new());

        assert!(outcome.critique_passed);
        assert_eq!(outcome.revisions, 2);
        let requests = writer.requests();
        assert!(requests[1].critique_feedback[0].starts_with("MISSING_STEP"));
        assert!(gateway.requests().is_empty());
        let written = fs::read_to_string(ws.paths().todo_path.clone()).expect("todo");
        assert!(written.contains("Step 2"));
    }

    #[test]
    fn exhaustion_asks_human_and_accepts_as_is() {
        let ws = TestWorkspace::new().expect("workspace");
        let writer = ScriptedWriter::new();
        for _ in 0..3 {
            writer.push_document(MISSING_STEP_2);
        }
        let gateway = ScriptedGateway::new();
        gateway.approve();

        let outcome = run(&ws, &writer, &gateway, &VariableMap::new());

        assert!(!outcome.critique_passed);
        assert_eq!(writer.requests().len(), 3);
        assert_eq!(gateway.requests_for("writer_review").len(), 1);
        let written = fs::read_to_string(ws.paths().todo_path.clone()).expect("todo");
        assert!(written.starts_with(MISSING_STEP_2));
    }

    #[test]
    fn rejection_buys_one_final_revision_with_feedback() {
        let ws = TestWorkspace::new().expect("workspace");
        let writer = ScriptedWriter::new();
        for _ in 0..3 {
            writer.push_document(MISSING_STEP_2);
        }
        let gateway = ScriptedGateway::new();
        gateway.reject("include step 2");

        let outcome = run(&ws, &writer, &gateway, &VariableMap::new());

        assert!(outcome.critique_passed);
        assert_eq!(outcome.revisions, 4);
        let last = writer.requests().pop().expect("final request");
        assert_eq!(last.human_feedback.as_deref(), Some("include step 2"));
    }

    #[test]
    fn leaked_values_fail_critique() {
        let ws = TestWorkspace::new().expect("workspace");
        let writer = ScriptedWriter::new();
        let leaked = r#"{"objective":"Ship billing","steps":[
            {"title":"Step 1","description":"deploy billing","success_criteria":"c"},
            {"title":"Step 2","description":"d","success_criteria":"c"}]}"#;
        writer.push_document(leaked);
        let gateway = ScriptedGateway::new();
        let vars = VariableMap::from([("APP".to_string(), "billing".to_string())]);

        let outcome = run(&ws, &writer, &gateway, &vars);

        assert!(outcome.critique_passed);
        assert!(writer.requests()[1].critique_feedback[0].starts_with("LEAKED_VALUE"));
        assert_eq!(writer.requests()[1].variable_names, vec!["APP".to_string()]);
    }
}
