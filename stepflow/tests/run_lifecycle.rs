//! Full-run scenarios driven through `stepflow::run::run`.
//!
//! Every collaborator and the gateway are scripted. Gates that are not scripted
//! fall back to their non-destructive choice, so each test only scripts the
//! decisions it is about.

use std::fs;

use stepflow::approval::{PlanSource, RevisionBudgetExhausted};
use stepflow::core::cancel::{CancelToken, is_cancelled};
use stepflow::core::types::FailureCategory;
use stepflow::exit_codes;
use stepflow::io::config::StepflowConfig;
use stepflow::io::gateway::DecisionOutcome;
use stepflow::run::{RunOutcome, run};
use stepflow::test_support::{
    ScriptedAgents, ScriptedGateway, TestWorkspace, failed, manifest, passed, plan, plan_step,
};

fn run_with(
    ws: &TestWorkspace,
    agents: &ScriptedAgents,
    gateway: &ScriptedGateway,
) -> anyhow::Result<RunOutcome> {
    run(
        ws.paths(),
        &StepflowConfig::default(),
        &agents.collaborators(),
        gateway,
        "Ship the release",
        &CancelToken::new(),
    )
}

fn completed(ws: &TestWorkspace) -> Vec<usize> {
    ws.load_checkpoint()
        .expect("load checkpoint")
        .expect("checkpoint exists")
        .completed_step_indices
        .into_iter()
        .collect()
}

/// Plan of 3 steps, checkpoint `[0]`, Resume chosen: only steps 2 and 3 run.
#[test]
fn resume_skips_completed_prefix() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(3)).expect("plan");
    ws.write_checkpoint(3, &[0]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .choose(DecisionOutcome::ChoiceA)
        .approve()
        .approve();

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert_eq!(agents.executor.executed_indices(), vec![1, 2]);
    assert_eq!(agents.analyst.learned_steps(), vec![2, 3]);
    assert!(
        agents
            .validator
            .requests()
            .iter()
            .all(|r| r.step_number != 1)
    );
    assert_eq!(completed(&ws), vec![0, 1, 2]);
    assert_eq!(outcome.plan_source, PlanSource::Existing);
    assert_eq!(outcome.steps_completed, 3);
    assert!(!outcome.stopped_early);
    assert!(outcome.critique_passed);
    assert!(ws.paths().todo_path.exists());
    gateway.assert_drained().expect("gateway drained");
}

/// Two failures with refinement, then success: one success analysis, and the gate
/// sees the passing outcome.
#[test]
fn refined_retries_end_in_single_success_learning() {
    let ws = TestWorkspace::new().expect("workspace");
    let agents = ScriptedAgents::new();
    agents.author.push_draft("## Step 1: Build\nBuild the image.");
    agents.reader.push_steps(vec![plan_step("Build")]);
    agents.validator.push_outcome(failed(&["image missing"]));
    agents.validator.push_outcome(failed(&["wrong tag"]));
    agents.validator.push_outcome(passed());
    agents
        .analyst
        .push_failure_refinement("Build with buildx", FailureCategory::ToolSelection);
    agents
        .analyst
        .push_failure_refinement("Build with buildx and tag latest", FailureCategory::Assumption);
    let gateway = ScriptedGateway::new();
    gateway.approve().approve();

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert_eq!(agents.analyst.success_calls(), 1);
    assert_eq!(agents.analyst.failure_calls(), 2);
    let requests = agents.executor.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].step.description, "Build with buildx and tag latest");
    assert_eq!(
        requests[2].validation_feedback,
        vec!["image missing".to_string(), "wrong tag".to_string()]
    );
    let review = &gateway.requests_for("step_review")[0];
    assert!(review.context.contains("Success criteria met: true"));
    assert_eq!(outcome.plan_source, PlanSource::Created);
    assert_eq!(outcome.steps_completed, 1);
    agents.assert_drained().expect("agents drained");
}

/// Twenty plan rejections abort the run before anything executes.
#[test]
fn exhausted_plan_approval_is_fatal() {
    let ws = TestWorkspace::new().expect("workspace");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    for i in 1..=20 {
        agents.author.push_draft(&format!("## Step 1: Draft {i}"));
        gateway.reject("not yet");
    }

    let err = run_with(&ws, &agents, &gateway).expect_err("plan never approved");

    let exhausted = err
        .downcast_ref::<RevisionBudgetExhausted>()
        .expect("revision budget error");
    assert_eq!(exhausted.phase, "plan");
    assert_eq!(exhausted.max, 20);
    assert_eq!(exit_codes::for_error(&err), exit_codes::NOT_APPROVED);
    assert!(agents.executor.requests().is_empty());
    assert!(!ws.paths().checkpoint_path.exists());
    assert!(!ws.paths().plan_markdown_path.exists());
}

/// Fast execute over `[0, 1]`: replayed steps skip gates and learning.
#[test]
fn fast_execute_replays_without_gates_or_learning() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(4)).expect("plan");
    ws.write_checkpoint(4, &[0, 1]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .choose(DecisionOutcome::ChoiceC)
        .approve()
        .approve();

    run_with(&ws, &agents, &gateway).expect("run");

    let requests = agents.executor.requests();
    assert_eq!(agents.executor.executed_indices(), vec![0, 1, 2, 3]);
    assert!(requests[0].replay && requests[1].replay);
    assert!(!requests[2].replay && !requests[3].replay);
    assert_eq!(agents.analyst.learned_steps(), vec![3, 4]);
    let reviews = gateway.requests_for("step_review");
    assert_eq!(reviews.len(), 2);
    assert!(reviews[0].prompt.contains("3/4"));
    assert_eq!(completed(&ws), vec![0, 1, 2, 3]);
    gateway.assert_drained().expect("gateway drained");
}

/// Cancelling partway through a fast-execute replay keeps every step approved earlier.
#[test]
fn cancelled_replay_keeps_earlier_approvals() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(5)).expect("plan");
    ws.write_checkpoint(5, &[0, 1, 2]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    agents.executor.push_summary("replayed step 1");
    agents.executor.push_cancel();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .choose(DecisionOutcome::ChoiceC);

    let err = run_with(&ws, &agents, &gateway).expect_err("cancelled");

    assert!(is_cancelled(&err));
    assert_eq!(agents.executor.executed_indices(), vec![0, 1]);
    assert_eq!(completed(&ws), vec![0, 1, 2]);
    assert!(gateway.requests_for("step_review").is_empty());
    gateway.assert_drained().expect("gateway drained");
}

/// A checkpoint sized for another plan is ignored: no resume question, every step runs.
#[test]
fn mismatched_checkpoint_is_ignored() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(2)).expect("plan");
    ws.write_checkpoint(5, &[0, 1, 2]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .approve()
        .approve();

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert!(gateway.requests_for("resume").is_empty());
    assert_eq!(agents.executor.executed_indices(), vec![0, 1]);
    let saved = ws.load_checkpoint().expect("load").expect("checkpoint");
    assert_eq!(saved.total_steps, 2);
    assert_eq!(outcome.steps_completed, 2);
}

/// Persistent failure stops at three attempts and still reaches the gate.
#[test]
fn retry_cap_holds_across_the_run() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(1)).expect("plan");
    let agents = ScriptedAgents::new();
    for issue in ["a", "b", "c"] {
        agents.validator.push_outcome(failed(&[issue]));
    }
    let gateway = ScriptedGateway::new();
    gateway.choose(DecisionOutcome::ChoiceA).approve();

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert_eq!(agents.executor.requests().len(), 3);
    assert_eq!(agents.validator.requests().len(), 3);
    let feedback: Vec<Vec<String>> = agents
        .executor
        .requests()
        .into_iter()
        .map(|r| r.validation_feedback)
        .collect();
    assert!(feedback[0].is_empty());
    assert_eq!(feedback[1], vec!["a".to_string()]);
    assert_eq!(feedback[2], vec!["a".to_string(), "b".to_string()]);
    let review = &gateway.requests_for("step_review")[0];
    assert!(review.context.contains("Attempts used: 3/3"));
    assert!(review.context.contains("Success criteria met: false"));
    assert_eq!(outcome.steps_completed, 1);
}

/// Every step already approved: straight to the writer.
#[test]
fn complete_checkpoint_goes_straight_to_writer() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(2)).expect("plan");
    ws.write_checkpoint(2, &[0, 1]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway.choose(DecisionOutcome::ChoiceA);

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert!(agents.executor.requests().is_empty());
    assert!(gateway.requests_for("resume").is_empty());
    let writer_requests = agents.writer.requests();
    assert_eq!(writer_requests.len(), 1);
    assert_eq!(writer_requests[0].history.len(), 2);
    assert_eq!(outcome.steps_completed, 2);
    assert!(outcome.critique_passed);
}

/// Approved variables template the objective; only the executor sees real values.
#[test]
fn variables_resolve_only_for_the_executor() {
    let ws = TestWorkspace::new().expect("workspace");
    let agents = ScriptedAgents::new();
    agents.variables.push_manifest(manifest(
        "Deploy {{APP}} to production",
        &[("APP", "billing-api")],
    ));
    agents.author.push_draft("## Step 1: Deploy {{APP}}");
    let mut step = plan_step("Deploy");
    step.description = "Roll out {{APP}}".to_string();
    agents.reader.push_steps(vec![step]);
    let gateway = ScriptedGateway::new();
    gateway.approve().approve().approve();

    let outcome = run(
        ws.paths(),
        &StepflowConfig::default(),
        &agents.collaborators(),
        &gateway,
        "Deploy billing-api to production",
        &CancelToken::new(),
    )
    .expect("run");

    assert_eq!(
        agents.author.requests()[0].objective,
        "Deploy {{APP}} to production"
    );
    assert_eq!(
        agents.executor.requests()[0].step.description,
        "Roll out billing-api"
    );
    assert_eq!(
        agents.validator.requests()[0].step.description,
        "Roll out {{APP}}"
    );
    assert!(ws.paths().variables_path.exists());
    let todo = fs::read_to_string(&ws.paths().todo_path).expect("todo");
    assert!(!todo.contains("billing-api"));
    assert!(outcome.critique_passed);
}

/// Stopping after a rejection still produces a todo list for the approved prefix.
#[test]
fn stop_after_rejection_still_writes_todo() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(3)).expect("plan");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .approve()
        .reject("wrong bucket")
        .choose(DecisionOutcome::ChoiceA);

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert!(outcome.stopped_early);
    assert_eq!(outcome.steps_completed, 1);
    assert_eq!(completed(&ws), vec![0]);
    assert_eq!(agents.writer.requests()[0].history.len(), 2);
    assert!(outcome.todo_path.is_some());
}

/// Creating a new plan clears the previous plan's checkpoint.
#[test]
fn create_new_plan_discards_old_progress() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(2)).expect("plan");
    ws.write_checkpoint(2, &[0]).expect("checkpoint");
    let agents = ScriptedAgents::new();
    agents.author.push_draft("## Step 1: Only");
    agents.reader.push_steps(vec![plan_step("Only")]);
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceB)
        .approve()
        .approve();

    let outcome = run_with(&ws, &agents, &gateway).expect("run");

    assert_eq!(outcome.plan_source, PlanSource::Created);
    assert!(gateway.requests_for("resume").is_empty());
    assert_eq!(agents.executor.executed_indices(), vec![0]);
    let saved = ws.load_checkpoint().expect("load").expect("checkpoint");
    assert_eq!(saved.total_steps, 1);
}

/// Cancelling at a gate stops the run and leaves the last checkpoint in place.
#[test]
fn cancellation_stops_at_the_next_gate() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_plan(&plan(3)).expect("plan");
    let agents = ScriptedAgents::new();
    let gateway = ScriptedGateway::new();
    gateway
        .choose(DecisionOutcome::ChoiceA)
        .approve()
        .cancel();

    let err = run_with(&ws, &agents, &gateway).expect_err("cancelled");

    assert!(is_cancelled(&err));
    assert_eq!(exit_codes::for_error(&err), exit_codes::CANCELLED);
    assert_eq!(agents.executor.executed_indices(), vec![0, 1]);
    assert_eq!(completed(&ws), vec![0]);
    assert!(agents.writer.requests().is_empty());
}
