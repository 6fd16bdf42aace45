//! CLI tests for `stepflow init`, `status`, and `reset`.
//!
//! Spawns the stepflow binary and checks output and exit codes against the
//! checkpoint state on disk.

use std::fs;
use std::process::{Command, Output};

use stepflow::exit_codes;
use stepflow::io::checkpoint::CheckpointStore;
use stepflow::io::config::load_config;
use stepflow::io::paths::WorkspacePaths;
use stepflow::test_support::TestWorkspace;

fn stepflow(args: &[&str], workspace: &std::path::Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stepflow"))
        .args(args)
        .arg("--workspace")
        .arg(workspace)
        .output()
        .expect("spawn stepflow")
}

#[test]
fn init_writes_default_config() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = stepflow(&["init"], temp.path());

    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let paths = WorkspacePaths::new(temp.path());
    let config = load_config(&paths.config_path).expect("config");
    assert_eq!(config.max_step_attempts, 3);
    assert_eq!(config.max_plan_revisions, 20);
}

#[test]
fn status_reports_progress_and_reset_clears_it() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.write_checkpoint(3, &[0, 1]).expect("checkpoint");

    let output = stepflow(&["status"], ws.root());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("2/3 steps completed"), "stdout: {stdout}");

    let output = stepflow(&["reset"], ws.root());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(!ws.paths().checkpoint_path.exists());

    let output = stepflow(&["status"], ws.root());
    assert!(String::from_utf8_lossy(&output.stdout).contains("no checkpoint"));
}

#[test]
fn corrupt_checkpoint_is_an_error() {
    let ws = TestWorkspace::new().expect("workspace");
    let store = CheckpointStore::new(&ws.paths().checkpoint_path);
    fs::create_dir_all(ws.paths().state_dir.clone()).expect("state dir");
    fs::write(store.path(), "{not json").expect("write");

    let output = stepflow(&["status"], ws.root());

    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("corrupt"));
}
