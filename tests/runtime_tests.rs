//! Tests for the wired runtime: seeding, run cycles over a task file,
//! restart recovery, rollback and corrupted-log handling.

use evoagent::config::EvoConfig;
use evoagent::error::{EvoError, EXIT_CORRUPTED};
use evoagent::integrator::CancelFlag;
use evoagent::ledger;
use evoagent::oracle::{AttemptTrace, ExpectedAnswerJudge, ReasoningTask, ScriptedAgent, ScriptedProposer};
use evoagent::runtime::*;
use evoagent::sandbox::ScriptedSandbox;
use evoagent::tasks::TaskFile;
use std::io::Write;
use std::sync::Arc;

const TASKS: &str = r#"
[[tool]]
id = "csv-validate-v1"
description = "Validate the row count of a CSV file"
slot = "validate_csv"
tags = ["csv"]
candidates = ["count_rows() { wc -l < \"$1\"; }"]
[tool.harness]
name = "csv"
driver = "true"

[[component]]
target = "decision_cache"
rationale = "cache recent decisions"
candidates = ["cache-v1"]
[[component.cases]]
name = "case-0"
driver = "true"
[[component.cases]]
name = "case-1"
driver = "true"
"#;

fn config(dir: &tempfile::TempDir) -> EvoConfig {
    let mut config = EvoConfig::default().with_data_dir(dir.path());
    config.pipeline.sync_log = false;
    config
}

fn open_idle(dir: &tempfile::TempDir) -> Result<Runtime, EvoError> {
    Runtime::open(config(dir), Arc::new(ScriptedProposer::new()), Arc::new(ScriptedSandbox::passing()))
}

async fn run_tasks(dir: &tempfile::TempDir) -> (Runtime, RunReport) {
    let file = TaskFile::parse(TASKS, "tasks.toml").unwrap();
    let runtime =
        Runtime::open(config(dir), file.proposer().unwrap(), Arc::new(ScriptedSandbox::passing())).unwrap();
    let report = runtime.run_cycles(&file, 1, &CancelFlag::new()).await.unwrap();
    (runtime, report)
}

// ---------------------------------------------------------------------------
// Run cycles
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_run_commits_tool_and_component() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, report) = run_tasks(&dir).await;
    assert_eq!(report.lines.len(), 2);
    assert_eq!(report.committed(), 2);
    assert_eq!(report.failures(), 0);

    let status = runtime.status();
    // Seed generation, the tool, the component.
    assert_eq!(status.generations, 3);
    assert_eq!(status.tools_active, 2);
    assert_eq!(status.principles_active, 4);
}

#[tokio::test]
async fn test_cancelled_run_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let file = TaskFile::parse(TASKS, "tasks.toml").unwrap();
    let runtime =
        Runtime::open(config(&dir), file.proposer().unwrap(), Arc::new(ScriptedSandbox::passing())).unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();
    let report = runtime.run_cycles(&file, 3, &cancel).await.unwrap();
    assert!(report.lines.is_empty());
    assert_eq!(runtime.status().generations, 1);
}

#[tokio::test]
async fn test_reasoning_pass_learns_principle() {
    let dir = tempfile::tempdir().unwrap();
    let proposer = ScriptedProposer::new().with_script("add", ["carry the tens digit"]);
    let runtime = Runtime::open(config(&dir), Arc::new(proposer), Arc::new(ScriptedSandbox::passing())).unwrap();
    let agent = ScriptedAgent::new(|_, guidance| {
        if guidance.render().contains("carry") {
            AttemptTrace::new("42", "carried")
        } else {
            AttemptTrace::new("41", "forgot")
        }
    });
    let reflection = runtime.reflection(Arc::new(agent), Arc::new(ExpectedAnswerJudge));
    let tasks = [ReasoningTask::new("add", "Add seventeen and twenty five").with_expected("42")];

    let lines = runtime.run_reasoning(&reflection, &tasks, 1, &CancelFlag::new()).await.unwrap();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].committed);
    assert!(!lines[0].failed);
    assert_eq!(runtime.status().principles_active, 5);

    let again = runtime.run_reasoning(&reflection, &tasks, 2, &CancelFlag::new()).await.unwrap();
    assert!(!again[0].committed);
    assert_eq!(again[0].summary, "solved on first attempt");
}

#[cfg(unix)]
#[tokio::test]
async fn test_run_drives_reasoning_tasks_through_agent_command() {
    let file = TaskFile::parse(
        r#"
[agent]
command = ["sh", "-c", 'input=$(cat); case "$input" in *carry*) echo 42 ;; *) echo 41 ;; esac']

[[reasoning]]
id = "add"
description = "Add seventeen and twenty five"
expected = "42"
candidates = ["carry the tens digit"]
"#,
        "tasks.toml",
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let runtime =
        Runtime::open(config(&dir), file.proposer().unwrap(), Arc::new(ScriptedSandbox::passing())).unwrap();
    let report = runtime.run_cycles(&file, 1, &CancelFlag::new()).await.unwrap();
    assert_eq!(report.lines.len(), 1);
    assert_eq!(report.committed(), 1);
    assert_eq!(runtime.status().generations, 2);
}

// ---------------------------------------------------------------------------
// Restart and rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let before = {
        let (runtime, _) = run_tasks(&dir).await;
        runtime.status()
    };
    let reopened = open_idle(&dir).unwrap();
    let after = reopened.status();
    assert_eq!(after.head, before.head);
    assert_eq!(after.tools_active, before.tools_active);
    assert_eq!(after.principles_total, before.principles_total);
}

#[tokio::test]
async fn test_rollback_to_seed_generation() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, _) = run_tasks(&dir).await;
    let generation = runtime.tracker().rollback(0).unwrap();
    assert_eq!(generation.index, 3);
    assert_eq!(generation.changes.len(), 2);

    let status = runtime.status();
    assert_eq!(status.tools_active, 0);
    assert_eq!(status.tools_total, 2);
    assert_eq!(status.principles_active, 4);
    assert_eq!(status.generations, 4);
}

// ---------------------------------------------------------------------------
// Log damage
// ---------------------------------------------------------------------------

#[test]
fn test_torn_tail_is_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    drop(open_idle(&dir).unwrap());
    let path = config(&dir).log_path();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"generation":{"index":1,"#).unwrap();
    drop(file);

    let runtime = open_idle(&dir).unwrap();
    assert_eq!(runtime.status().generations, 1);
}

#[test]
fn test_corrupted_log_fails_with_exit_code_two() {
    let dir = tempfile::tempdir().unwrap();
    drop(open_idle(&dir).unwrap());
    let path = config(&dir).log_path();
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(b"not a record\n{\"generation\":null}\n").unwrap();
    drop(file);

    let err = open_idle(&dir).err().expect("corrupted log must not open");
    assert!(err.is_corrupted_log());
    assert_eq!(err.exit_code(), EXIT_CORRUPTED);

    let report = ledger::repair(&path).unwrap();
    assert_eq!(report.kept, 1);
    assert!(report.dropped_bytes > 0);
    assert_eq!(open_idle(&dir).unwrap().status().generations, 1);
}
