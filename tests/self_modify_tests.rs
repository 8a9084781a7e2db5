//! Tests for benchmark-gated self-modification: the apply/revert decision,
//! regression safety of the live artifact, and the generations each decision
//! leaves behind.

use evoagent::artifact::CandidateArtifact;
use evoagent::generation::GenerationOutcome;
use evoagent::integrator::Integrator;
use evoagent::ledger::LOG_FILE;
use evoagent::oracle::ScriptedProposer;
use evoagent::sandbox::{OutcomeStatus, ScriptedRun, ScriptedSandbox, TestHarness};
use evoagent::self_modify::*;
use evoagent::store::Stores;
use evoagent::tracker::GenerationTracker;
use std::sync::Arc;
use std::time::Duration;

const CASES: usize = 50;

/// Candidates whose content is "rate:<r>" pass the first `r * CASES` cases
/// (harness names "case-0", "case-1", ...); anything else fails them all.
fn rated_sandbox() -> ScriptedSandbox {
    ScriptedSandbox::new(|artifact, harness| {
        let rate: f64 = artifact.content.trim_start_matches("rate:").parse().unwrap_or(0.0);
        let index: usize = harness.name.trim_start_matches("case-").parse().unwrap_or(usize::MAX);
        let status = if (index as f64) < rate * CASES as f64 { OutcomeStatus::Pass } else { OutcomeStatus::Fail };
        ScriptedRun::new(status).with_latency(Duration::from_millis(4))
    })
}

fn suite() -> BenchmarkSuite {
    BenchmarkSuite::new(
        "decision-cache-bench",
        (0..CASES).map(|i| TestHarness::shell(format!("case-{}", i), "true")).collect(),
    )
}

struct Fixture {
    _dir: tempfile::TempDir,
    integrator: Arc<Integrator>,
    controller: SelfModificationController,
}

fn fixture(proposer: ScriptedProposer) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let tracker = GenerationTracker::open(dir.path().join(LOG_FILE), false, Arc::new(Stores::new())).unwrap();
    let integrator = Arc::new(Integrator::new(Arc::new(proposer), Arc::new(rated_sandbox()), Arc::new(tracker)));
    let controller = SelfModificationController::new(Arc::clone(&integrator))
        .with_tolerance(0.05)
        .with_suite("decision_cache", suite());
    Fixture { _dir: dir, integrator, controller }
}

/// Fixture whose `decision_cache` is already live at an 80% success rate.
async fn baseline() -> Fixture {
    let f = fixture(ScriptedProposer::new().with_script("decision_cache", ["rate:0.80"]));
    let proposal = f.controller.run("decision_cache", "initial cache").await.unwrap();
    assert!(proposal.decision.is_applied());
    assert!(proposal.before.is_none());
    f
}

fn live_content(f: &Fixture) -> String {
    f.controller.live("decision_cache").map(|e| e.artifact.content).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// decision_cache scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_decision_cache_small_drop_is_applied() {
    let f = baseline().await;
    let evaluation = f
        .controller
        .evaluate("decision_cache", CandidateArtifact::code("rate:0.78", "decision_cache"))
        .await
        .unwrap();
    assert!((evaluation.before().unwrap().success_rate - 0.80).abs() < 1e-9);
    assert!((evaluation.after().success_rate - 0.78).abs() < 1e-9);

    let proposal = f.controller.apply(evaluation, "smaller cache").unwrap();
    assert_eq!(proposal.decision, Decision::Applied);
    assert_eq!(live_content(&f), "rate:0.78");

    let generation = proposal.generation;
    assert_eq!(generation.outcome, GenerationOutcome::Committed);
    let perf = generation.performance.as_ref().unwrap();
    assert_eq!(perf.component, "decision_cache");
    assert_eq!(perf.tolerance, 0.05);
}

#[tokio::test]
async fn test_decision_cache_large_drop_is_reverted() {
    let f = baseline().await;
    let live_before = f.controller.live("decision_cache").unwrap();

    let evaluation = f
        .controller
        .evaluate("decision_cache", CandidateArtifact::code("rate:0.70", "decision_cache"))
        .await
        .unwrap();
    assert!((evaluation.after().success_rate - 0.70).abs() < 1e-9);
    let proposal = f.controller.apply(evaluation, "aggressive eviction").unwrap();

    assert!(matches!(proposal.decision, Decision::Reverted { .. }));
    let generation = proposal.generation;
    assert_eq!(generation.outcome, GenerationOutcome::Reverted);
    assert!(generation.changes.is_empty());

    let live_after = f.controller.live("decision_cache").unwrap();
    assert_eq!(live_after.id, live_before.id);
    assert_eq!(live_after.artifact.content.as_bytes(), live_before.artifact.content.as_bytes());
}

// ---------------------------------------------------------------------------
// Regression safety through `run`
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_regressing_proposals_never_replace_live_artifact() {
    let f = fixture(
        ScriptedProposer::new().with_script("decision_cache", ["rate:0.80", "rate:0.40", "rate:0.10", "rate:0.74"]),
    );
    f.controller.run("decision_cache", "initial").await.unwrap();
    for _ in 0..3 {
        let proposal = f.controller.run("decision_cache", "retune").await.unwrap();
        assert!(!proposal.decision.is_applied(), "{}", proposal.decision);
        assert_eq!(live_content(&f), "rate:0.80");
    }
    let outcomes: Vec<GenerationOutcome> = f.integrator.tracker().history().map(|g| g.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            GenerationOutcome::Committed,
            GenerationOutcome::Reverted,
            GenerationOutcome::Reverted,
            GenerationOutcome::Reverted,
        ]
    );
}

#[tokio::test]
async fn test_improvement_upgrades_slot_version() {
    let f = fixture(ScriptedProposer::new().with_script("decision_cache", ["rate:0.60", "rate:0.90"]));
    f.controller.run("decision_cache", "initial").await.unwrap();
    let proposal = f.controller.run("decision_cache", "better").await.unwrap();
    assert!(proposal.decision.is_applied());
    assert_eq!(proposal.before_artifact.unwrap().content, "rate:0.60");
    let live = f.controller.live("decision_cache").unwrap();
    assert_eq!(live.version, 2);
    assert_eq!(live.artifact.content, "rate:0.90");
}

#[tokio::test]
async fn test_resubmitting_live_artifact_still_records_generation() {
    let f = fixture(ScriptedProposer::new().with_script("decision_cache", ["rate:0.80", "rate:0.80"]));
    f.controller.run("decision_cache", "initial").await.unwrap();
    let proposal = f.controller.run("decision_cache", "same again").await.unwrap();
    assert!(proposal.decision.is_applied());

    let generation = proposal.generation;
    assert_eq!(generation.index, 1);
    assert_eq!(generation.outcome, GenerationOutcome::Committed);
    assert!(generation.changes.is_empty());
    let perf = generation.performance.as_ref().unwrap();
    assert!((perf.before.as_ref().unwrap().success_rate - 0.80).abs() < 1e-9);
    assert!((perf.after.success_rate - 0.80).abs() < 1e-9);

    assert_eq!(f.integrator.tracker().len(), 2);
    assert_eq!(f.controller.live("decision_cache").unwrap().version, 1);
}

#[tokio::test]
async fn test_audit_records_each_decision() {
    let f = fixture(ScriptedProposer::new().with_script("decision_cache", ["rate:0.80", "rate:0.20"]));
    f.controller.run("decision_cache", "initial").await.unwrap();
    f.controller.run("decision_cache", "worse").await.unwrap();
    let stats = f.integrator.audit().stats();
    assert_eq!(stats.committed, 1);
    assert_eq!(stats.reverted, 1);
}

#[tokio::test]
async fn test_unregistered_component_is_rejected() {
    let f = fixture(ScriptedProposer::fixed("rate:1.0"));
    let err = f.controller.run("planner", "anything").await.unwrap_err();
    assert!(matches!(err, SelfModError::UnknownTarget(_)));
    assert!(f.integrator.tracker().is_empty());
}
