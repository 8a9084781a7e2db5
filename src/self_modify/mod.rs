//! # Stage: Self-Modification Controller
//!
//! ## Responsibility
//! Replace a live behavior-defining artifact (a *component*) only when the
//! replacement does not regress.  The live artifact and the candidate run
//! through the same benchmark suite; the candidate is applied iff
//!
//! - `after.success_rate >= before.success_rate - tolerance`, and
//! - `after.mean_latency_ms <= before.mean_latency_ms * (1 + tolerance)`.
//!
//! With no live artifact yet there is no baseline, and a candidate is applied
//! iff it passes at least one case.
//!
//! ## Guarantees
//! - Regression safety: a reverted proposal leaves the live artifact
//!   byte-identical and appends a `Reverted` generation with both scores
//! - Serialized per component: propose -> evaluate -> decide -> commit runs
//!   under the component's keyed lock
//! - An [`Evaluation`] is single-use and is refused once the live artifact
//!   has moved on
//!
//! ## NOT Responsible For
//! - Combined regressions across components (each component is judged on
//!   its own suite)

use crate::artifact::CandidateArtifact;
use crate::audit::{AttemptOutcome, AttemptRecord};
use crate::generation::{BenchmarkScores, Generation, PerformanceSnapshot};
use crate::integrator::{CommitRequest, CommitResult, IntegrationError, Integrator};
use crate::oracle::{ProposalContext, ProposalError, ProposalMode};
use crate::sandbox::TestHarness;
use crate::store::{CapabilityEntry, StoreKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_TOLERANCE: f64 = 0.05;

/// Slack absorbing float noise in the tolerance comparisons.
const EPSILON: f64 = 1e-9;

// ---------------------------------------------------------------------------
// Benchmark suite
// ---------------------------------------------------------------------------

/// Fixed list of harnesses a component is scored against.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchmarkSuite {
    pub name: String,
    pub cases: Vec<TestHarness>,
}

impl BenchmarkSuite {
    pub fn new(name: impl Into<String>, cases: Vec<TestHarness>) -> Self {
        Self { name: name.into(), cases }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Applied,
    Reverted { reason: String },
}

impl Decision {
    pub fn is_applied(&self) -> bool {
        matches!(self, Decision::Applied)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Applied => write!(f, "applied"),
            Decision::Reverted { reason } => write!(f, "reverted: {}", reason),
        }
    }
}

/// Regression check between two benchmark runs of the same suite.
pub fn decide(before: Option<&BenchmarkScores>, after: &BenchmarkScores, tolerance: f64) -> Decision {
    let Some(before) = before else {
        return if after.success_rate > 0.0 {
            Decision::Applied
        } else {
            Decision::Reverted { reason: "no baseline and no passing case".into() }
        };
    };
    if after.success_rate + EPSILON < before.success_rate - tolerance {
        return Decision::Reverted {
            reason: format!(
                "success rate fell from {:.1}% to {:.1}% (tolerance {:.1}%)",
                before.success_rate * 100.0,
                after.success_rate * 100.0,
                tolerance * 100.0
            ),
        };
    }
    if after.mean_latency_ms > before.mean_latency_ms * (1.0 + tolerance) + EPSILON {
        return Decision::Reverted {
            reason: format!(
                "mean latency rose from {:.1}ms to {:.1}ms (tolerance {:.1}%)",
                before.mean_latency_ms,
                after.mean_latency_ms,
                tolerance * 100.0
            ),
        };
    }
    Decision::Applied
}

// ---------------------------------------------------------------------------
// Evaluation / proposal records
// ---------------------------------------------------------------------------

/// Scores for one candidate against the live artifact it would replace.
/// Consumed by [`SelfModificationController::apply`]; an evaluation is acted on once.
#[derive(Debug)]
pub struct Evaluation {
    target: String,
    live_before: Option<CapabilityEntry>,
    candidate: CandidateArtifact,
    before: Option<BenchmarkScores>,
    after: BenchmarkScores,
    tolerance: f64,
}

impl Evaluation {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn candidate(&self) -> &CandidateArtifact {
        &self.candidate
    }

    pub fn before(&self) -> Option<&BenchmarkScores> {
        self.before.as_ref()
    }

    pub fn after(&self) -> &BenchmarkScores {
        &self.after
    }

    pub fn decision(&self) -> Decision {
        decide(self.before.as_ref(), &self.after, self.tolerance)
    }

    fn snapshot(&self) -> PerformanceSnapshot {
        PerformanceSnapshot {
            component: self.target.clone(),
            before: self.before.clone(),
            after: self.after.clone(),
            tolerance: self.tolerance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SelfModProposal {
    pub target_component: String,
    pub before_artifact: Option<CandidateArtifact>,
    pub after_artifact: CandidateArtifact,
    pub rationale: String,
    pub before: Option<BenchmarkScores>,
    pub after: BenchmarkScores,
    pub decision: Decision,
    /// Records the decision and both scores, whatever the outcome.
    pub generation: Arc<Generation>,
}

#[derive(Debug, thiserror::Error)]
pub enum SelfModError {
    #[error("no benchmark suite registered for component '{0}'")]
    UnknownTarget(String),

    #[error("benchmark suite for '{0}' has no cases")]
    EmptySuite(String),

    #[error(transparent)]
    Proposal(#[from] ProposalError),

    #[error("live artifact of '{target}' changed since evaluation")]
    StaleEvaluation { target: String },

    #[error(transparent)]
    Integration(#[from] IntegrationError),
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct SelfModificationController {
    integrator: Arc<Integrator>,
    suites: HashMap<String, BenchmarkSuite>,
    tolerance: f64,
}

impl SelfModificationController {
    pub fn new(integrator: Arc<Integrator>) -> Self {
        Self { integrator, suites: HashMap::new(), tolerance: DEFAULT_TOLERANCE }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.max(0.0);
        self
    }

    pub fn with_suite(mut self, target: impl Into<String>, suite: BenchmarkSuite) -> Self {
        self.suites.insert(target.into(), suite);
        self
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Registered components, sorted.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = self.suites.keys().map(String::as_str).collect();
        targets.sort_unstable();
        targets
    }

    /// Live artifact of `target`, if any has been applied.
    pub fn live(&self, target: &str) -> Option<CapabilityEntry> {
        self.integrator.tracker().stores().read(StoreKind::Tools).live(target).cloned()
    }

    fn suite(&self, target: &str) -> Result<&BenchmarkSuite, SelfModError> {
        let suite = self.suites.get(target).ok_or_else(|| SelfModError::UnknownTarget(target.to_string()))?;
        if suite.is_empty() {
            return Err(SelfModError::EmptySuite(target.to_string()));
        }
        Ok(suite)
    }

    /// Ask the proposer for a replacement of `target`'s live artifact.
    pub async fn propose(&self, target: &str, rationale: &str) -> Result<CandidateArtifact, SelfModError> {
        self.suite(target)?;
        let ctx = ProposalContext::new(target, rationale, ProposalMode::SelfModification)
            .with_target(self.live(target).map(|e| e.artifact));
        let candidate = self.integrator.proposer().propose(&ctx).await?;
        if candidate.is_blank() {
            return Err(ProposalError::Empty.into());
        }
        Ok(candidate)
    }

    /// Run `artifact` through every case of `suite`, sequentially.
    pub async fn benchmark(&self, artifact: &CandidateArtifact, suite: &BenchmarkSuite) -> BenchmarkScores {
        let executor = self.integrator.executor();
        let limits = self.integrator.limits();
        let mut passes = 0u32;
        let mut total_ms = 0.0;
        for case in &suite.cases {
            let outcome = executor.execute(artifact, case, limits).await;
            if outcome.status.is_pass() {
                passes += 1;
            }
            total_ms += outcome.duration.as_secs_f64() * 1000.0;
        }
        let runs = u32::try_from(suite.cases.len()).unwrap_or(u32::MAX);
        if runs == 0 {
            return BenchmarkScores { success_rate: 0.0, mean_latency_ms: 0.0, runs: 0 };
        }
        BenchmarkScores {
            success_rate: f64::from(passes) / f64::from(runs),
            mean_latency_ms: total_ms / f64::from(runs),
            runs,
        }
    }

    /// Score the live artifact and `candidate` on `target`'s suite.
    pub async fn evaluate(&self, target: &str, candidate: CandidateArtifact) -> Result<Evaluation, SelfModError> {
        let suite = self.suite(target)?;
        let live_before = self.live(target);
        let before = match &live_before {
            Some(entry) => Some(self.benchmark(&entry.artifact, suite).await),
            None => None,
        };
        let after = self.benchmark(&candidate, suite).await;
        info!(
            component = target,
            suite = %suite.name,
            before = %before.as_ref().map(|b| b.to_string()).unwrap_or_else(|| "none".into()),
            after = %after,
            "candidate benchmarked"
        );
        Ok(Evaluation {
            target: target.to_string(),
            live_before,
            candidate,
            before,
            after,
            tolerance: self.tolerance,
        })
    }

    /// Act on an evaluation: commit the candidate when it does not regress,
    /// otherwise record a `Reverted` generation and leave the live artifact
    /// alone.
    pub fn apply(&self, evaluation: Evaluation, rationale: &str) -> Result<SelfModProposal, SelfModError> {
        let live_id = self.live(&evaluation.target).map(|e| e.id);
        let before_id = evaluation.live_before.as_ref().map(|e| e.id.clone());
        if live_id != before_id {
            return Err(SelfModError::StaleEvaluation { target: evaluation.target });
        }

        let decision = evaluation.decision();
        let snapshot = evaluation.snapshot();
        let generation = match &decision {
            Decision::Applied => {
                let request = CommitRequest::new(
                    StoreKind::Tools,
                    evaluation.candidate.clone(),
                    format!("self-modify {}: {}", evaluation.target, rationale),
                )
                .with_slot(Some(evaluation.target.clone()))
                .with_performance(snapshot.clone())
                .expecting_live(before_id);
                match self.integrator.commit(request) {
                    Ok(CommitResult::Committed { generation, .. }) => generation,
                    Ok(CommitResult::AlreadyPresent { .. }) => self.integrator.record_unchanged(
                        format!("self-modify {}: candidate already live", evaluation.target),
                        Some(snapshot),
                    )?,
                    Err(IntegrationError::StaleSlot { .. }) => {
                        return Err(SelfModError::StaleEvaluation { target: evaluation.target })
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Decision::Reverted { reason } => {
                warn!(component = %evaluation.target, reason = %reason, "self-modification reverted");
                self.integrator.record_reverted(
                    format!("self-modify {} reverted: {}", evaluation.target, reason),
                    Some(snapshot),
                )?
            }
        };

        let record = AttemptRecord::new(
            &evaluation.target,
            if decision.is_applied() { AttemptOutcome::Committed } else { AttemptOutcome::Reverted },
        )
        .with_candidate(evaluation.candidate.fingerprint().short())
        .with_detail(decision.to_string())
        .with_generation(generation.index);
        self.integrator.audit().record(record);

        Ok(SelfModProposal {
            target_component: evaluation.target,
            before_artifact: evaluation.live_before.map(|e| e.artifact),
            after_artifact: evaluation.candidate,
            rationale: rationale.to_string(),
            before: evaluation.before,
            after: evaluation.after,
            decision,
            generation,
        })
    }

    /// Propose, evaluate, decide and commit under `target`'s lock.
    pub async fn run(&self, target: &str, rationale: &str) -> Result<SelfModProposal, SelfModError> {
        let _guard = self.integrator.lock_key(&format!("self-modify:{}", target)).await;
        let candidate = match self.propose(target, rationale).await {
            Ok(candidate) => candidate,
            Err(e) => {
                self.integrator.audit().record(
                    AttemptRecord::new(target, AttemptOutcome::ProposalUnavailable).with_detail(e.to_string()),
                );
                return Err(e);
            }
        };
        let evaluation = self.evaluate(target, candidate).await?;
        let proposal = self.apply(evaluation, rationale)?;
        info!(
            component = target,
            decision = %proposal.decision,
            generation = proposal.generation.index,
            "self-modification decided"
        );
        Ok(proposal)
    }
}
