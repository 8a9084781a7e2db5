//! # Stage: Reflection Cycle
//!
//! ## Responsibility
//! The two-attempt rule for learning reasoning principles:
//!
//! ```text
//! Attempting1 --success--> Done(SolvedFirstTry)
//! Attempting1 --failure--> Reflecting
//! Reflecting  --no candidate--> ReflectionUnavailable
//! Reflecting  --candidate--> Attempting2
//! Attempting2 --failure--> Done(Unsolved)          candidate discarded
//! Attempting2 --success--> Internalizing
//! Internalizing --commit--> Done(SolvedWithReflection)
//! ```
//!
//! [`CycleState::advance`] is the pure transition function;
//! [`ReflectionCycle::run`] performs the side effects for each state.
//!
//! ## Guarantees
//! - A principle is committed iff the first attempt failed and the second
//!   attempt, given the candidate principle, succeeded
//! - Principles bypass the sandbox; the second attempt is their test
//!
//! ## NOT Responsible For
//! - Solving tasks or judging answers (external agent and judge)

use crate::artifact::{ArtifactKind, CandidateArtifact};
use crate::audit::{AttemptOutcome, AttemptRecord};
use crate::generation::Generation;
use crate::integrator::{CommitRequest, CommitResult, Integrator};
use crate::oracle::{
    AttemptTrace, FeatureExtractor, Guidance, KeywordFeatures, ProposalContext, ProposalError,
    ProposalMode, ReasoningTask, TaskAgent, TaskJudge, Verdict,
};
use crate::store::{AmbientContext, CapabilityEntry, StoreKind};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const DEFAULT_TOP_K: usize = 5;

// ---------------------------------------------------------------------------
// States and events
// ---------------------------------------------------------------------------

/// A principle that made it into the policy store.
#[derive(Debug, Clone, PartialEq)]
pub struct Internalized {
    pub principle: CapabilityEntry,
    /// `None` when the identical principle was already active.
    pub generation: Option<Arc<Generation>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    SolvedFirstTry { trace: AttemptTrace },
    SolvedWithReflection { internalized: Internalized, trace: AttemptTrace },
    Unsolved { discarded: CandidateArtifact, trace: AttemptTrace },
    ReflectionUnavailable { first: AttemptTrace, reason: String },
    InternalizationFailed { candidate: CandidateArtifact, reason: String },
}

impl CycleOutcome {
    pub fn is_solved(&self) -> bool {
        matches!(self, CycleOutcome::SolvedFirstTry { .. } | CycleOutcome::SolvedWithReflection { .. })
    }

    pub fn learned(&self) -> Option<&CapabilityEntry> {
        match self {
            CycleOutcome::SolvedWithReflection { internalized, .. } => Some(&internalized.principle),
            _ => None,
        }
    }
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleOutcome::SolvedFirstTry { .. } => write!(f, "solved on first attempt"),
            CycleOutcome::SolvedWithReflection { internalized, .. } => {
                write!(f, "solved after reflection, learned {}", internalized.principle.id.short())
            }
            CycleOutcome::Unsolved { .. } => write!(f, "unsolved, candidate discarded"),
            CycleOutcome::ReflectionUnavailable { reason, .. } => write!(f, "no reflection: {}", reason),
            CycleOutcome::InternalizationFailed { reason, .. } => {
                write!(f, "principle not stored: {}", reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleState {
    Attempting1,
    Reflecting { first: AttemptTrace, verdict: Verdict },
    Attempting2 { first: AttemptTrace, candidate: CandidateArtifact },
    Internalizing { candidate: CandidateArtifact, second: AttemptTrace, verdict: Verdict },
    Done(CycleOutcome),
    ReflectionUnavailable { first: AttemptTrace, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleEvent {
    FirstAttempt { trace: AttemptTrace, verdict: Verdict },
    Reflected(Result<CandidateArtifact, String>),
    SecondAttempt { trace: AttemptTrace, verdict: Verdict },
    Internalized(Result<Internalized, String>),
}

impl CycleEvent {
    fn name(&self) -> &'static str {
        match self {
            CycleEvent::FirstAttempt { .. } => "first_attempt",
            CycleEvent::Reflected(_) => "reflected",
            CycleEvent::SecondAttempt { .. } => "second_attempt",
            CycleEvent::Internalized(_) => "internalized",
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("event '{event}' is not valid in state '{state}'")]
pub struct InvalidTransition {
    pub state: &'static str,
    pub event: &'static str,
}

impl CycleState {
    pub fn name(&self) -> &'static str {
        match self {
            CycleState::Attempting1 => "attempting_1",
            CycleState::Reflecting { .. } => "reflecting",
            CycleState::Attempting2 { .. } => "attempting_2",
            CycleState::Internalizing { .. } => "internalizing",
            CycleState::Done(_) => "done",
            CycleState::ReflectionUnavailable { .. } => "reflection_unavailable",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CycleState::Done(_) | CycleState::ReflectionUnavailable { .. })
    }

    pub fn advance(self, event: CycleEvent) -> Result<CycleState, InvalidTransition> {
        let invalid = InvalidTransition { state: self.name(), event: event.name() };
        Ok(match (self, event) {
            (CycleState::Attempting1, CycleEvent::FirstAttempt { trace, verdict }) => {
                if verdict.success {
                    CycleState::Done(CycleOutcome::SolvedFirstTry { trace })
                } else {
                    CycleState::Reflecting { first: trace, verdict }
                }
            }
            (CycleState::Reflecting { first, .. }, CycleEvent::Reflected(result)) => match result {
                Ok(candidate) => CycleState::Attempting2 { first, candidate },
                Err(reason) => CycleState::ReflectionUnavailable { first, reason },
            },
            (CycleState::Attempting2 { candidate, .. }, CycleEvent::SecondAttempt { trace, verdict }) => {
                if verdict.success {
                    CycleState::Internalizing { candidate, second: trace, verdict }
                } else {
                    CycleState::Done(CycleOutcome::Unsolved { discarded: candidate, trace })
                }
            }
            (CycleState::Internalizing { candidate, second, .. }, CycleEvent::Internalized(result)) => {
                match result {
                    Ok(internalized) => {
                        CycleState::Done(CycleOutcome::SolvedWithReflection { internalized, trace: second })
                    }
                    Err(reason) => CycleState::Done(CycleOutcome::InternalizationFailed { candidate, reason }),
                }
            }
            _ => return Err(invalid),
        })
    }
}

// ---------------------------------------------------------------------------
// ReflectionCycle
// ---------------------------------------------------------------------------

pub struct ReflectionCycle {
    agent: Arc<dyn TaskAgent>,
    judge: Arc<dyn TaskJudge>,
    integrator: Arc<Integrator>,
    features: Arc<dyn FeatureExtractor>,
    top_k: usize,
}

impl ReflectionCycle {
    pub fn new(agent: Arc<dyn TaskAgent>, judge: Arc<dyn TaskJudge>, integrator: Arc<Integrator>) -> Self {
        Self { agent, judge, integrator, features: Arc::new(KeywordFeatures::default()), top_k: DEFAULT_TOP_K }
    }

    pub fn with_features(mut self, features: Arc<dyn FeatureExtractor>) -> Self {
        self.features = features;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Top-k active principles relevant to `task`.
    pub fn guidance(&self, task: &ReasoningTask, ambient: &AmbientContext) -> Guidance {
        let tags = self.features.features(task);
        let principles = self
            .integrator
            .tracker()
            .stores()
            .read(StoreKind::Policies)
            .retrieve_by_relevance(&tags, self.top_k, ambient)
            .iter()
            .filter_map(CapabilityEntry::as_principle)
            .collect();
        Guidance { principles, candidate: None }
    }

    async fn attempt(&self, task: &ReasoningTask, guidance: &Guidance) -> (AttemptTrace, Verdict) {
        let trace = self.agent.attempt(task, guidance).await;
        let verdict = self.judge.evaluate(task, &trace);
        for principle in &guidance.principles {
            if let Err(e) = self.integrator.record_usage(StoreKind::Policies, &principle.id, verdict.success) {
                debug!(principle = %principle.id.short(), error = %e, "usage not recorded");
            }
        }
        (trace, verdict)
    }

    async fn reflect(&self, task: &ReasoningTask, first: &AttemptTrace, verdict: &Verdict) -> Result<CandidateArtifact, String> {
        let ctx = ProposalContext::new(task.id.clone(), task.description.clone(), ProposalMode::Reflection)
            .with_failure_trace(Some(first.render(verdict)));
        match self.integrator.proposer().propose(&ctx).await {
            Ok(candidate) if candidate.is_blank() => Err(ProposalError::Empty.to_string()),
            Ok(candidate) if candidate.kind != ArtifactKind::Principle => {
                Err(format!("expected a principle, got a {} artifact", candidate.kind))
            }
            Ok(candidate) => Ok(candidate),
            Err(e) => Err(e.to_string()),
        }
    }

    fn internalize(
        &self,
        task: &ReasoningTask,
        candidate: &CandidateArtifact,
        verdict: &Verdict,
    ) -> Result<Internalized, String> {
        let request = CommitRequest::new(
            StoreKind::Policies,
            candidate.clone(),
            format!("reflection on task {}", task.id),
        )
        .with_tags(self.features.features(task))
        .with_confidence(verdict.score);
        match self.integrator.commit(request) {
            Ok(CommitResult::Committed { entry, generation }) => {
                Ok(Internalized { principle: entry, generation: Some(generation) })
            }
            Ok(CommitResult::AlreadyPresent { entry }) => Ok(Internalized { principle: entry, generation: None }),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Drive one task through the two-attempt cycle.
    pub async fn run(&self, task: &ReasoningTask, ambient: &AmbientContext) -> Result<CycleOutcome, InvalidTransition> {
        let guidance = self.guidance(task, ambient);
        let mut state = CycleState::Attempting1;
        let outcome = loop {
            let event = match &state {
                CycleState::Done(outcome) => break outcome.clone(),
                CycleState::ReflectionUnavailable { first, reason } => {
                    break CycleOutcome::ReflectionUnavailable { first: first.clone(), reason: reason.clone() }
                }
                CycleState::Attempting1 => {
                    let (trace, verdict) = self.attempt(task, &guidance).await;
                    CycleEvent::FirstAttempt { trace, verdict }
                }
                CycleState::Reflecting { first, verdict } => {
                    CycleEvent::Reflected(self.reflect(task, first, verdict).await)
                }
                CycleState::Attempting2 { candidate, .. } => {
                    let with_candidate = Guidance {
                        principles: guidance.principles.clone(),
                        candidate: Some(candidate.content.clone()),
                    };
                    let (trace, verdict) = self.attempt(task, &with_candidate).await;
                    CycleEvent::SecondAttempt { trace, verdict }
                }
                CycleState::Internalizing { candidate, verdict, .. } => {
                    CycleEvent::Internalized(self.internalize(task, candidate, verdict))
                }
            };
            debug!(task = %task.id, state = state.name(), event = event.name(), "reflection step");
            state = state.advance(event)?;
        };

        self.audit(task, &outcome);
        match &outcome {
            CycleOutcome::InternalizationFailed { reason, .. } => {
                warn!(task = %task.id, reason = %reason, "principle could not be stored")
            }
            other => info!(task = %task.id, outcome = %other, "reflection cycle finished"),
        }
        Ok(outcome)
    }

    fn audit(&self, task: &ReasoningTask, outcome: &CycleOutcome) {
        let record = match outcome {
            CycleOutcome::SolvedFirstTry { .. } => return,
            CycleOutcome::SolvedWithReflection { internalized, .. } => {
                let mut record = AttemptRecord::new(&task.id, AttemptOutcome::Committed)
                    .with_candidate(internalized.principle.id.short());
                if let Some(g) = &internalized.generation {
                    record = record.with_generation(g.index);
                }
                record
            }
            CycleOutcome::Unsolved { discarded, trace } => AttemptRecord::new(&task.id, AttemptOutcome::Rejected)
                .with_candidate(discarded.fingerprint().short())
                .with_detail(format!("second attempt answered '{}'", trace.answer)),
            CycleOutcome::ReflectionUnavailable { reason, .. } => {
                AttemptRecord::new(&task.id, AttemptOutcome::ProposalUnavailable).with_detail(reason.clone())
            }
            CycleOutcome::InternalizationFailed { candidate, reason } => {
                AttemptRecord::new(&task.id, AttemptOutcome::Failed)
                    .with_candidate(candidate.fingerprint().short())
                    .with_detail(reason.clone())
            }
        };
        self.integrator.audit().record(record);
    }
}
