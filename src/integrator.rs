//! # Stage: Integrator
//!
//! ## Responsibility
//! The propose -> sandbox-test -> commit pipeline.  A candidate reaches a
//! capability store only after its test outcome is `Pass`, and the store
//! insert plus the generation that references it land as one durable log
//! record.
//!
//! ## Guarantees
//! - Commit iff pass: nothing but a passing candidate is ever inserted
//! - Idempotent: identical content already active yields `AlreadyPresent`
//!   with no sandbox run and no new generation
//! - Single flight: concurrent runs of the same task share one execution
//! - Cancellation is honoured between steps, never mid-step
//!
//! ## NOT Responsible For
//! - Benchmarking or regression decisions (see [`crate::self_modify`])
//! - The two-attempt reasoning cycle (see [`crate::reflection`])

use crate::artifact::{CandidateArtifact, Fingerprint};
use crate::audit::{AttemptOutcome, AttemptRecord, AuditTrail};
use crate::generation::{ChangeRef, Generation, GenerationDraft, PerformanceSnapshot};
use crate::oracle::{ChangeProposer, ProposalContext, ProposalError, ProposalMode};
use crate::sandbox::{ResourceLimits, SandboxExecutor, TestHarness, TestOutcome};
use crate::store::{Admission, CapabilityEntry, StoreError, StoreKind, UsageStats};
use crate::tracker::{GenerationTracker, TrackerError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OnceCell, OwnedMutexGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// One unit of work for the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub id: String,
    pub description: String,
    pub harness: TestHarness,
    /// Store a passing candidate is committed to.
    pub store: StoreKind,
    /// Live position the candidate competes for, e.g. a tool name.
    pub slot: Option<String>,
    pub tags: BTreeSet<String>,
    pub prior_failure_trace: Option<String>,
    pub target_artifact: Option<CandidateArtifact>,
}

impl TaskContext {
    pub fn new(id: impl Into<String>, description: impl Into<String>, harness: TestHarness) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            harness,
            store: StoreKind::Tools,
            slot: None,
            tags: BTreeSet::new(),
            prior_failure_trace: None,
            target_artifact: None,
        }
    }

    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = store;
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_failure_trace(mut self, trace: impl Into<String>) -> Self {
        self.prior_failure_trace = Some(trace.into());
        self
    }

    pub fn with_target(mut self, target: CandidateArtifact) -> Self {
        self.target_artifact = Some(target);
        self
    }

    /// Identity used to join concurrent runs of the same task.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [self.id.as_str(), self.description.as_str(), self.harness.driver_source.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.store.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn proposal_mode(&self) -> ProposalMode {
        match (self.store, &self.target_artifact) {
            (StoreKind::Policies, _) => ProposalMode::Reflection,
            (StoreKind::Tools, Some(_)) => ProposalMode::SelfModification,
            (StoreKind::Tools, None) => ProposalMode::Capability,
        }
    }

    fn proposal_context(&self) -> ProposalContext {
        ProposalContext::new(self.id.clone(), self.description.clone(), self.proposal_mode())
            .with_failure_trace(self.prior_failure_trace.clone())
            .with_target(self.target_artifact.clone())
    }
}

// ---------------------------------------------------------------------------
// Outcomes and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Propose,
    Execute,
    Commit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Propose => write!(f, "propose"),
            Stage::Execute => write!(f, "execute"),
            Stage::Commit => write!(f, "commit"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Committed { entry: CapabilityEntry, generation: Arc<Generation>, test: TestOutcome },
    AlreadyPresent { entry: CapabilityEntry },
    Rejected { candidate: CandidateArtifact, test: TestOutcome },
    ProposalUnavailable { reason: String },
    Cancelled { stage: Stage },
    /// Store or log refused the commit of a passing candidate.
    Failed { reason: String },
}

impl PipelineOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, PipelineOutcome::Committed { .. })
    }

    /// A proposal or sandbox problem occurred; persistent state is still valid.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PipelineOutcome::Rejected { .. }
                | PipelineOutcome::ProposalUnavailable { .. }
                | PipelineOutcome::Failed { .. }
        )
    }
}

impl std::fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineOutcome::Committed { entry, generation, .. } => {
                write!(f, "committed {} v{} in generation {}", entry.id.short(), entry.version, generation.index)
            }
            PipelineOutcome::AlreadyPresent { entry } => write!(f, "already present as {}", entry.id.short()),
            PipelineOutcome::Rejected { candidate, test } => {
                write!(f, "rejected {}: {}", candidate.fingerprint().short(), test.status)
            }
            PipelineOutcome::ProposalUnavailable { reason } => write!(f, "no proposal: {}", reason),
            PipelineOutcome::Cancelled { stage } => write!(f, "cancelled before {}", stage),
            PipelineOutcome::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("slot '{slot}' changed since the candidate was evaluated")]
    StaleSlot { slot: String },
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation token, checked between pipeline steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// KeyedLocks
// ---------------------------------------------------------------------------

/// Async mutex per key.  Idle keys are pruned on the next acquisition.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(locks.entry(key.to_string()).or_default())
        };
        mutex.lock_owned().await
    }

    /// Keys currently tracked (held or awaited, plus idle ones not yet pruned).
    pub fn len(&self) -> usize {
        match self.locks.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Commit requests
// ---------------------------------------------------------------------------

/// A tested artifact ready to be committed.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub store: StoreKind,
    pub artifact: CandidateArtifact,
    pub slot: Option<String>,
    pub tags: BTreeSet<String>,
    pub confidence: Option<f64>,
    pub rationale: String,
    pub performance: Option<PerformanceSnapshot>,
    /// When set, the commit is refused unless `slot`'s live entry is still
    /// this one.
    pub expected_live: Option<Option<Fingerprint>>,
}

impl CommitRequest {
    pub fn new(store: StoreKind, artifact: CandidateArtifact, rationale: impl Into<String>) -> Self {
        Self {
            store,
            artifact,
            slot: None,
            tags: BTreeSet::new(),
            confidence: None,
            rationale: rationale.into(),
            performance: None,
            expected_live: None,
        }
    }

    pub fn with_slot(mut self, slot: Option<String>) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_performance(mut self, performance: PerformanceSnapshot) -> Self {
        self.performance = Some(performance);
        self
    }

    pub fn expecting_live(mut self, live: Option<Fingerprint>) -> Self {
        self.expected_live = Some(live);
        self
    }
}

#[derive(Debug, Clone)]
pub enum CommitResult {
    Committed { entry: CapabilityEntry, generation: Arc<Generation> },
    AlreadyPresent { entry: CapabilityEntry },
}

// ---------------------------------------------------------------------------
// Integrator
// ---------------------------------------------------------------------------

pub struct Integrator {
    proposer: Arc<dyn ChangeProposer>,
    executor: Arc<dyn SandboxExecutor>,
    tracker: Arc<GenerationTracker>,
    audit: Arc<AuditTrail>,
    limits: ResourceLimits,
    max_commit_retries: u32,
    inflight: Mutex<HashMap<String, Arc<OnceCell<PipelineOutcome>>>>,
    locks: KeyedLocks,
}

impl Integrator {
    pub fn new(
        proposer: Arc<dyn ChangeProposer>,
        executor: Arc<dyn SandboxExecutor>,
        tracker: Arc<GenerationTracker>,
    ) -> Self {
        Self {
            proposer,
            executor,
            tracker,
            audit: Arc::new(AuditTrail::new(1024)),
            limits: ResourceLimits::default(),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            inflight: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditTrail>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_commit_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }

    pub fn proposer(&self) -> &Arc<dyn ChangeProposer> {
        &self.proposer
    }

    pub fn executor(&self) -> &Arc<dyn SandboxExecutor> {
        &self.executor
    }

    pub fn tracker(&self) -> &Arc<GenerationTracker> {
        &self.tracker
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Serialize work on `key` (a component, a content fingerprint).
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<PipelineOutcome>>>> {
        match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // -----------------------------------------------------------------------
    // Pipeline
    // -----------------------------------------------------------------------

    /// Propose, test and (on pass) commit a candidate for `task`.
    ///
    /// Callers arriving while a run for the same task fingerprint is in
    /// flight wait for it and receive its outcome.
    pub async fn run(&self, task: &TaskContext, cancel: &CancelFlag) -> PipelineOutcome {
        let key = task.fingerprint();
        let cell = Arc::clone(self.lock_inflight().entry(key.clone()).or_default());
        let outcome = cell.get_or_init(|| self.run_exclusive(task, cancel)).await.clone();

        let mut inflight = self.lock_inflight();
        if inflight.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            inflight.remove(&key);
        }
        outcome
    }

    async fn run_exclusive(&self, task: &TaskContext, cancel: &CancelFlag) -> PipelineOutcome {
        let outcome = self.pipeline(task, cancel).await;
        self.audit.record(attempt_record(task, &outcome));
        outcome
    }

    async fn pipeline(&self, task: &TaskContext, cancel: &CancelFlag) -> PipelineOutcome {
        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled { stage: Stage::Propose };
        }
        let candidate = match self.proposer.propose(&task.proposal_context()).await {
            Ok(candidate) if candidate.is_blank() => {
                warn!(task = %task.id, "proposer returned an empty artifact");
                return PipelineOutcome::ProposalUnavailable { reason: ProposalError::Empty.to_string() };
            }
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(task = %task.id, error = %e, "no candidate proposed");
                return PipelineOutcome::ProposalUnavailable { reason: e.to_string() };
            }
        };
        let id = candidate.fingerprint();
        let _guard = self.locks.lock(&format!("{}:{}", task.store, id)).await;

        let admission = self.tracker.stores().read(task.store).admit(&candidate);
        match admission {
            Ok(Admission::Active(entry)) => {
                debug!(task = %task.id, id = %id.short(), "candidate already active");
                return PipelineOutcome::AlreadyPresent { entry };
            }
            Ok(Admission::New) | Ok(Admission::Inactive(_)) => {}
            Err(e) => return PipelineOutcome::Failed { reason: e.to_string() },
        }

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled { stage: Stage::Execute };
        }
        let test = self.executor.execute(&candidate, &task.harness, &self.limits).await;
        if !test.status.is_pass() {
            info!(
                task = %task.id,
                id = %id.short(),
                status = %test.status,
                duration_ms = test.duration.as_millis() as u64,
                "candidate rejected"
            );
            return PipelineOutcome::Rejected { candidate, test };
        }

        if cancel.is_cancelled() {
            return PipelineOutcome::Cancelled { stage: Stage::Commit };
        }
        let request = CommitRequest::new(
            task.store,
            candidate,
            format!("task {}: candidate passed {}", task.id, task.harness.name),
        )
        .with_slot(task.slot.clone())
        .with_tags(task.tags.clone());
        match self.commit(request) {
            Ok(CommitResult::Committed { entry, generation }) => {
                PipelineOutcome::Committed { entry, generation, test }
            }
            Ok(CommitResult::AlreadyPresent { entry }) => PipelineOutcome::AlreadyPresent { entry },
            Err(e) => {
                warn!(task = %task.id, error = %e, "commit failed");
                PipelineOutcome::Failed { reason: e.to_string() }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Insert `request.artifact` and append the generation referencing it as
    /// one log record.  A head moved by another writer is retried up to the
    /// configured limit.
    ///
    /// Identical active content is a no-op; identical inactive content is
    /// brought back with a `Reactivate` change.
    pub fn commit(&self, request: CommitRequest) -> Result<CommitResult, IntegrationError> {
        let stores = Arc::clone(self.tracker.stores());
        let generation = self.tracker.append_with_retry(self.max_commit_retries, |_head| -> Result<Option<GenerationDraft>, IntegrationError> {
            let store = stores.read(request.store);
            if let (Some(expected), Some(slot)) = (&request.expected_live, &request.slot) {
                let live = store.live(slot).map(|e| e.id.clone());
                if &live != expected {
                    return Err(IntegrationError::StaleSlot { slot: slot.clone() });
                }
            }
            let draft = GenerationDraft::committed(request.rationale.clone())
                .with_performance(request.performance.clone());
            match store.admit(&request.artifact)? {
                Admission::Active(_) => Ok(None),
                Admission::Inactive(entry) => {
                    let mut draft = draft;
                    if let Some(occupant) = entry.slot.as_deref().and_then(|s| store.live(s)) {
                        draft = draft.with_change(ChangeRef::deactivate(request.store, occupant.id.clone()));
                    }
                    Ok(Some(draft.with_change(ChangeRef::reactivate(request.store, entry.id))))
                }
                Admission::New => {
                    let slot = request.slot.as_deref();
                    let shadows = slot.and_then(|s| store.live(s)).map(|e| e.id.clone());
                    let entry = CapabilityEntry::new(request.artifact.clone(), 0, store.next_version(slot))
                        .with_slot(request.slot.clone())
                        .with_tags(request.tags.clone())
                        .with_confidence(request.confidence);
                    Ok(Some(draft.with_insert(request.store, entry, shadows)))
                }
            }
        })?;

        let id = request.artifact.fingerprint();
        let entry = stores
            .read(request.store)
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntry(id.clone()))?;
        Ok(match generation {
            Some(generation) => CommitResult::Committed { entry, generation },
            None => CommitResult::AlreadyPresent { entry },
        })
    }

    /// Append a `Reverted` generation recording an evaluation that changed
    /// nothing.
    pub fn record_reverted(
        &self,
        rationale: impl Into<String>,
        performance: Option<PerformanceSnapshot>,
    ) -> Result<Arc<Generation>, IntegrationError> {
        self.append_unchanged(GenerationDraft::reverted(rationale, performance))
    }

    /// Append a `Committed` generation with no changes, for an accepted
    /// evaluation whose candidate is already live.
    pub fn record_unchanged(
        &self,
        rationale: impl Into<String>,
        performance: Option<PerformanceSnapshot>,
    ) -> Result<Arc<Generation>, IntegrationError> {
        self.append_unchanged(GenerationDraft::committed(rationale).with_performance(performance))
    }

    fn append_unchanged(&self, draft: GenerationDraft) -> Result<Arc<Generation>, IntegrationError> {
        let mut retries = 0;
        loop {
            match self.tracker.append(draft.clone(), self.tracker.last_index()) {
                Err(TrackerError::ConcurrentModification { .. }) if retries < self.max_commit_retries => {
                    retries += 1;
                }
                other => return Ok(other?),
            }
        }
    }

    /// Reinforce (or weaken) an entry after it was applied.
    pub fn record_usage(
        &self,
        store: StoreKind,
        id: &Fingerprint,
        success: bool,
    ) -> Result<UsageStats, IntegrationError> {
        Ok(self.tracker.stores().write(store).record_usage(id, success)?)
    }
}

fn attempt_record(task: &TaskContext, outcome: &PipelineOutcome) -> AttemptRecord {
    match outcome {
        PipelineOutcome::Committed { entry, generation, .. } => {
            AttemptRecord::new(&task.id, AttemptOutcome::Committed)
                .with_candidate(entry.id.short())
                .with_generation(generation.index)
                .with_detail(format!("version {}", entry.version))
        }
        PipelineOutcome::AlreadyPresent { entry } => {
            AttemptRecord::new(&task.id, AttemptOutcome::AlreadyPresent).with_candidate(entry.id.short())
        }
        PipelineOutcome::Rejected { candidate, test } => AttemptRecord::new(&task.id, AttemptOutcome::Rejected)
            .with_candidate(candidate.fingerprint().short())
            .with_detail(test.failure_trace()),
        PipelineOutcome::ProposalUnavailable { reason } => {
            AttemptRecord::new(&task.id, AttemptOutcome::ProposalUnavailable).with_detail(reason.clone())
        }
        PipelineOutcome::Cancelled { stage } => {
            AttemptRecord::new(&task.id, AttemptOutcome::Cancelled).with_detail(format!("before {}", stage))
        }
        PipelineOutcome::Failed { reason } => {
            AttemptRecord::new(&task.id, AttemptOutcome::Failed).with_detail(reason.clone())
        }
    }
}
