//! # Stage: Generation Tracker
//!
//! ## Responsibility
//! Linear, append-only history of generations.  Every change to the
//! capability stores goes through [`GenerationTracker::append`], which
//! writes the log record, applies the change to the stores and publishes the
//! generation, in that order, under a single writer lock.
//!
//! Rollback never rewrites history: it appends a compensating generation
//! that restores the active set as it stood right after the target.
//!
//! ## Guarantees
//! - Gapless: indices start at 0 and increase by exactly one
//! - Optimistic concurrency: an append naming a stale parent fails with
//!   [`TrackerError::ConcurrentModification`]
//! - Lock-free reads: [`GenerationTracker::history`] iterates an immutable
//!   snapshot and never waits for a writer
//! - Crash-consistent: the log append is the commit point; the stores are
//!   only touched after it succeeds
//!
//! ## NOT Responsible For
//! - Testing candidates or deciding what to commit (that is the integrator)

use crate::artifact::{now_ms, Fingerprint};
use crate::generation::{ChangeOp, ChangeRef, Generation, GenerationDraft};
use crate::ledger::{AppendFault, GenerationLog, LedgerError, LogRecord};
use crate::store::{Admission, CapabilityEntry, StoreError, StoreKind, Stores};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("concurrent modification: expected parent {expected:?}, head is {actual:?}")]
    ConcurrentModification { expected: Option<u64>, actual: Option<u64> },

    #[error("unknown generation {0}")]
    UnknownGeneration(u64),

    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("replaying generation {index}: {reason}")]
    Replay { index: u64, reason: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TrackerError {
    /// The on-disk history cannot be trusted.
    pub fn is_corrupted_log(&self) -> bool {
        match self {
            TrackerError::Ledger(e) => e.is_corrupted(),
            TrackerError::Replay { .. } => true,
            _ => false,
        }
    }
}

type Snapshot = Arc<Vec<Arc<Generation>>>;

// ---------------------------------------------------------------------------
// History iterator
// ---------------------------------------------------------------------------

/// Oldest-first iterator over the generations published when it was created.
/// Cloning or [`History::restart`] starts over without touching the tracker.
#[derive(Clone)]
pub struct History {
    snapshot: Snapshot,
    next: usize,
}

impl History {
    pub fn restart(&mut self) {
        self.next = 0;
    }

    /// Generations in the snapshot, regardless of iteration progress.
    pub fn total(&self) -> usize {
        self.snapshot.len()
    }
}

impl Iterator for History {
    type Item = Arc<Generation>;

    fn next(&mut self) -> Option<Self::Item> {
        let generation = self.snapshot.get(self.next)?.clone();
        self.next += 1;
        Some(generation)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.snapshot.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

// ---------------------------------------------------------------------------
// GenerationTracker
// ---------------------------------------------------------------------------

pub struct GenerationTracker {
    writer: Mutex<GenerationLog>,
    published: RwLock<Snapshot>,
    stores: Arc<Stores>,
    log_path: PathBuf,
}

impl GenerationTracker {
    /// Open the log at `path` and rebuild `stores` by replaying it.
    ///
    /// # Errors
    ///
    /// Corruption surfaces as a [`TrackerError`] whose
    /// [`is_corrupted_log`](TrackerError::is_corrupted_log) is true.
    pub fn open(path: impl AsRef<Path>, sync: bool, stores: Arc<Stores>) -> Result<Self, TrackerError> {
        let (log, records) = GenerationLog::open(path.as_ref(), sync)?;
        let mut generations = Vec::with_capacity(records.len());
        for record in records {
            let index = record.generation.index;
            apply_record(&stores, &record.generation, record.entries)
                .map_err(|e| TrackerError::Replay { index, reason: e.to_string() })?;
            generations.push(Arc::new(record.generation));
        }
        info!(generations = generations.len(), "generation history replayed");
        Ok(Self {
            writer: Mutex::new(log),
            published: RwLock::new(Arc::new(generations)),
            stores,
            log_path: path.as_ref().to_path_buf(),
        })
    }

    pub fn stores(&self) -> &Arc<Stores> {
        &self.stores
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    fn snapshot(&self) -> Snapshot {
        match self.published.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, GenerationLog> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn last_index(&self) -> Option<u64> {
        self.snapshot().last().map(|g| g.index)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn get(&self, index: u64) -> Option<Arc<Generation>> {
        usize::try_from(index).ok().and_then(|i| self.snapshot().get(i).cloned())
    }

    pub fn history(&self) -> History {
        History { snapshot: self.snapshot(), next: 0 }
    }

    /// Arm a one-shot write failure on the underlying log.
    pub fn inject_fault(&self, fault: AppendFault) {
        self.lock_writer().inject_fault(fault);
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Append `draft` as the next generation, provided the head is still
    /// `expected_parent`.
    pub fn append(
        &self,
        draft: GenerationDraft,
        expected_parent: Option<u64>,
    ) -> Result<Arc<Generation>, TrackerError> {
        let mut log = self.lock_writer();
        self.append_locked(&mut log, draft, expected_parent)
    }

    /// Build-and-append loop.  `build` sees the current head and returns the
    /// draft to append, or `None` when there is nothing to commit.  A head
    /// that moves between build and append triggers a rebuild, at most
    /// `max_retries` times.
    pub fn append_with_retry<E, F>(&self, max_retries: u32, mut build: F) -> Result<Option<Arc<Generation>>, E>
    where
        E: From<TrackerError>,
        F: FnMut(Option<u64>) -> Result<Option<GenerationDraft>, E>,
    {
        let mut retries = 0;
        loop {
            let head = self.last_index();
            let Some(draft) = build(head)? else {
                return Ok(None);
            };
            match self.append(draft, head) {
                Ok(generation) => return Ok(Some(generation)),
                Err(TrackerError::ConcurrentModification { .. }) if retries < max_retries => {
                    retries += 1;
                    debug!(retries, "generation head moved; rebuilding");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn append_locked(
        &self,
        log: &mut GenerationLog,
        draft: GenerationDraft,
        expected_parent: Option<u64>,
    ) -> Result<Arc<Generation>, TrackerError> {
        let head = self.last_index();
        if head != expected_parent {
            return Err(TrackerError::ConcurrentModification { expected: expected_parent, actual: head });
        }
        self.check_draft(&draft)?;

        let index = head.map_or(0, |h| h + 1);
        let GenerationDraft { changes, mut entries, rationale, outcome, performance, rollback_of } = draft;
        for entry in &mut entries {
            entry.source_generation = index;
        }
        let record = LogRecord {
            generation: Generation {
                index,
                parent_index: head,
                timestamp_ms: now_ms(),
                changes,
                rationale,
                outcome,
                performance,
                rollback_of,
            },
            entries,
        };

        log.append(&record)?;

        let LogRecord { generation, entries } = record;
        if let Err(e) = apply_record(&self.stores, &generation, entries) {
            // check_draft ran under the same lock, so this is a bug.
            error!(generation = index, error = %e, "durable generation failed to apply");
        }
        let generation = Arc::new(generation);
        self.publish(Arc::clone(&generation));
        info!(
            generation = index,
            outcome = %generation.outcome,
            changes = generation.changes.len(),
            rationale = %generation.rationale,
            "generation appended"
        );
        Ok(generation)
    }

    fn publish(&self, generation: Arc<Generation>) {
        let mut guard = match self.published.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::make_mut(&mut *guard).push(generation);
    }

    /// Reject drafts that could not be applied in full.
    fn check_draft(&self, draft: &GenerationDraft) -> Result<(), TrackerError> {
        let mut pending: BTreeSet<(StoreKind, Fingerprint)> = BTreeSet::new();
        for change in &draft.changes {
            let key = (change.store, change.id.clone());
            match &change.op {
                ChangeOp::Insert { .. } => {
                    let body = draft.entries.iter().find(|e| e.id == change.id).ok_or_else(|| {
                        TrackerError::InvalidChange(format!("insert of {} has no body", change.id.short()))
                    })?;
                    match self.stores.read(change.store).admit(&body.artifact)? {
                        Admission::New => {}
                        _ => {
                            return Err(TrackerError::InvalidChange(format!(
                                "{} already stored",
                                change.id.short()
                            )))
                        }
                    }
                    if !pending.insert(key) {
                        return Err(TrackerError::InvalidChange(format!(
                            "{} inserted twice",
                            change.id.short()
                        )));
                    }
                }
                ChangeOp::Deactivate | ChangeOp::Reactivate => {
                    if !pending.contains(&key) && !self.stores.read(change.store).contains(&change.id) {
                        return Err(StoreError::UnknownEntry(change.id.clone()).into());
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rollback
    // -----------------------------------------------------------------------

    /// Append a compensating generation restoring the active set as it was
    /// immediately after generation `to_index`.  Always appends, even when
    /// nothing differs.
    pub fn rollback(&self, to_index: u64) -> Result<Arc<Generation>, TrackerError> {
        let mut log = self.lock_writer();
        let history = self.snapshot();
        let head = history.last().map(|g| g.index);
        if head.map_or(true, |h| to_index > h) {
            return Err(TrackerError::UnknownGeneration(to_index));
        }

        let through = usize::try_from(to_index).map_or(history.len(), |i| i + 1);
        let target = active_flags(history.iter().take(through));
        let current = active_flags(history.iter());

        let mut draft = GenerationDraft::committed(format!("rollback to generation {}", to_index))
            .with_rollback_of(to_index);
        // Deactivations first so slots are free before earlier occupants return.
        for ((store, id), active) in &current {
            let wanted = target.get(&(*store, id.clone())).copied().unwrap_or(false);
            if *active && !wanted {
                draft = draft.with_change(ChangeRef::deactivate(*store, id.clone()));
            }
        }
        for ((store, id), wanted) in &target {
            let active = current.get(&(*store, id.clone())).copied().unwrap_or(false);
            if *wanted && !active {
                draft = draft.with_change(ChangeRef::reactivate(*store, id.clone()));
            }
        }

        let generation = self.append_locked(&mut log, draft, head)?;
        info!(
            to = to_index,
            generation = generation.index,
            changes = generation.changes.len(),
            "rolled back"
        );
        Ok(generation)
    }
}

/// Active flag of every entry touched by `generations`, replayed in order.
fn active_flags<'a>(
    generations: impl Iterator<Item = &'a Arc<Generation>>,
) -> BTreeMap<(StoreKind, Fingerprint), bool> {
    let mut flags = BTreeMap::new();
    for generation in generations {
        for change in &generation.changes {
            match &change.op {
                ChangeOp::Insert { shadows } => {
                    flags.insert((change.store, change.id.clone()), true);
                    if let Some(old) = shadows {
                        flags.insert((change.store, old.clone()), false);
                    }
                }
                ChangeOp::Deactivate => {
                    flags.insert((change.store, change.id.clone()), false);
                }
                ChangeOp::Reactivate => {
                    flags.insert((change.store, change.id.clone()), true);
                }
            }
        }
    }
    flags
}

/// Apply one generation's changes, in order, to the stores.
fn apply_record(
    stores: &Stores,
    generation: &Generation,
    entries: Vec<CapabilityEntry>,
) -> Result<(), StoreError> {
    let mut bodies: BTreeMap<Fingerprint, CapabilityEntry> =
        entries.into_iter().map(|e| (e.id.clone(), e)).collect();
    for change in &generation.changes {
        let mut store = stores.write(change.store);
        match &change.op {
            ChangeOp::Insert { shadows } => {
                let body = bodies
                    .remove(&change.id)
                    .ok_or_else(|| StoreError::UnknownEntry(change.id.clone()))?;
                store.add(body)?;
                if let Some(old) = shadows {
                    store.deactivate(old)?;
                }
            }
            ChangeOp::Deactivate => {
                store.deactivate(&change.id)?;
            }
            ChangeOp::Reactivate => {
                store.reactivate(&change.id)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::CandidateArtifact;
    use crate::generation::GenerationOutcome;
    use crate::ledger::LOG_FILE;

    fn open(dir: &tempfile::TempDir) -> GenerationTracker {
        GenerationTracker::open(dir.path().join(LOG_FILE), false, Arc::new(Stores::new())).unwrap()
    }

    fn insert_draft(tracker: &GenerationTracker, content: &str, slot: Option<&str>) -> GenerationDraft {
        let store = tracker.stores().read(StoreKind::Tools);
        let entry = CapabilityEntry::new(CandidateArtifact::code(content, "t"), 0, store.next_version(slot))
            .with_slot(slot.map(String::from));
        let shadows = slot.and_then(|s| store.live(s)).map(|e| e.id.clone());
        GenerationDraft::committed(format!("add {}", content)).with_insert(StoreKind::Tools, entry, shadows)
    }

    fn commit(tracker: &GenerationTracker, content: &str, slot: Option<&str>) -> Arc<Generation> {
        let draft = insert_draft(tracker, content, slot);
        tracker.append(draft, tracker.last_index()).unwrap()
    }

    fn active(tracker: &GenerationTracker) -> BTreeSet<String> {
        tracker
            .stores()
            .read(StoreKind::Tools)
            .active_entries()
            .into_iter()
            .map(|e| e.artifact.content.clone())
            .collect()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // append
    // -----------------------------------------------------------------------

    #[test]
    fn test_first_generation_is_zero_without_parent() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        let g = commit(&tracker, "a", None);
        assert_eq!(g.index, 0);
        assert_eq!(g.parent_index, None);
        assert_eq!(tracker.last_index(), Some(0));
    }

    #[test]
    fn test_indices_are_gapless() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        for content in ["a", "b", "c"] {
            commit(&tracker, content, None);
        }
        let indices: Vec<u64> = tracker.history().map(|g| g.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        let parents: Vec<Option<u64>> = tracker.history().map(|g| g.parent_index).collect();
        assert_eq!(parents, vec![None, Some(0), Some(1)]);
    }

    #[test]
    fn test_stale_parent_is_concurrent_modification() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        let draft = insert_draft(&tracker, "b", None);
        let err = tracker.append(draft, None).unwrap_err();
        assert!(matches!(
            err,
            TrackerError::ConcurrentModification { expected: None, actual: Some(0) }
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_entry_source_generation_is_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        commit(&tracker, "b", None);
        let store = tracker.stores().read(StoreKind::Tools);
        let b = store.get(&CandidateArtifact::code("b", "t").fingerprint()).unwrap();
        assert_eq!(b.source_generation, 1);
    }

    #[test]
    fn test_duplicate_insert_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        let entry = CapabilityEntry::new(CandidateArtifact::code("a", "t"), 0, 1);
        let draft = GenerationDraft::committed("again").with_insert(StoreKind::Tools, entry, None);
        assert!(matches!(
            tracker.append(draft, Some(0)),
            Err(TrackerError::InvalidChange(_))
        ));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_deactivate_unknown_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        let ghost = CandidateArtifact::code("ghost", "t").fingerprint();
        let draft = GenerationDraft::committed("x").with_change(ChangeRef::deactivate(StoreKind::Tools, ghost));
        assert!(matches!(tracker.append(draft, None), Err(TrackerError::Store(_))));
    }

    #[test]
    fn test_reverted_generation_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        let g = tracker.append(GenerationDraft::reverted("regressed", None), Some(0)).unwrap();
        assert_eq!(g.outcome, GenerationOutcome::Reverted);
        assert_eq!(active(&tracker), set(&["a"]));
    }

    // -----------------------------------------------------------------------
    // append_with_retry
    // -----------------------------------------------------------------------

    #[test]
    fn test_retry_rebuilds_after_racing_writer() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        let mut builds = 0;
        let result: Result<_, TrackerError> = tracker.append_with_retry(3, |_head| {
            builds += 1;
            if builds == 1 {
                commit(&tracker, "racer", None);
            }
            Ok(Some(insert_draft(&tracker, "mine", None)))
        });
        let g = result.unwrap().unwrap();
        assert_eq!(builds, 2);
        assert_eq!(g.index, 1);
        assert_eq!(active(&tracker), set(&["racer", "mine"]));
    }

    #[test]
    fn test_retry_gives_up_after_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        let mut builds = 0;
        let result: Result<_, TrackerError> = tracker.append_with_retry(3, |_head| {
            builds += 1;
            commit(&tracker, &format!("racer-{}", builds), None);
            Ok(Some(GenerationDraft::committed("never lands")))
        });
        assert!(matches!(result, Err(TrackerError::ConcurrentModification { .. })));
        assert_eq!(builds, 4);
    }

    #[test]
    fn test_retry_with_nothing_to_commit() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        let result: Result<_, TrackerError> = tracker.append_with_retry(3, |_| Ok(None));
        assert!(result.unwrap().is_none());
        assert!(tracker.is_empty());
    }

    // -----------------------------------------------------------------------
    // history
    // -----------------------------------------------------------------------

    #[test]
    fn test_history_is_a_stable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        let mut history = tracker.history();
        commit(&tracker, "b", None);
        assert_eq!(history.total(), 1);
        assert_eq!(history.by_ref().count(), 1);
        history.restart();
        assert_eq!(history.count(), 1);
        assert_eq!(tracker.history().count(), 2);
    }

    // -----------------------------------------------------------------------
    // rollback
    // -----------------------------------------------------------------------

    #[test]
    fn test_rollback_restores_active_set() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a1", Some("csv"));
        commit(&tracker, "a2", Some("csv"));
        commit(&tracker, "helper", None);
        assert_eq!(active(&tracker), set(&["a2", "helper"]));

        let g = tracker.rollback(0).unwrap();
        assert_eq!(g.index, 3);
        assert_eq!(g.rollback_of, Some(0));
        assert_eq!(active(&tracker), set(&["a1"]));
        let store = tracker.stores().read(StoreKind::Tools);
        assert_eq!(store.live("csv").unwrap().artifact.content, "a1");
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_rollback_of_a_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a1", Some("csv"));
        commit(&tracker, "a2", Some("csv"));
        tracker.rollback(0).unwrap();
        tracker.rollback(1).unwrap();
        assert_eq!(active(&tracker), set(&["a2"]));
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn test_rollback_to_head_appends_empty_generation() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        commit(&tracker, "a", None);
        let g = tracker.rollback(0).unwrap();
        assert!(g.changes.is_empty());
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_rollback_unknown_index() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = open(&dir);
        assert!(matches!(tracker.rollback(0), Err(TrackerError::UnknownGeneration(0))));
        commit(&tracker, "a", None);
        assert!(matches!(tracker.rollback(5), Err(TrackerError::UnknownGeneration(5))));
    }

    // -----------------------------------------------------------------------
    // durability
    // -----------------------------------------------------------------------

    #[test]
    fn test_reopen_replays_same_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = open(&dir);
            commit(&tracker, "a1", Some("csv"));
            commit(&tracker, "a2", Some("csv"));
            tracker.rollback(0).unwrap();
        }
        let tracker = open(&dir);
        assert_eq!(tracker.len(), 3);
        assert_eq!(active(&tracker), set(&["a1"]));
        assert_eq!(
            tracker.stores().read(StoreKind::Tools).live("csv").unwrap().artifact.content,
            "a1"
        );
    }

    #[test]
    fn test_torn_commit_is_invisible_before_and_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tracker = open(&dir);
            commit(&tracker, "kept", None);
            tracker.inject_fault(AppendFault::TornWrite);
            let draft = insert_draft(&tracker, "lost", None);
            assert!(tracker.append(draft, Some(0)).is_err());
            assert_eq!(active(&tracker), set(&["kept"]));
            assert_eq!(tracker.len(), 1);
        }
        let tracker = open(&dir);
        assert_eq!(tracker.len(), 1);
        assert_eq!(active(&tracker), set(&["kept"]));
        commit(&tracker, "after", None);
        assert_eq!(tracker.last_index(), Some(1));
    }
}
