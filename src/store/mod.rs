//! # Stage: Capability Store
//!
//! ## Responsibility
//! Content-addressed index of accepted artifacts.  Two instances exist: the
//! tool library (`StoreKind::Tools`) and the policy store
//! (`StoreKind::Policies`).  Entries are never removed, only deactivated.
//!
//! A *slot* names a live position (a tool name, a self-modification target).
//! At most one active entry occupies a slot; inserting a newer entry into an
//! occupied slot shadows the previous occupant.
//!
//! ## Guarantees
//! - Idempotent: re-adding byte-identical content returns the stored entry
//! - `DuplicateId` only on an id collision with different content
//! - Deterministic ranking: score, then recency, then insertion order
//!
//! ## NOT Responsible For
//! - Durability (the generation log is the source of truth; stores are
//!   rebuilt from it on startup)
//! - Deciding what gets committed (that is the integrator)

pub mod relevance;

pub use relevance::{AmbientContext, AmbientWeighted, RelevanceStrategy, TagOverlap};

use crate::artifact::{now_ms, ArtifactKind, CandidateArtifact, Fingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ---------------------------------------------------------------------------
// StoreKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Tools,
    Policies,
}

impl StoreKind {
    /// Artifact kind this store accepts.
    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            StoreKind::Tools => ArtifactKind::Code,
            StoreKind::Policies => ArtifactKind::Principle,
        }
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::Tools => write!(f, "tools"),
            StoreKind::Policies => write!(f, "policies"),
        }
    }
}

// ---------------------------------------------------------------------------
// UsageStats
// ---------------------------------------------------------------------------

/// Volatile usage telemetry.  Not persisted; starts fresh on every restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageStats {
    pub applications: u64,
    pub successes: u64,
    /// Exponential moving average of outcomes (1.0 = always succeeded).
    pub success_rate: f64,
    pub last_used_ms: Option<u64>,
}

impl UsageStats {
    pub const EMA_ALPHA: f64 = 0.3;

    pub fn record(&mut self, success: bool, at_ms: u64) {
        let x = if success { 1.0 } else { 0.0 };
        self.success_rate = if self.applications == 0 {
            x
        } else {
            Self::EMA_ALPHA * x + (1.0 - Self::EMA_ALPHA) * self.success_rate
        };
        self.applications += 1;
        if success {
            self.successes += 1;
        }
        self.last_used_ms = Some(at_ms);
    }
}

// ---------------------------------------------------------------------------
// CapabilityEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    pub id: Fingerprint,
    pub artifact: CandidateArtifact,
    /// 1 + number of earlier entries committed to the same slot.
    pub version: u32,
    pub accepted_at_ms: u64,
    pub source_generation: u64,
    pub active: bool,
    #[serde(skip)]
    pub usage: UsageStats,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub scope_tags: BTreeSet<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

impl CapabilityEntry {
    pub fn new(artifact: CandidateArtifact, source_generation: u64, version: u32) -> Self {
        Self {
            id: artifact.fingerprint(),
            artifact,
            version,
            accepted_at_ms: now_ms(),
            source_generation,
            active: true,
            usage: UsageStats::default(),
            slot: None,
            scope_tags: BTreeSet::new(),
            confidence: None,
        }
    }

    pub fn with_slot(mut self, slot: Option<String>) -> Self {
        self.slot = slot;
        self
    }

    pub fn with_tags(mut self, tags: BTreeSet<String>) -> Self {
        self.scope_tags = tags;
        self
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence.map(|c| c.clamp(0.0, 1.0));
        self
    }

    /// Principle view of this entry; `None` for code artifacts.
    pub fn as_principle(&self) -> Option<PolicyPrinciple> {
        (self.artifact.kind == ArtifactKind::Principle).then(|| PolicyPrinciple {
            id: self.id.clone(),
            text: self.artifact.content.clone(),
            scope_tags: self.scope_tags.clone(),
            confidence: self.confidence.unwrap_or(0.5),
            origin_generation: self.source_generation,
            usage: self.usage.clone(),
        })
    }
}

/// A reasoning principle as handed to a task agent.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyPrinciple {
    pub id: Fingerprint,
    pub text: String,
    pub scope_tags: BTreeSet<String>,
    pub confidence: f64,
    pub origin_generation: u64,
    pub usage: UsageStats,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate id {id}: stored content differs")]
    DuplicateId { id: Fingerprint },

    #[error("unknown entry {0}")]
    UnknownEntry(Fingerprint),

    #[error("{store} store does not accept {kind} artifacts")]
    WrongKind { store: StoreKind, kind: ArtifactKind },
}

/// How a candidate relates to what the store already holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    New,
    Active(CapabilityEntry),
    Inactive(CapabilityEntry),
}

// ---------------------------------------------------------------------------
// CapabilityStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Stored {
    entry: CapabilityEntry,
    seq: u64,
}

pub struct CapabilityStore {
    kind: StoreKind,
    entries: HashMap<Fingerprint, Stored>,
    next_seq: u64,
    /// Slot name -> active occupant.
    slots: HashMap<String, Fingerprint>,
    /// Slot name -> highest version ever committed.
    slot_versions: HashMap<String, u32>,
    strategy: Arc<dyn RelevanceStrategy>,
}

impl CapabilityStore {
    pub fn new(kind: StoreKind) -> Self {
        Self::with_strategy(kind, Arc::new(TagOverlap))
    }

    pub fn with_strategy(kind: StoreKind, strategy: Arc<dyn RelevanceStrategy>) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            next_seq: 0,
            slots: HashMap::new(),
            slot_versions: HashMap::new(),
            strategy,
        }
    }

    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries.values().filter(|s| s.entry.active).count()
    }

    pub fn get(&self, id: &Fingerprint) -> Option<&CapabilityEntry> {
        self.entries.get(id).map(|s| &s.entry)
    }

    pub fn contains(&self, id: &Fingerprint) -> bool {
        self.entries.contains_key(id)
    }

    /// Active entry occupying `slot`.
    pub fn live(&self, slot: &str) -> Option<&CapabilityEntry> {
        self.slots.get(slot).and_then(|id| self.get(id))
    }

    /// Version the next entry committed to `slot` will carry.
    pub fn next_version(&self, slot: Option<&str>) -> u32 {
        slot.and_then(|s| self.slot_versions.get(s)).map_or(1, |v| v + 1)
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> Vec<&CapabilityEntry> {
        let mut all: Vec<&Stored> = self.entries.values().collect();
        all.sort_by_key(|s| s.seq);
        all.into_iter().map(|s| &s.entry).collect()
    }

    pub fn active_entries(&self) -> Vec<&CapabilityEntry> {
        self.entries().into_iter().filter(|e| e.active).collect()
    }

    pub fn active_ids(&self) -> BTreeSet<Fingerprint> {
        self.entries
            .values()
            .filter(|s| s.entry.active)
            .map(|s| s.entry.id.clone())
            .collect()
    }

    /// Active principles in insertion order (policy store).
    pub fn principles(&self) -> Vec<PolicyPrinciple> {
        self.active_entries().into_iter().filter_map(|e| e.as_principle()).collect()
    }

    /// Classify a candidate without changing anything.
    pub fn admit(&self, artifact: &CandidateArtifact) -> Result<Admission, StoreError> {
        if artifact.kind != self.kind.artifact_kind() {
            return Err(StoreError::WrongKind { store: self.kind, kind: artifact.kind });
        }
        let id = artifact.fingerprint();
        match self.get(&id) {
            None => Ok(Admission::New),
            Some(existing) if !existing.artifact.same_content(artifact) => {
                Err(StoreError::DuplicateId { id })
            }
            Some(existing) if existing.active => Ok(Admission::Active(existing.clone())),
            Some(existing) => Ok(Admission::Inactive(existing.clone())),
        }
    }

    /// Insert an entry.  Identical content already stored returns the stored
    /// entry unchanged.  A slotted entry shadows the slot's previous occupant.
    pub fn add(&mut self, entry: CapabilityEntry) -> Result<CapabilityEntry, StoreError> {
        if entry.artifact.kind != self.kind.artifact_kind() {
            return Err(StoreError::WrongKind { store: self.kind, kind: entry.artifact.kind });
        }
        if let Some(existing) = self.get(&entry.id) {
            return if existing.artifact.same_content(&entry.artifact) {
                Ok(existing.clone())
            } else {
                Err(StoreError::DuplicateId { id: entry.id })
            };
        }
        let mut entry = entry;
        entry.active = true;
        if let Some(slot) = entry.slot.clone() {
            if let Some(previous) = self.slots.insert(slot.clone(), entry.id.clone()) {
                if let Some(stored) = self.entries.get_mut(&previous) {
                    stored.entry.active = false;
                }
            }
            let version = self.slot_versions.entry(slot).or_insert(0);
            *version = (*version).max(entry.version);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(entry.id.clone(), Stored { entry: entry.clone(), seq });
        Ok(entry)
    }

    /// Mark inactive.  Returns whether the entry was active before.
    pub fn deactivate(&mut self, id: &Fingerprint) -> Result<bool, StoreError> {
        let stored = self.entries.get_mut(id).ok_or_else(|| StoreError::UnknownEntry(id.clone()))?;
        let was_active = stored.entry.active;
        stored.entry.active = false;
        if let Some(slot) = &stored.entry.slot {
            if self.slots.get(slot) == Some(id) {
                self.slots.remove(slot);
            }
        }
        Ok(was_active)
    }

    /// Mark active again.  A slotted entry takes its slot back, deactivating
    /// whichever entry occupied it.  Returns whether the entry was inactive.
    pub fn reactivate(&mut self, id: &Fingerprint) -> Result<bool, StoreError> {
        let (was_inactive, slot) = {
            let stored =
                self.entries.get_mut(id).ok_or_else(|| StoreError::UnknownEntry(id.clone()))?;
            let was_inactive = !stored.entry.active;
            stored.entry.active = true;
            (was_inactive, stored.entry.slot.clone())
        };
        if let Some(slot) = slot {
            if let Some(previous) = self.slots.insert(slot, id.clone()) {
                if &previous != id {
                    if let Some(stored) = self.entries.get_mut(&previous) {
                        stored.entry.active = false;
                    }
                }
            }
        }
        Ok(was_inactive)
    }

    pub fn record_usage(&mut self, id: &Fingerprint, success: bool) -> Result<UsageStats, StoreError> {
        let stored = self.entries.get_mut(id).ok_or_else(|| StoreError::UnknownEntry(id.clone()))?;
        stored.entry.usage.record(success, now_ms());
        Ok(stored.entry.usage.clone())
    }

    /// Top `k` active entries for `query_tags`, ranked by this store's
    /// relevance strategy.
    pub fn retrieve_by_relevance(
        &self,
        query_tags: &BTreeSet<String>,
        k: usize,
        ambient: &AmbientContext,
    ) -> Vec<CapabilityEntry> {
        relevance::rank(
            self.entries.values().map(|s| (&s.entry, s.seq)),
            query_tags,
            k,
            ambient,
            self.strategy.as_ref(),
        )
    }
}

// ---------------------------------------------------------------------------
// Stores — the pair shared by tracker and integrator
// ---------------------------------------------------------------------------

/// Tool library and policy store behind their own locks.  Only the
/// generation tracker takes write guards.
pub struct Stores {
    tools: RwLock<CapabilityStore>,
    policies: RwLock<CapabilityStore>,
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

impl Stores {
    pub fn new() -> Self {
        Self::with_policy_strategy(Arc::new(TagOverlap))
    }

    pub fn with_policy_strategy(strategy: Arc<dyn RelevanceStrategy>) -> Self {
        Self {
            tools: RwLock::new(CapabilityStore::new(StoreKind::Tools)),
            policies: RwLock::new(CapabilityStore::with_strategy(StoreKind::Policies, strategy)),
        }
    }

    fn lock(&self, kind: StoreKind) -> &RwLock<CapabilityStore> {
        match kind {
            StoreKind::Tools => &self.tools,
            StoreKind::Policies => &self.policies,
        }
    }

    pub fn read(&self, kind: StoreKind) -> RwLockReadGuard<'_, CapabilityStore> {
        match self.lock(kind).read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn write(&self, kind: StoreKind) -> RwLockWriteGuard<'_, CapabilityStore> {
        match self.lock(kind).write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(content: &str) -> CapabilityEntry {
        CapabilityEntry::new(CandidateArtifact::code(content, "t"), 0, 1)
    }

    fn slotted(content: &str, slot: &str, store: &CapabilityStore) -> CapabilityEntry {
        CapabilityEntry::new(CandidateArtifact::code(content, "t"), 0, store.next_version(Some(slot)))
            .with_slot(Some(slot.to_string()))
    }

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|t| t.to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // add / idempotence
    // -----------------------------------------------------------------------

    #[test]
    fn test_add_then_get() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let added = store.add(tool("a")).unwrap();
        assert!(added.active);
        assert_eq!(store.get(&added.id).unwrap().artifact.content, "a");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_identical_content_is_idempotent() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let first = store.add(tool("same")).unwrap();
        let mut again = tool("same");
        again.source_generation = 9;
        let second = store.add(again).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_add_colliding_id_with_other_content_is_duplicate() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let first = store.add(tool("original")).unwrap();
        let mut forged = tool("different");
        forged.id = first.id.clone();
        assert_eq!(store.add(forged), Err(StoreError::DuplicateId { id: first.id }));
    }

    #[test]
    fn test_add_wrong_kind_rejected() {
        let mut store = CapabilityStore::new(StoreKind::Policies);
        assert!(matches!(store.add(tool("code")), Err(StoreError::WrongKind { .. })));
    }

    // -----------------------------------------------------------------------
    // admit
    // -----------------------------------------------------------------------

    #[test]
    fn test_admit_classifies_new_active_inactive() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let artifact = CandidateArtifact::code("x", "t");
        assert_eq!(store.admit(&artifact).unwrap(), Admission::New);
        let entry = store.add(tool("x")).unwrap();
        assert!(matches!(store.admit(&artifact).unwrap(), Admission::Active(_)));
        store.deactivate(&entry.id).unwrap();
        assert!(matches!(store.admit(&artifact).unwrap(), Admission::Inactive(_)));
    }

    // -----------------------------------------------------------------------
    // deactivate / reactivate / slots
    // -----------------------------------------------------------------------

    #[test]
    fn test_deactivate_never_removes() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let entry = store.add(tool("x")).unwrap();
        assert!(store.deactivate(&entry.id).unwrap());
        assert!(!store.deactivate(&entry.id).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_count(), 0);
    }

    #[test]
    fn test_deactivate_unknown_is_error() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let id = CandidateArtifact::code("ghost", "t").fingerprint();
        assert_eq!(store.deactivate(&id), Err(StoreError::UnknownEntry(id)));
    }

    #[test]
    fn test_slot_newer_entry_shadows_previous() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let v1 = slotted("v1", "csv", &store);
        let v1 = store.add(v1).unwrap();
        let v2 = slotted("v2", "csv", &store);
        let v2 = store.add(v2).unwrap();
        assert_eq!(v2.version, 2);
        assert_eq!(store.live("csv").unwrap().id, v2.id);
        assert!(!store.get(&v1.id).unwrap().active);
        assert_eq!(store.next_version(Some("csv")), 3);
    }

    #[test]
    fn test_reactivate_takes_slot_back() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let v1 = slotted("v1", "csv", &store);
        let v1 = store.add(v1).unwrap();
        let v2 = slotted("v2", "csv", &store);
        let v2 = store.add(v2).unwrap();
        assert!(store.reactivate(&v1.id).unwrap());
        assert_eq!(store.live("csv").unwrap().id, v1.id);
        assert!(!store.get(&v2.id).unwrap().active);
    }

    #[test]
    fn test_deactivating_live_entry_empties_slot() {
        let mut store = CapabilityStore::new(StoreKind::Tools);
        let v1 = slotted("v1", "csv", &store);
        let v1 = store.add(v1).unwrap();
        store.deactivate(&v1.id).unwrap();
        assert!(store.live("csv").is_none());
    }

    // -----------------------------------------------------------------------
    // retrieval / usage
    // -----------------------------------------------------------------------

    #[test]
    fn test_retrieve_by_relevance_uses_tags() {
        let mut store = CapabilityStore::new(StoreKind::Policies);
        let p = CapabilityEntry::new(CandidateArtifact::principle("check headers", "t"), 0, 1)
            .with_tags(tags(&["csv", "headers"]));
        let q = CapabilityEntry::new(CandidateArtifact::principle("show work", "t"), 0, 1)
            .with_tags(tags(&["math"]));
        store.add(p).unwrap();
        store.add(q).unwrap();
        let hits = store.retrieve_by_relevance(&tags(&["csv"]), 3, &AmbientContext::new());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].artifact.content, "check headers");
    }

    #[test]
    fn test_usage_ema() {
        let mut stats = UsageStats::default();
        stats.record(true, 1);
        assert_eq!(stats.success_rate, 1.0);
        stats.record(false, 2);
        assert!((stats.success_rate - 0.7).abs() < 1e-9);
        assert_eq!(stats.applications, 2);
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.last_used_ms, Some(2));
    }

    #[test]
    fn test_principle_view_only_for_principles() {
        let code = tool("x");
        assert!(code.as_principle().is_none());
        let principle = CapabilityEntry::new(CandidateArtifact::principle("p", "t"), 3, 1)
            .with_confidence(Some(1.7));
        let view = principle.as_principle().unwrap();
        assert_eq!(view.confidence, 1.0);
        assert_eq!(view.origin_generation, 3);
    }

    #[test]
    fn test_stores_route_by_kind() {
        let stores = Stores::new();
        stores.write(StoreKind::Tools).add(tool("t")).unwrap();
        assert_eq!(stores.read(StoreKind::Tools).len(), 1);
        assert!(stores.read(StoreKind::Policies).is_empty());
    }
}
