//! Generation records: the unit of history.
//!
//! A generation references capability entries by fingerprint only.  Entry
//! bodies travel next to the generation in the log record that introduces
//! them (see [`crate::ledger`]).

use crate::artifact::Fingerprint;
use crate::store::{CapabilityEntry, StoreKind};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// New entry; `shadows` is the slot occupant it displaced.
    Insert { shadows: Option<Fingerprint> },
    Deactivate,
    Reactivate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRef {
    pub store: StoreKind,
    pub id: Fingerprint,
    #[serde(flatten)]
    pub op: ChangeOp,
}

impl ChangeRef {
    pub fn deactivate(store: StoreKind, id: Fingerprint) -> Self {
        Self { store, id, op: ChangeOp::Deactivate }
    }

    pub fn reactivate(store: StoreKind, id: Fingerprint) -> Self {
        Self { store, id, op: ChangeOp::Reactivate }
    }
}

impl std::fmt::Display for ChangeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.op {
            ChangeOp::Insert { shadows: Some(old) } => {
                write!(f, "+{}:{} (shadows {})", self.store, self.id.short(), old.short())
            }
            ChangeOp::Insert { shadows: None } => write!(f, "+{}:{}", self.store, self.id.short()),
            ChangeOp::Deactivate => write!(f, "-{}:{}", self.store, self.id.short()),
            ChangeOp::Reactivate => write!(f, "^{}:{}", self.store, self.id.short()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOutcome {
    Committed,
    /// Evaluated and rejected; carries no changes.
    Reverted,
}

impl std::fmt::Display for GenerationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GenerationOutcome::Committed => write!(f, "committed"),
            GenerationOutcome::Reverted => write!(f, "reverted"),
        }
    }
}

/// Aggregate of one benchmark-suite run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkScores {
    /// Passing cases / total cases.
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub runs: u32,
}

impl std::fmt::Display for BenchmarkScores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "success {:.1}% / latency {:.1}ms over {} runs",
            self.success_rate * 100.0,
            self.mean_latency_ms,
            self.runs
        )
    }
}

/// Before/after scores recorded with a self-modification decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub component: String,
    pub before: Option<BenchmarkScores>,
    pub after: BenchmarkScores,
    pub tolerance: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub index: u64,
    pub parent_index: Option<u64>,
    pub timestamp_ms: u64,
    pub changes: Vec<ChangeRef>,
    pub rationale: String,
    pub outcome: GenerationOutcome,
    #[serde(default)]
    pub performance: Option<PerformanceSnapshot>,
    /// Set on compensating generations produced by a rollback.
    #[serde(default)]
    pub rollback_of: Option<u64>,
}

impl Generation {
    pub fn is_rollback(&self) -> bool {
        self.rollback_of.is_some()
    }
}

// ---------------------------------------------------------------------------
// GenerationDraft — everything but the index
// ---------------------------------------------------------------------------

/// A generation before the tracker assigns its index and parent.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDraft {
    pub changes: Vec<ChangeRef>,
    /// Bodies for every `Insert` in `changes`.
    pub entries: Vec<CapabilityEntry>,
    pub rationale: String,
    pub outcome: GenerationOutcome,
    pub performance: Option<PerformanceSnapshot>,
    pub rollback_of: Option<u64>,
}

impl GenerationDraft {
    pub fn committed(rationale: impl Into<String>) -> Self {
        Self {
            changes: Vec::new(),
            entries: Vec::new(),
            rationale: rationale.into(),
            outcome: GenerationOutcome::Committed,
            performance: None,
            rollback_of: None,
        }
    }

    pub fn reverted(rationale: impl Into<String>, performance: Option<PerformanceSnapshot>) -> Self {
        Self {
            outcome: GenerationOutcome::Reverted,
            performance,
            ..Self::committed(rationale)
        }
    }

    pub fn with_insert(mut self, store: StoreKind, entry: CapabilityEntry, shadows: Option<Fingerprint>) -> Self {
        self.changes.push(ChangeRef { store, id: entry.id.clone(), op: ChangeOp::Insert { shadows } });
        self.entries.push(entry);
        self
    }

    pub fn with_change(mut self, change: ChangeRef) -> Self {
        self.changes.push(change);
        self
    }

    pub fn with_performance(mut self, performance: Option<PerformanceSnapshot>) -> Self {
        self.performance = performance;
        self
    }

    pub fn with_rollback_of(mut self, index: u64) -> Self {
        self.rollback_of = Some(index);
        self
    }
}
