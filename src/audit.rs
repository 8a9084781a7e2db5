//! # Stage: Attempt Audit Trail
//!
//! ## Responsibility
//! Bounded record of every pipeline attempt: commits, idempotent no-ops,
//! rejections, reverted self-modifications, proposer failures.  Rejected
//! candidates never reach the stores, so this is the only place they are
//! visible.  Operators read it through `evoagent status`; proposers can be
//! fed the recent failures for a task.
//!
//! ## Guarantees
//! - Bounded: oldest records are evicted past `capacity`
//! - Thread-safe: interior `Mutex`, shared as `Arc<AuditTrail>`
//! - Volatile: not persisted; the generation log is the durable history

use crate::artifact::now_ms;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Committed,
    AlreadyPresent,
    Rejected,
    Reverted,
    ProposalUnavailable,
    Cancelled,
    Failed,
}

impl AttemptOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, AttemptOutcome::Committed | AttemptOutcome::AlreadyPresent)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Committed => write!(f, "committed"),
            AttemptOutcome::AlreadyPresent => write!(f, "already_present"),
            AttemptOutcome::Rejected => write!(f, "rejected"),
            AttemptOutcome::Reverted => write!(f, "reverted"),
            AttemptOutcome::ProposalUnavailable => write!(f, "proposal_unavailable"),
            AttemptOutcome::Cancelled => write!(f, "cancelled"),
            AttemptOutcome::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// AttemptRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: String,
    /// Task id, or self-modification target.
    pub task: String,
    /// Short fingerprint of the candidate, when one was produced.
    pub candidate: Option<String>,
    pub outcome: AttemptOutcome,
    /// Failure trace, regression reason or commit note.
    pub detail: String,
    pub generation: Option<u64>,
    pub timestamp_ms: u64,
}

impl AttemptRecord {
    pub fn new(task: impl Into<String>, outcome: AttemptOutcome) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            candidate: None,
            outcome,
            detail: String::new(),
            generation: None,
            timestamp_ms: now_ms(),
        }
    }

    pub fn with_candidate(mut self, short_fingerprint: impl Into<String>) -> Self {
        self.candidate = Some(short_fingerprint.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }
}

// ---------------------------------------------------------------------------
// AuditStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditStats {
    pub total: usize,
    pub committed: usize,
    pub rejected: usize,
    pub reverted: usize,
    pub unavailable: usize,
    /// Successful attempts / all attempts (0.0 when empty).
    pub success_rate: f64,
}

// ---------------------------------------------------------------------------
// AuditTrail
// ---------------------------------------------------------------------------

pub struct AuditTrail {
    capacity: usize,
    records: Mutex<VecDeque<AttemptRecord>>,
}

impl AuditTrail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, records: Mutex::new(VecDeque::with_capacity(capacity.min(256))) }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<AttemptRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record(&self, record: AttemptRecord) {
        let mut records = self.lock();
        while records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Most recent `n` records, newest first.
    pub fn recent(&self, n: usize) -> Vec<AttemptRecord> {
        self.lock().iter().rev().take(n).cloned().collect()
    }

    /// Failed attempts for `task`, oldest first.
    pub fn failures_for(&self, task: &str) -> Vec<AttemptRecord> {
        self.lock()
            .iter()
            .filter(|r| r.task == task && !r.outcome.is_success())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> AuditStats {
        let records = self.lock();
        let count = |outcome: AttemptOutcome| records.iter().filter(|r| r.outcome == outcome).count();
        let total = records.len();
        let successes = records.iter().filter(|r| r.outcome.is_success()).count();
        AuditStats {
            total,
            committed: count(AttemptOutcome::Committed),
            rejected: count(AttemptOutcome::Rejected),
            reverted: count(AttemptOutcome::Reverted),
            unavailable: count(AttemptOutcome::ProposalUnavailable),
            success_rate: if total == 0 { 0.0 } else { successes as f64 / total as f64 },
        }
    }
}
