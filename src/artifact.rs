//! # Stage: Candidate Artifacts
//!
//! ## Responsibility
//! The unit of change flowing through the pipeline: a piece of code or a
//! reasoning principle, plus the content fingerprint that identifies it once
//! committed.
//!
//! ## Guarantees
//! - Deterministic: the fingerprint depends only on the artifact kind and its
//!   content bytes, never on origin or timestamps
//! - Kind-separated: a principle and a tool with identical text never alias

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// ArtifactKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Executable capability (tool source, behavior-defining script).
    Code,
    /// Natural-language reasoning principle.
    Principle,
}

impl ArtifactKind {
    fn tag(self) -> &'static [u8] {
        match self {
            ArtifactKind::Code => b"code",
            ArtifactKind::Principle => b"principle",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Code => write!(f, "code"),
            ArtifactKind::Principle => write!(f, "principle"),
        }
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 over `kind || 0x00 || content`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(kind: ArtifactKind, content: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(kind.tag());
        hasher.update([0u8]);
        hasher.update(content.as_bytes());
        Fingerprint(hex::encode(hasher.finalize()))
    }

    /// Parse a previously rendered fingerprint.  Returns `None` unless the
    /// input is exactly 64 lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == 64
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and terminal reports.
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// CandidateArtifact
// ---------------------------------------------------------------------------

/// A proposed change.  Transient until the integrator commits it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateArtifact {
    pub kind: ArtifactKind,
    pub content: String,
    /// Task (or self-modification target) that produced this candidate.
    pub origin_task_id: String,
    pub created_at_ms: u64,
}

impl CandidateArtifact {
    pub fn new(kind: ArtifactKind, content: impl Into<String>, origin_task_id: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            origin_task_id: origin_task_id.into(),
            created_at_ms: now_ms(),
        }
    }

    pub fn code(content: impl Into<String>, origin_task_id: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Code, content, origin_task_id)
    }

    pub fn principle(content: impl Into<String>, origin_task_id: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Principle, content, origin_task_id)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.kind, &self.content)
    }

    /// Whitespace-only content counts as no proposal at all.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }

    /// Byte-identical content of the same kind.
    pub fn same_content(&self, other: &CandidateArtifact) -> bool {
        self.kind == other.kind && self.content == other.content
    }
}
