//! # Stage: Sandbox Executor
//!
//! ## Responsibility
//! Run an untrusted candidate artifact against a test harness in isolation and
//! report exactly one [`TestOutcome`].  The harness reports its verdict by
//! printing a single result-marker line on stdout:
//!
//! ```text
//! @@EVOAGENT-RESULT@@ {"passed": true, "cases": 3}
//! ```
//!
//! ## Guarantees
//! - One call, one outcome: executor failures are data (`OutcomeStatus`), never `Err`
//! - Bounded: every call returns within `timeout + teardown_grace`
//! - Stateless: no executor state survives between calls
//!
//! ## NOT Responsible For
//! - Deciding whether a passing candidate is committed (that is the integrator)
//! - Queueing policy beyond the FIFO permit pool in [`pool`]

pub mod pool;
pub mod process;

pub use pool::BoundedExecutor;
pub use process::ProcessSandbox;

use crate::artifact::CandidateArtifact;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of the single stdout line carrying the harness verdict.
pub const RESULT_MARKER: &str = "@@EVOAGENT-RESULT@@";

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Why an execution produced no usable verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxFault {
    /// Process exited abnormally without reporting a verdict.
    Crash { exit_code: Option<i32> },
    /// Verdict missing, duplicated or unparseable.
    MalformedResult { reason: String },
    /// Combined stdout/stderr exceeded the configured cap.
    OutputOverflow { limit: usize },
    /// The sandbox could not be prepared or the process could not start.
    Spawn { reason: String },
}

impl std::fmt::Display for SandboxFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxFault::Crash { exit_code: Some(code) } => write!(f, "crash (exit {})", code),
            SandboxFault::Crash { exit_code: None } => write!(f, "crash (killed by signal)"),
            SandboxFault::MalformedResult { reason } => write!(f, "malformed result: {}", reason),
            SandboxFault::OutputOverflow { limit } => write!(f, "output exceeded {} bytes", limit),
            SandboxFault::Spawn { reason } => write!(f, "spawn failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeStatus {
    Pass,
    Fail,
    Error(SandboxFault),
    Timeout,
}

impl OutcomeStatus {
    pub fn is_pass(&self) -> bool {
        matches!(self, OutcomeStatus::Pass)
    }

    /// `Error` and `Timeout`: the run itself went wrong, as opposed to the
    /// candidate failing its checks.
    pub fn is_fault(&self) -> bool {
        matches!(self, OutcomeStatus::Error(_) | OutcomeStatus::Timeout)
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Pass => write!(f, "PASS"),
            OutcomeStatus::Fail => write!(f, "FAIL"),
            OutcomeStatus::Error(fault) => write!(f, "ERROR: {}", fault),
            OutcomeStatus::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

/// Result of one sandbox execution.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub status: OutcomeStatus,
    /// stdout followed by stderr, truncated to the output cap.
    pub captured_output: String,
    /// The JSON object carried by the result marker, when one was reported.
    pub structured_result: Option<serde_json::Value>,
    pub duration: Duration,
    pub exit_code: Option<i32>,
}

impl TestOutcome {
    pub fn fault(fault: SandboxFault, duration: Duration) -> Self {
        Self {
            status: OutcomeStatus::Error(fault),
            captured_output: String::new(),
            structured_result: None,
            duration,
            exit_code: None,
        }
    }

    /// Compact description used as the prior-failure trace for the proposer.
    pub fn failure_trace(&self) -> String {
        let mut trace = format!("status: {}", self.status);
        if let Some(code) = self.exit_code {
            trace.push_str(&format!("\nexit code: {}", code));
        }
        if !self.captured_output.is_empty() {
            trace.push_str("\noutput:\n");
            trace.push_str(&self.captured_output);
        }
        trace
    }
}

// ---------------------------------------------------------------------------
// Harness and limits
// ---------------------------------------------------------------------------

/// How to run a candidate: the interpreter command, the driver script that
/// exercises the candidate, and where the candidate lands in the sandbox dir.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHarness {
    pub name: String,
    /// Program and leading arguments; the driver path is appended.
    pub interpreter: Vec<String>,
    pub driver_file: String,
    pub driver_source: String,
    pub artifact_file: String,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl TestHarness {
    /// POSIX shell driver; the candidate is written to `artifact.sh`.
    pub fn shell(name: impl Into<String>, driver_source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interpreter: vec!["sh".into()],
            driver_file: "harness.sh".into(),
            driver_source: driver_source.into(),
            artifact_file: "artifact.sh".into(),
            env: Vec::new(),
        }
    }

    /// Python driver; the candidate is written to `artifact.py` and can be
    /// imported as `artifact`.
    pub fn python(name: impl Into<String>, driver_source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interpreter: vec!["python3".into(), "-I".into()],
            driver_file: "harness.py".into(),
            driver_source: driver_source.into(),
            artifact_file: "artifact.py".into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    /// Extra time allowed for killing and reaping the process tree.
    pub teardown_grace: Duration,
    /// Cap on combined stdout + stderr bytes.
    pub max_output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            teardown_grace: Duration::from_secs(2),
            max_output_bytes: 64 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Result marker protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum MarkerScan {
    Verdict { passed: bool, payload: serde_json::Value },
    Missing,
    Malformed(String),
}

/// Scan stdout for the result marker.  Exactly one marker line carrying a
/// JSON object with a boolean `passed` field is a verdict.
pub fn scan_result_marker(stdout: &str) -> MarkerScan {
    let mut found: Option<&str> = None;
    for line in stdout.lines() {
        if let Some(rest) = line.trim_start().strip_prefix(RESULT_MARKER) {
            if found.is_some() {
                return MarkerScan::Malformed("more than one result marker".into());
            }
            found = Some(rest.trim());
        }
    }
    let Some(body) = found else {
        return MarkerScan::Missing;
    };
    let payload: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return MarkerScan::Malformed(format!("invalid JSON: {}", e)),
    };
    match payload.get("passed").and_then(|p| p.as_bool()) {
        Some(passed) => MarkerScan::Verdict { passed, payload },
        None => MarkerScan::Malformed("missing boolean `passed` field".into()),
    }
}

// ---------------------------------------------------------------------------
// SandboxExecutor trait
// ---------------------------------------------------------------------------

/// Executes one candidate against one harness.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        limits: &ResourceLimits,
    ) -> TestOutcome;
}

#[async_trait]
impl<T: SandboxExecutor + ?Sized> SandboxExecutor for Arc<T> {
    async fn execute(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        limits: &ResourceLimits,
    ) -> TestOutcome {
        (**self).execute(artifact, harness, limits).await
    }
}

// ---------------------------------------------------------------------------
// ScriptedSandbox — deterministic test double
// ---------------------------------------------------------------------------

/// What a [`ScriptedSandbox`] reports for one call.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub status: OutcomeStatus,
    /// Reported as the outcome duration (simulated latency).
    pub latency: Duration,
    pub output: String,
}

impl ScriptedRun {
    pub fn new(status: OutcomeStatus) -> Self {
        Self { status, latency: Duration::from_millis(1), output: String::new() }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

type Rule = dyn Fn(&CandidateArtifact, &TestHarness) -> ScriptedRun + Send + Sync;

/// Executor whose verdicts come from a closure.  Counts calls and tracks the
/// peak number of overlapping executions.
pub struct ScriptedSandbox {
    rule: Box<Rule>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedSandbox {
    pub fn new(
        rule: impl Fn(&CandidateArtifact, &TestHarness) -> ScriptedRun + Send + Sync + 'static,
    ) -> Self {
        Self {
            rule: Box::new(rule),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn always(status: OutcomeStatus) -> Self {
        Self::new(move |_, _| ScriptedRun::new(status.clone()))
    }

    pub fn passing() -> Self {
        Self::always(OutcomeStatus::Pass)
    }

    pub fn failing() -> Self {
        Self::always(OutcomeStatus::Fail)
    }

    /// Real wall-clock time each call holds before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxExecutor for ScriptedSandbox {
    async fn execute(
        &self,
        artifact: &CandidateArtifact,
        harness: &TestHarness,
        _limits: &ResourceLimits,
    ) -> TestOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        let run = (self.rule)(artifact, harness);
        let structured_result = match run.status {
            OutcomeStatus::Pass => Some(serde_json::json!({ "passed": true })),
            OutcomeStatus::Fail => Some(serde_json::json!({ "passed": false })),
            _ => None,
        };
        TestOutcome {
            status: run.status,
            captured_output: run.output,
            structured_result,
            duration: run.latency,
            exit_code: Some(0),
        }
    }
}
