//! # Stage: External Collaborators
//!
//! ## Responsibility
//! Narrow seams to everything the pipeline treats as an opaque oracle: the
//! change proposer, the task agent that attempts reasoning tasks, the judge
//! that scores attempts, and feature extraction for principle tags.
//!
//! Deterministic implementations ship alongside each trait
//! ([`ScriptedProposer`], [`ScriptedAgent`], [`ExpectedAnswerJudge`],
//! [`KeywordFeatures`]).  [`CommandProposer`] and [`CommandAgent`] delegate to
//! external programs speaking JSON on stdin/stdout.
//!
//! ## NOT Responsible For
//! - How candidates are generated; callers see only the returned artifact

use crate::artifact::{ArtifactKind, CandidateArtifact};
use crate::store::PolicyPrinciple;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Change proposer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalMode {
    /// New tool for a task.
    Capability,
    /// Reasoning principle distilled from a failed attempt.
    Reflection,
    /// Replacement for a live behavior-defining artifact.
    SelfModification,
}

impl ProposalMode {
    pub fn artifact_kind(self) -> ArtifactKind {
        match self {
            ProposalMode::Reflection => ArtifactKind::Principle,
            ProposalMode::Capability | ProposalMode::SelfModification => ArtifactKind::Code,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalContext {
    pub task_id: String,
    pub task_description: String,
    pub prior_failure_trace: Option<String>,
    /// Current artifact being replaced (self-modification).
    pub target_artifact: Option<CandidateArtifact>,
    pub mode: ProposalMode,
}

impl ProposalContext {
    pub fn new(task_id: impl Into<String>, task_description: impl Into<String>, mode: ProposalMode) -> Self {
        Self {
            task_id: task_id.into(),
            task_description: task_description.into(),
            prior_failure_trace: None,
            target_artifact: None,
            mode,
        }
    }

    pub fn with_failure_trace(mut self, trace: Option<String>) -> Self {
        self.prior_failure_trace = trace;
        self
    }

    pub fn with_target(mut self, target: Option<CandidateArtifact>) -> Self {
        self.target_artifact = target;
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProposalError {
    #[error("proposer unavailable: {0}")]
    Unavailable(String),

    #[error("proposer produced an empty artifact")]
    Empty,

    #[error("no scripted proposal left for task '{0}'")]
    Exhausted(String),
}

#[async_trait]
pub trait ChangeProposer: Send + Sync {
    async fn propose(&self, ctx: &ProposalContext) -> Result<CandidateArtifact, ProposalError>;
}

/// Replays canned proposals.  Per-task queues are consumed first; a fixed
/// fallback (if set) answers everything else.
pub struct ScriptedProposer {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    fallback: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl Default for ScriptedProposer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProposer {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every request with `content`.
    pub fn fixed(content: impl Into<String>) -> Self {
        Self { fallback: Some(content.into()), ..Self::new() }
    }

    pub fn with_script<I, S>(self, task_id: impl Into<String>, proposals: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push(task_id, proposals);
        self
    }

    /// Queue more proposals for `task_id`.
    pub fn push<I, S>(&self, task_id: impl Into<String>, proposals: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut scripts = match self.scripts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        scripts.entry(task_id.into()).or_default().extend(proposals.into_iter().map(Into::into));
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_for(&self, task_id: &str) -> Option<String> {
        let mut scripts = match self.scripts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        scripts
            .get_mut(task_id)
            .and_then(|queue| queue.pop_front())
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ChangeProposer for ScriptedProposer {
    async fn propose(&self, ctx: &ProposalContext) -> Result<CandidateArtifact, ProposalError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let content = self
            .next_for(&ctx.task_id)
            .ok_or_else(|| ProposalError::Exhausted(ctx.task_id.clone()))?;
        Ok(CandidateArtifact::new(ctx.mode.artifact_kind(), content, ctx.task_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// External programs
// ---------------------------------------------------------------------------

/// One external program speaking JSON on stdin, answering on stdout.
#[derive(Debug, Clone)]
struct ExternalCommand {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCommand {
    fn new(command: &[String], timeout: Duration) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self { program: program.clone(), args: args.to_vec(), timeout })
    }

    /// Run the program once with `request` on stdin; returns its stdout.
    async fn exchange(&self, request: &[u8]) -> Result<String, String> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("spawning {}: {}", self.program, e))?;

        // Writing the request counts against the deadline: a child that never
        // reads stdin would otherwise block us once the pipe buffer fills.
        let exchange = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(request).await?;
            }
            child.wait_with_output().await
        };
        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("{} timed out after {:?}", self.program, self.timeout)),
        };
        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Runs an external program per proposal.  The [`ProposalContext`] is
/// written to its stdin as JSON; stdout becomes the artifact content.
pub struct CommandProposer {
    command: ExternalCommand,
}

impl CommandProposer {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, ProposalError> {
        let command = ExternalCommand::new(command, timeout)
            .ok_or_else(|| ProposalError::Unavailable("empty proposer command".into()))?;
        Ok(Self { command })
    }
}

#[async_trait]
impl ChangeProposer for CommandProposer {
    async fn propose(&self, ctx: &ProposalContext) -> Result<CandidateArtifact, ProposalError> {
        let request = serde_json::to_vec(ctx).map_err(|e| ProposalError::Unavailable(e.to_string()))?;
        let content = self.command.exchange(&request).await.map_err(ProposalError::Unavailable)?;
        debug!(task = %ctx.task_id, bytes = content.len(), "external proposal received");
        Ok(CandidateArtifact::new(ctx.mode.artifact_kind(), content, ctx.task_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Reasoning tasks, attempts, verdicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTask {
    pub id: String,
    pub description: String,
    /// Reference answer, for judges that compare against one.
    #[serde(default)]
    pub expected: Option<String>,
}

impl ReasoningTask {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self { id: id.into(), description: description.into(), expected: None }
    }

    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected = Some(expected.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptTrace {
    pub answer: String,
    pub reasoning: String,
}

impl AttemptTrace {
    pub fn new(answer: impl Into<String>, reasoning: impl Into<String>) -> Self {
        Self { answer: answer.into(), reasoning: reasoning.into() }
    }

    /// Text handed to the proposer when reflecting on a failed attempt.
    pub fn render(&self, verdict: &Verdict) -> String {
        format!(
            "answer: {}\nreasoning: {}\njudged: {} (score {:.2})",
            self.answer,
            self.reasoning,
            if verdict.success { "success" } else { "failure" },
            verdict.score
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub success: bool,
    /// In `[0, 1]`.
    pub score: f64,
}

impl Verdict {
    pub fn pass(score: f64) -> Self {
        Self { success: true, score: score.clamp(0.0, 1.0) }
    }

    pub fn fail(score: f64) -> Self {
        Self { success: false, score: score.clamp(0.0, 1.0) }
    }
}

/// What an attempt is given to work with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Guidance {
    pub principles: Vec<PolicyPrinciple>,
    /// Candidate principle under trial (second attempt only).
    pub candidate: Option<String>,
}

impl Guidance {
    pub fn is_empty(&self) -> bool {
        self.principles.is_empty() && self.candidate.is_none()
    }

    /// Prompt-ready rendering of the guidance.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.principles.is_empty() {
            out.push_str("## Learned Reasoning Principles\n");
            for (i, p) in self.principles.iter().enumerate() {
                out.push_str(&format!(
                    "{}. {} (applied {}x | {:.0}% success)\n",
                    i + 1,
                    p.text,
                    p.usage.applications,
                    p.usage.success_rate * 100.0
                ));
            }
        }
        if let Some(candidate) = &self.candidate {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("## Reflection\n");
            out.push_str(candidate);
            out.push('\n');
        }
        out
    }
}

#[async_trait]
pub trait TaskAgent: Send + Sync {
    async fn attempt(&self, task: &ReasoningTask, guidance: &Guidance) -> AttemptTrace;
}

pub trait TaskJudge: Send + Sync {
    fn evaluate(&self, task: &ReasoningTask, trace: &AttemptTrace) -> Verdict;
}

type AgentFn = dyn Fn(&ReasoningTask, &Guidance) -> AttemptTrace + Send + Sync;

/// Agent whose answers come from a closure over the task and guidance.
pub struct ScriptedAgent {
    answer: Box<AgentFn>,
    calls: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(answer: impl Fn(&ReasoningTask, &Guidance) -> AttemptTrace + Send + Sync + 'static) -> Self {
        Self { answer: Box::new(answer), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskAgent for ScriptedAgent {
    async fn attempt(&self, task: &ReasoningTask, guidance: &Guidance) -> AttemptTrace {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.answer)(task, guidance)
    }
}

#[derive(Serialize)]
struct AgentRequest<'a> {
    task: &'a ReasoningTask,
    guidance: String,
}

/// Runs an external program per attempt.  Stdin carries
/// `{"task": ..., "guidance": "..."}`; the first stdout line is the answer
/// and the rest is the reasoning.  A failed run is an empty answer.
pub struct CommandAgent {
    command: ExternalCommand,
}

impl CommandAgent {
    pub fn new(command: &[String], timeout: Duration) -> Option<Self> {
        ExternalCommand::new(command, timeout).map(|command| Self { command })
    }
}

#[async_trait]
impl TaskAgent for CommandAgent {
    async fn attempt(&self, task: &ReasoningTask, guidance: &Guidance) -> AttemptTrace {
        let request = AgentRequest { task, guidance: guidance.render() };
        let reply = match serde_json::to_vec(&request) {
            Ok(bytes) => self.command.exchange(&bytes).await,
            Err(e) => Err(e.to_string()),
        };
        match reply {
            Ok(stdout) => {
                let (answer, reasoning) = stdout.split_once('\n').unwrap_or((stdout.as_str(), ""));
                AttemptTrace::new(answer.trim(), reasoning.trim())
            }
            Err(reason) => {
                warn!(task = %task.id, %reason, "agent attempt failed");
                AttemptTrace::new("", format!("agent unavailable: {}", reason))
            }
        }
    }
}

/// Success iff the answer equals the task's expected answer (trimmed,
/// case-insensitive).  Tasks without an expected answer always fail.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectedAnswerJudge;

impl TaskJudge for ExpectedAnswerJudge {
    fn evaluate(&self, task: &ReasoningTask, trace: &AttemptTrace) -> Verdict {
        match &task.expected {
            Some(expected) if expected.trim().eq_ignore_ascii_case(trace.answer.trim()) => Verdict::pass(1.0),
            _ => Verdict::fail(0.0),
        }
    }
}

// ---------------------------------------------------------------------------
// Feature extraction
// ---------------------------------------------------------------------------

pub trait FeatureExtractor: Send + Sync {
    fn features(&self, task: &ReasoningTask) -> BTreeSet<String>;
}

/// Lowercased alphanumeric words of at least `min_len` characters, minus
/// common stop words.
#[derive(Debug, Clone)]
pub struct KeywordFeatures {
    pub min_len: usize,
}

impl Default for KeywordFeatures {
    fn default() -> Self {
        Self { min_len: 4 }
    }
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "before", "from", "have", "into", "that", "their", "them", "then", "there",
    "these", "this", "what", "when", "where", "which", "with", "would", "your",
];

impl FeatureExtractor for KeywordFeatures {
    fn features(&self, task: &ReasoningTask) -> BTreeSet<String> {
        task.description
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.chars().count() >= self.min_len && !STOP_WORDS.contains(&w.as_str()))
            .collect()
    }
}
