//! # Stage: Runtime Wiring
//!
//! ## Responsibility
//! Build the component graph from an [`EvoConfig`]: open (and replay) the
//! generation log, rebuild the stores, seed the policy store on a fresh log,
//! and hand out the integrator, self-modification controller and reflection
//! cycle.  Also drives `evoagent run` cycles over a [`TaskFile`]: tools,
//! then components, then reasoning tasks.
//!
//! ## Guarantees
//! - A corrupted log fails [`Runtime::open`]; nothing is committed
//! - Seed principles are committed exactly once, as generation 0, and only
//!   by [`Runtime::open`]

use crate::artifact::CandidateArtifact;
use crate::audit::{AuditStats, AuditTrail};
use crate::config::EvoConfig;
use crate::error::EvoError;
use crate::generation::{Generation, GenerationDraft};
use crate::integrator::{CancelFlag, Integrator, PipelineOutcome};
use crate::oracle::{
    ChangeProposer, ExpectedAnswerJudge, FeatureExtractor, KeywordFeatures, ReasoningTask, TaskAgent, TaskJudge,
};
use crate::reflection::{CycleOutcome, ReflectionCycle};
use crate::store::AmbientContext;
use crate::sandbox::{BoundedExecutor, ProcessSandbox, SandboxExecutor};
use crate::self_modify::{BenchmarkSuite, SelfModError, SelfModificationController};
use crate::store::{AmbientWeighted, CapabilityEntry, StoreKind, Stores};
use crate::tasks::TaskFile;
use crate::tracker::GenerationTracker;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub head: Option<u64>,
    pub generations: usize,
    pub tools_active: usize,
    pub tools_total: usize,
    pub principles_active: usize,
    pub principles_total: usize,
    pub audit: AuditStats,
}

/// One task's result within a run cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleLine {
    pub cycle: u32,
    pub task: String,
    pub summary: String,
    pub committed: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub lines: Vec<CycleLine>,
}

impl RunReport {
    pub fn committed(&self) -> usize {
        self.lines.iter().filter(|l| l.committed).count()
    }

    pub fn failures(&self) -> usize {
        self.lines.iter().filter(|l| l.failed).count()
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

pub struct Runtime {
    config: EvoConfig,
    tracker: Arc<GenerationTracker>,
    integrator: Arc<Integrator>,
    audit: Arc<AuditTrail>,
}

impl Runtime {
    /// Open the log under `config.data_dir`, replay it, wire components, and
    /// seed the policy store if the log is empty.
    pub fn open(
        config: EvoConfig,
        proposer: Arc<dyn ChangeProposer>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self, EvoError> {
        let runtime = Self::open_unseeded(config, proposer, executor)?;
        if let Some(generation) = runtime.seed()? {
            info!(generation = generation.index, principles = generation.changes.len(), "policy store seeded");
        }
        Ok(runtime)
    }

    /// Like [`Runtime::open`], but an empty log stays empty.  For commands
    /// that only inspect or roll back history.
    pub fn open_unseeded(
        config: EvoConfig,
        proposer: Arc<dyn ChangeProposer>,
        executor: Arc<dyn SandboxExecutor>,
    ) -> Result<Self, EvoError> {
        let stores = Arc::new(Stores::with_policy_strategy(Arc::new(AmbientWeighted::default())));
        let tracker = Arc::new(GenerationTracker::open(config.log_path(), config.pipeline.sync_log, stores)?);
        let audit = Arc::new(AuditTrail::new(config.pipeline.audit_capacity));
        let integrator = Integrator::new(proposer, executor, Arc::clone(&tracker))
            .with_limits(config.limits())
            .with_audit(Arc::clone(&audit))
            .with_max_commit_retries(config.pipeline.max_commit_retries);
        Ok(Self { config, tracker, integrator: Arc::new(integrator), audit })
    }

    /// Process sandbox behind the configured worker pool.
    pub fn default_executor(config: &EvoConfig) -> Arc<dyn SandboxExecutor> {
        let sandbox = ProcessSandbox::new().with_network_isolation(config.sandbox.isolate_network);
        Arc::new(BoundedExecutor::new(sandbox, config.sandbox.max_concurrent))
    }

    /// Commit the configured seed principles when the log is empty.
    fn seed(&self) -> Result<Option<Arc<Generation>>, EvoError> {
        if !self.tracker.is_empty() || self.config.seed_principles.is_empty() {
            return Ok(None);
        }
        let features = KeywordFeatures::default();
        let mut draft = GenerationDraft::committed("seed principles");
        let mut seen = BTreeSet::new();
        for seed in &self.config.seed_principles {
            let artifact = CandidateArtifact::principle(seed.text.trim(), "seed");
            if !seen.insert(artifact.fingerprint()) {
                continue;
            }
            let mut tags = features.features(&ReasoningTask::new("seed", &seed.text));
            tags.extend(seed.category.iter().cloned());
            let entry = CapabilityEntry::new(artifact, 0, 1).with_tags(tags).with_confidence(Some(0.5));
            draft = draft.with_insert(StoreKind::Policies, entry, None);
        }
        Ok(Some(self.tracker.append(draft, None)?))
    }

    pub fn config(&self) -> &EvoConfig {
        &self.config
    }

    pub fn tracker(&self) -> &Arc<GenerationTracker> {
        &self.tracker
    }

    pub fn integrator(&self) -> &Arc<Integrator> {
        &self.integrator
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn self_modifier(&self, suites: Vec<(String, BenchmarkSuite)>) -> SelfModificationController {
        suites.into_iter().fold(
            SelfModificationController::new(Arc::clone(&self.integrator))
                .with_tolerance(self.config.self_modify.tolerance),
            |controller, (target, suite)| controller.with_suite(target, suite),
        )
    }

    pub fn reflection(&self, agent: Arc<dyn TaskAgent>, judge: Arc<dyn TaskJudge>) -> ReflectionCycle {
        ReflectionCycle::new(agent, judge, Arc::clone(&self.integrator)).with_top_k(self.config.reflection.top_k)
    }

    pub fn status(&self) -> StatusReport {
        let stores = self.tracker.stores();
        let (tools_active, tools_total) = {
            let tools = stores.read(StoreKind::Tools);
            (tools.active_count(), tools.len())
        };
        let (principles_active, principles_total) = {
            let policies = stores.read(StoreKind::Policies);
            (policies.active_count(), policies.len())
        };
        StatusReport {
            head: self.tracker.last_index(),
            generations: self.tracker.len(),
            tools_active,
            tools_total,
            principles_active,
            principles_total,
            audit: self.audit.stats(),
        }
    }

    // -----------------------------------------------------------------------
    // Run cycles
    // -----------------------------------------------------------------------

    /// Run every tool task (concurrently), then every component and every
    /// reasoning task (sequentially), `cycles` times.  Failed tasks are
    /// retried in the next cycle with their latest failure trace.  Reasoning
    /// tasks use the file's `[agent]`, judged against their expected answer.
    pub async fn run_cycles(&self, tasks: &TaskFile, cycles: u32, cancel: &CancelFlag) -> Result<RunReport, EvoError> {
        let contexts = tasks.tool_contexts();
        let suites = tasks.suites();
        let rationales: Vec<String> = tasks
            .components
            .iter()
            .map(|c| if c.rationale.is_empty() { format!("improve {}", c.target) } else { c.rationale.clone() })
            .collect();
        let controller = self.self_modifier(suites.clone());
        let reasoning = tasks.reasoning_tasks();
        let reflection = tasks.agent().map(|agent| self.reflection(agent, Arc::new(ExpectedAnswerJudge)));
        let mut report = RunReport::default();

        for cycle in 1..=cycles {
            if cancel.is_cancelled() {
                break;
            }
            let mut set = JoinSet::new();
            for (order, ctx) in contexts.iter().enumerate() {
                let mut ctx = ctx.clone();
                ctx.prior_failure_trace = self.audit.failures_for(&ctx.id).last().map(|r| r.detail.clone());
                let integrator = Arc::clone(&self.integrator);
                let cancel = cancel.clone();
                set.spawn(async move {
                    let outcome = integrator.run(&ctx, &cancel).await;
                    (order, ctx.id, outcome)
                });
            }
            let mut finished = Vec::with_capacity(contexts.len());
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => finished.push(result),
                    Err(e) => warn!(error = %e, "pipeline task aborted"),
                }
            }
            finished.sort_by_key(|(order, _, _)| *order);
            for (_, task, outcome) in finished {
                report.lines.push(CycleLine {
                    cycle,
                    task,
                    summary: outcome.to_string(),
                    committed: outcome.is_committed(),
                    failed: outcome.is_failure(),
                });
                if let PipelineOutcome::Failed { reason } = &outcome {
                    warn!(cycle, reason = %reason, "commit failed");
                }
            }

            for ((target, _), rationale) in suites.iter().zip(&rationales) {
                if cancel.is_cancelled() {
                    break;
                }
                let line = match controller.run(target, rationale).await {
                    Ok(proposal) => CycleLine {
                        cycle,
                        task: target.clone(),
                        summary: format!("{} (generation {})", proposal.decision, proposal.generation.index),
                        committed: proposal.decision.is_applied(),
                        failed: false,
                    },
                    Err(SelfModError::Integration(e)) => return Err(e.into()),
                    Err(e) => CycleLine { cycle, task: target.clone(), summary: e.to_string(), committed: false, failed: true },
                };
                report.lines.push(line);
            }

            if let Some(reflection) = &reflection {
                let lines = self.run_reasoning(reflection, &reasoning, cycle, cancel).await?;
                report.lines.extend(lines);
            }
        }
        info!(
            cycles,
            committed = report.committed(),
            failures = report.failures(),
            head = self.tracker.last_index(),
            "run finished"
        );
        Ok(report)
    }

    /// One pass of the two-attempt cycle over `tasks`, in order.
    pub async fn run_reasoning(
        &self,
        reflection: &ReflectionCycle,
        tasks: &[ReasoningTask],
        cycle: u32,
        cancel: &CancelFlag,
    ) -> Result<Vec<CycleLine>, EvoError> {
        let ambient = AmbientContext::new();
        let mut lines = Vec::with_capacity(tasks.len());
        for task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = reflection.run(task, &ambient).await?;
            lines.push(CycleLine {
                cycle,
                task: task.id.clone(),
                summary: outcome.to_string(),
                committed: matches!(
                    &outcome,
                    CycleOutcome::SolvedWithReflection { internalized, .. } if internalized.generation.is_some()
                ),
                failed: matches!(
                    outcome,
                    CycleOutcome::ReflectionUnavailable { .. } | CycleOutcome::InternalizationFailed { .. }
                ),
            });
        }
        Ok(lines)
    }
}
