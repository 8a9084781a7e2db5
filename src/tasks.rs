//! Task files: the work `evoagent run` feeds through the pipeline.
//!
//! ```toml
//! [proposer]                       # optional; otherwise candidates are replayed
//! command = ["python3", "propose.py"]
//!
//! [[tool]]
//! id = "csv-validate-v1"
//! description = "Validate a CSV row count"
//! slot = "validate_csv"
//! candidates = ["validate_csv() { ... }"]
//! [tool.harness]
//! name = "csv"
//! language = "sh"
//! driver = ". ./artifact.sh; ..."
//!
//! [[component]]
//! target = "planner"
//! rationale = "reduce planning latency"
//! candidates = ["..."]
//! [[component.cases]]
//! name = "case-0"
//! language = "python"
//! driver = "..."
//!
//! [agent]                          # required by [[reasoning]] tasks
//! command = ["python3", "attempt.py"]
//!
//! [[reasoning]]
//! id = "add-carry"
//! description = "Add 17 and 25"
//! expected = "42"
//! candidates = ["carry the tens digit"]   # replayed reflections
//! ```

use crate::integrator::TaskContext;
use crate::oracle::{
    ChangeProposer, CommandAgent, CommandProposer, ProposalError, ReasoningTask, ScriptedProposer, TaskAgent,
};
use crate::sandbox::TestHarness;
use crate::self_modify::BenchmarkSuite;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum TaskFileError {
    #[error("IO error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid task file {file}: {reason}")]
    Invalid { file: String, reason: String },

    #[error(transparent)]
    Proposer(#[from] ProposalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Sh,
    Python,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HarnessSpec {
    pub name: String,
    #[serde(default = "default_language")]
    pub language: Language,
    pub driver: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_language() -> Language {
    Language::Sh
}

impl HarnessSpec {
    pub fn to_harness(&self) -> TestHarness {
        let base = match self.language {
            Language::Sh => TestHarness::shell(&self.name, &self.driver),
            Language::Python => TestHarness::python(&self.name, &self.driver),
        };
        self.env.iter().fold(base, |h, (k, v)| h.with_env(k, v))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProposerSpec {
    pub command: Vec<String>,
    #[serde(default = "default_proposer_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_proposer_timeout_ms() -> u64 {
    60_000
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolTask {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub candidates: Vec<String>,
    pub harness: HarnessSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ComponentTask {
    pub target: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub candidates: Vec<String>,
    pub cases: Vec<HarnessSpec>,
}

/// External agent attempting `[[reasoning]]` tasks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentSpec {
    pub command: Vec<String>,
    #[serde(default = "default_proposer_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReasoningSpec {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub expected: Option<String>,
    /// Reflections replayed by the scripted proposer.
    #[serde(default)]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TaskFile {
    #[serde(default)]
    pub proposer: Option<ProposerSpec>,
    #[serde(default)]
    pub agent: Option<AgentSpec>,
    #[serde(default)]
    pub reasoning: Vec<ReasoningSpec>,
    #[serde(default, rename = "tool")]
    pub tools: Vec<ToolTask>,
    #[serde(default, rename = "component")]
    pub components: Vec<ComponentTask>,
}

impl TaskFile {
    pub fn load(path: &Path) -> Result<Self, TaskFileError> {
        let content = std::fs::read_to_string(path).map_err(|e| TaskFileError::Io {
            file: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.display().to_string())
    }

    pub fn parse(content: &str, source_name: &str) -> Result<Self, TaskFileError> {
        let file: TaskFile = toml::from_str(content).map_err(|e| TaskFileError::Parse {
            file: source_name.to_string(),
            source: e,
        })?;
        file.validate()
            .map_err(|reason| TaskFileError::Invalid { file: source_name.to_string(), reason })?;
        Ok(file)
    }

    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for tool in &self.tools {
            if tool.id.trim().is_empty() {
                return Err("tool with empty id".into());
            }
            if !seen.insert(tool.id.as_str()) {
                return Err(format!("duplicate tool id '{}'", tool.id));
            }
        }
        for component in &self.components {
            if !seen.insert(component.target.as_str()) {
                return Err(format!("component '{}' clashes with another task", component.target));
            }
            if component.cases.is_empty() {
                return Err(format!("component '{}' has no benchmark cases", component.target));
            }
        }
        for task in &self.reasoning {
            if task.id.trim().is_empty() {
                return Err("reasoning task with empty id".into());
            }
            if !seen.insert(task.id.as_str()) {
                return Err(format!("reasoning task '{}' clashes with another task", task.id));
            }
        }
        if let Some(proposer) = &self.proposer {
            if proposer.command.is_empty() {
                return Err("proposer command is empty".into());
            }
        }
        match &self.agent {
            Some(agent) if agent.command.is_empty() => Err("agent command is empty".into()),
            None if !self.reasoning.is_empty() => Err("reasoning tasks need an [agent]".into()),
            _ => Ok(()),
        }
    }

    /// The external proposer when one is configured, otherwise a scripted
    /// proposer replaying each task's `candidates` in order.
    pub fn proposer(&self) -> Result<Arc<dyn ChangeProposer>, TaskFileError> {
        if let Some(spec) = &self.proposer {
            let proposer = CommandProposer::new(&spec.command, Duration::from_millis(spec.timeout_ms))?;
            return Ok(Arc::new(proposer));
        }
        let scripted = ScriptedProposer::new();
        for tool in &self.tools {
            scripted.push(tool.id.clone(), tool.candidates.iter().cloned());
        }
        for component in &self.components {
            scripted.push(component.target.clone(), component.candidates.iter().cloned());
        }
        for task in &self.reasoning {
            scripted.push(task.id.clone(), task.candidates.iter().cloned());
        }
        Ok(Arc::new(scripted))
    }

    /// The configured agent; `None` when the file has no `[agent]`.
    pub fn agent(&self) -> Option<Arc<dyn TaskAgent>> {
        let spec = self.agent.as_ref()?;
        let agent = CommandAgent::new(&spec.command, Duration::from_millis(spec.timeout_ms))?;
        Some(Arc::new(agent))
    }

    pub fn reasoning_tasks(&self) -> Vec<ReasoningTask> {
        self.reasoning
            .iter()
            .map(|spec| {
                let task = ReasoningTask::new(&spec.id, &spec.description);
                match &spec.expected {
                    Some(expected) => task.with_expected(expected),
                    None => task,
                }
            })
            .collect()
    }

    pub fn tool_contexts(&self) -> Vec<TaskContext> {
        self.tools
            .iter()
            .map(|tool| {
                let mut ctx = TaskContext::new(&tool.id, &tool.description, tool.harness.to_harness())
                    .with_tags(tool.tags.iter().cloned());
                if let Some(slot) = &tool.slot {
                    ctx = ctx.with_slot(slot);
                }
                ctx
            })
            .collect()
    }

    pub fn suites(&self) -> Vec<(String, BenchmarkSuite)> {
        self.components
            .iter()
            .map(|c| {
                let cases = c.cases.iter().map(HarnessSpec::to_harness).collect();
                (c.target.clone(), BenchmarkSuite::new(format!("{}-bench", c.target), cases))
            })
            .collect()
    }
}
