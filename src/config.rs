//! # Stage: Configuration
//!
//! ## Responsibility
//! Parse `evoagent.toml` into an [`EvoConfig`] and check the semantic
//! constraints the type system cannot express.  Every field has a default,
//! so an empty file (or no file) is a valid configuration.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - Validation collects every violation before returning
//! - I/O, parse and validation failures are distinct error variants, each
//!   naming the source file

use crate::sandbox::ResourceLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Parse error in {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField { field: String, value: String, reason: String },

    #[error("IO error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidField { field: field.to_string(), value: value.to_string(), reason: reason.to_string() }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub teardown_grace_ms: u64,
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    /// Run candidates without network access where the platform allows.
    pub isolate_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            teardown_grace_ms: 2_000,
            max_output_bytes: 64 * 1024,
            max_concurrent: 4,
            isolate_network: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub max_commit_retries: u32,
    /// Attempt records kept in memory for `status`.
    pub audit_capacity: usize,
    /// fsync the generation log after every append.
    pub sync_log: bool,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self { max_commit_retries: 3, audit_capacity: 1024, sync_log: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfModifySection {
    /// Allowed relative regression, in `[0, 1)`.
    pub tolerance: f64,
}

impl Default for SelfModifySection {
    fn default() -> Self {
        Self { tolerance: 0.05 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionSection {
    pub top_k: usize,
}

impl Default for ReflectionSection {
    fn default() -> Self {
        Self { top_k: 5 }
    }
}

/// A principle committed in the first generation of an empty log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedPrinciple {
    pub text: String,
    #[serde(default)]
    pub category: Option<String>,
}

impl SeedPrinciple {
    fn new(text: &str, category: &str) -> Self {
        Self { text: text.to_string(), category: Some(category.to_string()) }
    }
}

fn default_seed_principles() -> Vec<SeedPrinciple> {
    vec![
        SeedPrinciple::new("When a task is unclear, break it into concrete sub-steps before executing", "general"),
        SeedPrinciple::new(
            "When encountering unfamiliar data format, first inspect structure before processing",
            "data",
        ),
        SeedPrinciple::new(
            "When a direct approach fails, try decomposing the problem into smaller pieces",
            "general",
        ),
        SeedPrinciple::new(
            "When dealing with lists or collections, verify they are non-empty before operations",
            "data",
        ),
    ]
}

// ---------------------------------------------------------------------------
// EvoConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvoConfig {
    /// Directory holding `generations.jsonl`.
    pub data_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub pipeline: PipelineSection,
    pub self_modify: SelfModifySection,
    pub reflection: ReflectionSection,
    pub seed_principles: Vec<SeedPrinciple>,
}

impl Default for EvoConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".evoagent"),
            sandbox: SandboxConfig::default(),
            pipeline: PipelineSection::default(),
            self_modify: SelfModifySection::default(),
            reflection: ReflectionSection::default(),
            seed_principles: default_seed_principles(),
        }
    }
}

impl EvoConfig {
    /// Path of the generation log.
    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join(crate::ledger::LOG_FILE)
    }

    pub fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_millis(self.sandbox.timeout_ms),
            teardown_grace: Duration::from_millis(self.sandbox.teardown_grace_ms),
            max_output_bytes: self.sandbox.max_output_bytes,
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Check every semantic constraint, collecting all violations.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        if self.data_dir.as_os_str().is_empty() {
            errors.push(invalid("data_dir", "\"\"", "must not be empty"));
        }
        if self.sandbox.timeout_ms == 0 {
            errors.push(invalid("sandbox.timeout_ms", 0, "must be positive"));
        }
        if self.sandbox.max_output_bytes == 0 {
            errors.push(invalid("sandbox.max_output_bytes", 0, "must be positive"));
        }
        if self.sandbox.max_concurrent == 0 {
            errors.push(invalid("sandbox.max_concurrent", 0, "must be at least 1"));
        }
        let tolerance = self.self_modify.tolerance;
        if !tolerance.is_finite() || !(0.0..1.0).contains(&tolerance) {
            errors.push(invalid("self_modify.tolerance", tolerance, "must be in [0, 1)"));
        }
        if self.reflection.top_k == 0 {
            errors.push(invalid("reflection.top_k", 0, "must be at least 1"));
        }
        for (i, seed) in self.seed_principles.iter().enumerate() {
            if seed.text.trim().is_empty() {
                errors.push(invalid(&format!("seed_principles[{}].text", i), "\"\"", "must not be blank"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load and validate a config file.
///
/// # Errors
///
/// [`ConfigError::Io`] when unreadable, [`ConfigError::Parse`] for malformed
/// TOML, [`ConfigError::Validation`] when constraints are violated.
pub fn load_from_file(path: &Path) -> Result<EvoConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&content, &path.display().to_string())
}

/// Load and validate a config from a TOML string.  `source_name` only
/// appears in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<EvoConfig, ConfigError> {
    let config: EvoConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;
    config.validate().map_err(|errors| {
        ConfigError::Validation(errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("\n"))
    })?;
    Ok(config)
}
