use crate::config::{self, ConfigError, EvoConfig};
use crate::generation::{Generation, GenerationOutcome};
use crate::ledger::RepairReport;
use crate::runtime::{RunReport, StatusReport};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "evoagent")]
#[command(version)]
#[command(about = "Propose, sandbox-test, commit and roll back agent capabilities")]
pub struct Args {
    /// Config file (TOML); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory holding the generation log
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Feed a task file through the pipeline
    Run {
        /// Number of passes over the task file
        #[arg(long, default_value = "1")]
        cycles: u32,

        /// Task file (TOML)
        #[arg(long)]
        tasks: PathBuf,
    },
    /// Current generation and store sizes
    Status,
    /// Generation timeline, oldest first
    History {
        /// Show only the most recent N generations
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Restore the active set as it was right after generation N
    Rollback {
        #[arg(long)]
        to: u64,
    },
    /// Truncate the generation log to its last valid record
    Repair,
}

/// Config from `--config` (or defaults), with `--data-dir` applied on top.
pub fn resolve_config(args: &Args) -> Result<EvoConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => config::load_from_file(path)?,
        None => EvoConfig::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Report formatting
// ---------------------------------------------------------------------------

pub fn format_status(status: &StatusReport) -> String {
    let head = status.head.map_or_else(|| "none".to_string(), |h| h.to_string());
    let mut out = String::new();
    out.push_str(&format!("{} {}\n", "generation:".bold(), head));
    out.push_str(&format!("{} {}\n", "generations:".bold(), status.generations));
    out.push_str(&format!(
        "{} {} active / {} total\n",
        "tools:".bold(),
        status.tools_active,
        status.tools_total
    ));
    out.push_str(&format!(
        "{} {} active / {} total\n",
        "principles:".bold(),
        status.principles_active,
        status.principles_total
    ));
    out.push_str(&format!(
        "{} {} attempts, {:.0}% successful\n",
        "session:".bold(),
        status.audit.total,
        status.audit.success_rate * 100.0
    ));
    out
}

pub fn format_generation(generation: &Generation) -> String {
    let outcome = match generation.outcome {
        GenerationOutcome::Committed => generation.outcome.to_string().green(),
        GenerationOutcome::Reverted => generation.outcome.to_string().yellow(),
    };
    let mut line = format!("#{:<4} {:<9} {}", generation.index, outcome, generation.rationale);
    if let Some(to) = generation.rollback_of {
        line.push_str(&format!(" {}", format!("[rollback to {}]", to).cyan()));
    }
    for change in &generation.changes {
        line.push_str(&format!("\n       {}", change));
    }
    if let Some(perf) = &generation.performance {
        let before = perf.before.as_ref().map_or_else(|| "no baseline".to_string(), |b| b.to_string());
        line.push_str(&format!("\n       before: {}\n       after:  {}", before, perf.after));
    }
    line
}

pub fn format_history<'a>(generations: impl IntoIterator<Item = &'a Generation>, limit: Option<usize>) -> String {
    let all: Vec<&Generation> = generations.into_iter().collect();
    let skip = limit.map_or(0, |n| all.len().saturating_sub(n));
    if all.is_empty() {
        return "no generations yet\n".to_string();
    }
    all[skip..].iter().map(|g| format_generation(g) + "\n").collect()
}

pub fn format_run(report: &RunReport) -> String {
    let mut out = String::new();
    for line in &report.lines {
        let marker = if line.committed {
            "+".green()
        } else if line.failed {
            "x".red()
        } else {
            "=".normal()
        };
        out.push_str(&format!("[cycle {}] {} {}: {}\n", line.cycle, marker, line.task, line.summary));
    }
    out.push_str(&format!(
        "{} committed, {} failed\n",
        report.committed(),
        report.failures()
    ));
    out
}

pub fn format_repair(report: &RepairReport) -> String {
    if report.dropped_bytes == 0 {
        format!("log intact: {} records\n", report.kept)
    } else {
        format!("kept {} records, dropped {} bytes\n", report.kept, report.dropped_bytes)
    }
}
