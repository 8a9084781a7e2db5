use clap::Parser;
use colored::*;
use evoagent::cli::{self, Args, Command};
use evoagent::error::{EvoError, EXIT_FAILURE, EXIT_OK};
use evoagent::integrator::CancelFlag;
use evoagent::ledger;
use evoagent::oracle::ScriptedProposer;
use evoagent::runtime::Runtime;
use evoagent::tasks::TaskFile;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Logs go to stderr; stdout carries the reports.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

async fn run(args: Args) -> Result<i32, EvoError> {
    let config = cli::resolve_config(&args)?;

    match args.command {
        Command::Run { cycles, tasks } => {
            let file = TaskFile::load(&tasks)?;
            let executor = Runtime::default_executor(&config);
            let runtime = Runtime::open(config, file.proposer()?, executor)?;

            let cancel = CancelFlag::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; stopping after the current step");
                    on_interrupt.cancel();
                }
            });

            let report = runtime.run_cycles(&file, cycles, &cancel).await?;
            print!("{}", cli::format_run(&report));
            Ok(if report.failures() > 0 { EXIT_FAILURE } else { EXIT_OK })
        }
        Command::Status => {
            let runtime = open_idle(config)?;
            print!("{}", cli::format_status(&runtime.status()));
            Ok(EXIT_OK)
        }
        Command::History { limit } => {
            let runtime = open_idle(config)?;
            let generations: Vec<_> = runtime.tracker().history().collect();
            print!("{}", cli::format_history(generations.iter().map(|g| g.as_ref()), limit));
            Ok(EXIT_OK)
        }
        Command::Rollback { to } => {
            let runtime = open_idle(config)?;
            let generation = runtime.tracker().rollback(to)?;
            println!("{}", cli::format_generation(&generation));
            Ok(EXIT_OK)
        }
        Command::Repair => {
            let report = ledger::repair(config.log_path())?;
            print!("{}", cli::format_repair(&report));
            Ok(EXIT_OK)
        }
    }
}

/// Runtime for commands that never propose or execute anything.  An empty
/// log is left unseeded.
fn open_idle(config: evoagent::config::EvoConfig) -> Result<Runtime, EvoError> {
    let executor = Runtime::default_executor(&config);
    Runtime::open_unseeded(config, Arc::new(ScriptedProposer::new()), executor)
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Args::parse();
    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if e.is_corrupted_log() {
                eprintln!("run `evoagent repair` to truncate the log to its last valid record");
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}
