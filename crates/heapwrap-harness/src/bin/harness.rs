//! CLI entrypoint for the heapwrap verification harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use heapwrap_core::symbols::DEFAULT_EXPORT_PREFIX;
use heapwrap_harness::report::{symbol_report, write_self_check};
use heapwrap_harness::scenarios::scenario_names;
use heapwrap_harness::structured_log::{Outcome, validate_log_file};
use heapwrap_harness::{HarnessError, run_self_check};

/// Verification tooling for heapwrap.
#[derive(Debug, Parser)]
#[command(name = "heapwrap-harness")]
#[command(about = "Policy self-checks and symbol reports for heapwrap")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the primitive names and redirection table as JSON.
    Symbols {
        /// Primitive symbol prefix.
        #[arg(long, default_value = DEFAULT_EXPORT_PREFIX)]
        prefix: String,
        /// Target OS whose redirections to list (`linux`, `macos`, ...).
        #[arg(long, default_value = std::env::consts::OS)]
        target_os: String,
    },
    /// Run the allocation policy scenarios over the reference primitive.
    SelfCheck {
        /// Directory for the JSONL log and artifact index.
        #[arg(long, default_value = "target/heapwrap/selfcheck")]
        out_dir: PathBuf,
        /// Run identifier stamped into every trace id.
        #[arg(long, default_value = "selfcheck")]
        run_id: String,
        /// Only run scenarios whose name contains this string.
        #[arg(long)]
        filter: Option<String>,
        /// List scenario names and exit.
        #[arg(long)]
        list: bool,
    },
    /// Validate a JSONL log against the structured log contract.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn main() {
    if let Err(err) = run(Cli::parse()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), HarnessError> {
    match cli.command {
        Command::Symbols { prefix, target_os } => {
            let report = symbol_report(&prefix, &target_os)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::SelfCheck {
            out_dir,
            run_id,
            filter,
            list,
        } => {
            if list {
                for name in scenario_names() {
                    println!("{name}");
                }
                return Ok(());
            }
            let run = run_self_check(filter.as_deref());
            for report in &run.reports {
                let tag = match report.outcome {
                    Outcome::Pass => "PASS",
                    Outcome::Fail => "FAIL",
                    Outcome::Skip => "SKIP",
                };
                match &report.detail {
                    Some(detail) => eprintln!("[{tag}] {}: {detail}", report.name),
                    None => eprintln!("[{tag}] {}", report.name),
                }
            }
            let artifacts = write_self_check(&run, &out_dir, &run_id)?;
            eprintln!("Wrote {}", artifacts.log.display());
            eprintln!("Wrote {}", artifacts.index.display());
            let failed = run.failed();
            if failed > 0 {
                return Err(HarnessError::SelfCheckFailed {
                    failed,
                    total: run.reports.len(),
                });
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log).map_err(HarnessError::io(&log))?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(HarnessError::InvalidLog {
                    path: log,
                    errors: errors.len(),
                    lines,
                });
            }
            eprintln!("{}: {lines} valid lines", log.display());
        }
    }
    Ok(())
}
