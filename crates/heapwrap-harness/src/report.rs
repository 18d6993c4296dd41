//! Report builders behind the CLI subcommands.

use std::path::{Path, PathBuf};

use heapwrap_core::symbols::{PrimitiveSymbols, Redirection, redirections_for};
use serde::Serialize;

use crate::error::HarnessError;
use crate::scenarios::SelfCheck;
use crate::structured_log::{ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, StreamKind};

/// File name of the self-check JSONL log inside the output directory.
pub const SELF_CHECK_LOG: &str = "selfcheck.log.jsonl";
/// File name of the artifact index inside the output directory.
pub const ARTIFACT_INDEX: &str = "artifact_index.json";

/// Primitive names and redirections for one build configuration.
#[derive(Debug, Serialize)]
pub struct SymbolReport {
    pub prefix: String,
    pub target_os: String,
    pub primitive: PrimitiveSymbols,
    pub redirections: Vec<&'static Redirection>,
}

pub fn symbol_report(prefix: &str, target_os: &str) -> Result<SymbolReport, HarnessError> {
    Ok(SymbolReport {
        prefix: prefix.to_owned(),
        target_os: target_os.to_owned(),
        primitive: PrimitiveSymbols::with_prefix(prefix)?,
        redirections: redirections_for(target_os).collect(),
    })
}

/// Paths written by [`write_self_check`].
#[derive(Debug, Clone)]
pub struct SelfCheckArtifacts {
    pub log: PathBuf,
    pub index: PathBuf,
}

/// Write verdicts and lifecycle records as JSONL, then index the log.
pub fn write_self_check(
    run: &SelfCheck,
    out_dir: &Path,
    run_id: &str,
) -> Result<SelfCheckArtifacts, HarnessError> {
    std::fs::create_dir_all(out_dir).map_err(HarnessError::io(out_dir))?;
    let log_path = out_dir.join(SELF_CHECK_LOG);
    let index_path = out_dir.join(ARTIFACT_INDEX);

    let mut emitter = LogEmitter::to_file(&log_path, run_id).map_err(HarnessError::io(&log_path))?;
    let mut write = |entry: LogEntry| emitter.emit_entry(entry).map_err(HarnessError::io(&log_path));

    write(
        LogEntry::new("", LogLevel::Info, "run_start")
            .with_stream(StreamKind::Selfcheck)
            .with_details(serde_json::json!({ "scenarios": run.reports.len() })),
    )?;
    for report in &run.reports {
        let level = match report.outcome {
            Outcome::Fail => LogLevel::Error,
            Outcome::Pass | Outcome::Skip => LogLevel::Info,
        };
        let mut entry = LogEntry::new("", level, "scenario_result")
            .with_stream(StreamKind::Selfcheck)
            .with_scenario(report.name)
            .with_symbol(report.symbol)
            .with_outcome(report.outcome)
            .with_duration_ns(report.duration_ns);
        if let Some(detail) = &report.detail {
            entry = entry.with_details(serde_json::json!({ "detail": detail }));
        }
        if let Some(errno) = report.errno {
            entry = entry.with_errno(errno);
        }
        write(entry)?;
    }
    for record in &run.lifecycle {
        write(LogEntry::from_lifecycle(record))?;
    }
    let failed = run.failed();
    write(
        LogEntry::new(
            "",
            if failed == 0 { LogLevel::Info } else { LogLevel::Error },
            "run_end",
        )
        .with_stream(StreamKind::Selfcheck)
        .with_artifacts(vec![ARTIFACT_INDEX.to_string()])
        .with_details(serde_json::json!({
            "passed": run.reports.len() - failed,
            "failed": failed,
            "lifecycle_records": run.lifecycle.len(),
        })),
    )?;
    emitter.flush().map_err(HarnessError::io(&log_path))?;
    drop(emitter);

    let mut index = ArtifactIndex::new(run_id);
    index
        .add_file(&log_path, "log")
        .map_err(HarnessError::io(&log_path))?;
    std::fs::write(&index_path, index.to_json()?).map_err(HarnessError::io(&index_path))?;

    Ok(SelfCheckArtifacts {
        log: log_path,
        index: index_path,
    })
}
