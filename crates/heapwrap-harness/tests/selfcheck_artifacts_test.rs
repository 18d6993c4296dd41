use std::path::PathBuf;

use heapwrap_harness::report::{ARTIFACT_INDEX, SELF_CHECK_LOG, write_self_check};
use heapwrap_harness::run_self_check;
use heapwrap_harness::structured_log::{
    ArtifactIndex, LogEntry, Outcome, StreamKind, sha256_hex, validate_log_file,
};

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("heapwrap-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn self_check_writes_valid_log_and_index() {
    let dir = scratch_dir("selfcheck");
    let run = run_self_check(None);
    assert_eq!(run.failed(), 0, "{:#?}", run.reports);

    let artifacts = write_self_check(&run, &dir, "it-run").unwrap();
    assert_eq!(artifacts.log, dir.join(SELF_CHECK_LOG));
    assert_eq!(artifacts.index, dir.join(ARTIFACT_INDEX));

    let (lines, errors) = validate_log_file(&artifacts.log).unwrap();
    assert!(errors.is_empty(), "{errors:?}");
    // run_start + one verdict per scenario + lifecycle records + run_end
    assert_eq!(lines, run.reports.len() + run.lifecycle.len() + 2);

    let text = std::fs::read_to_string(&artifacts.log).unwrap();
    let entries: Vec<LogEntry> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(entries.first().unwrap().event, "run_start");
    assert_eq!(entries.last().unwrap().event, "run_end");
    let verdicts: Vec<_> = entries
        .iter()
        .filter(|e| e.event == "scenario_result")
        .collect();
    assert_eq!(verdicts.len(), run.reports.len());
    assert!(verdicts.iter().all(|e| e.outcome == Some(Outcome::Pass)));
    assert!(verdicts.iter().all(|e| e.errno.is_none()));
    assert!(
        entries
            .iter()
            .filter(|e| e.stream == Some(StreamKind::Selfcheck))
            .all(|e| e.trace_id.starts_with("heapwrap::it-run::"))
    );
    // Fork and registration events are recorded regardless of tracing.
    assert!(entries.iter().any(|e| e.event == "fork_lock"));
    assert!(entries.iter().any(|e| e.event == "zone_registered"));

    let index: ArtifactIndex =
        serde_json::from_str(&std::fs::read_to_string(&artifacts.index).unwrap()).unwrap();
    assert_eq!(index.run_id, "it-run");
    assert_eq!(index.artifacts.len(), 1);
    assert_eq!(index.artifacts[0].sha256, sha256_hex(text.as_bytes()));
    assert_eq!(index.artifacts[0].size_bytes, Some(text.len() as u64));

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn failing_verdicts_are_logged_as_errors() {
    let dir = scratch_dir("failing");
    let mut run = run_self_check(Some("calloc"));
    run.reports[0].outcome = Outcome::Fail;
    run.reports[0].detail = Some("forced".to_string());
    run.reports[0].errno = Some(12);

    let artifacts = write_self_check(&run, &dir, "it-fail").unwrap();
    let text = std::fs::read_to_string(&artifacts.log).unwrap();
    let forced: LogEntry = text
        .lines()
        .map(|l| serde_json::from_str::<LogEntry>(l).unwrap())
        .find(|e| e.outcome == Some(Outcome::Fail))
        .unwrap();
    assert_eq!(forced.errno, Some(12));
    assert_eq!(forced.details.unwrap()["detail"], "forced");
    let end: LogEntry = serde_json::from_str(text.lines().last().unwrap()).unwrap();
    assert_eq!(end.details.unwrap()["failed"], 1);

    std::fs::remove_dir_all(&dir).unwrap();
}
