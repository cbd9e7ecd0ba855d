use pgbranch::process::{
    EXCERPT_LINES, FAILURE_SENTINEL, ProcessMonitor, ProcessStatus, SUCCESS_SENTINEL,
};
use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

fn temp_monitor(tag: &str) -> (ProcessMonitor, std::path::PathBuf) {
    let mut hasher = DefaultHasher::new();
    SystemTime::now().hash(&mut hasher);
    tag.hash(&mut hasher);
    let dir = std::env::temp_dir().join(format!("pgbranch_test_{}_{}", tag, hasher.finish()));
    fs::create_dir_all(&dir).unwrap();
    (ProcessMonitor::new(dir.clone(), dir.clone()), dir)
}

/// A PID that certainly belonged to a process that has exited.
fn dead_pid() -> i32 {
    let child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;
    let mut child = child;
    child.wait().unwrap();
    pid
}

#[test]
fn alive_pid_reports_running() {
    let (monitor, dir) = temp_monitor("alive");
    let me = std::process::id();
    fs::write(monitor.pid_path("op"), me.to_string()).unwrap();
    fs::write(monitor.log_path("op"), "starting\n").unwrap();

    assert!(monitor.is_running("op"));
    assert_eq!(monitor.status("op"), ProcessStatus::Running);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn dead_pid_file_is_removed_and_reported_not_running() {
    let (monitor, dir) = temp_monitor("dead");
    fs::write(monitor.pid_path("op"), dead_pid().to_string()).unwrap();

    assert!(!monitor.is_running("op"));
    // The stale marker is gone; a second check does not need it.
    assert!(!monitor.pid_path("op").exists());

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn unparseable_pid_file_counts_as_stale() {
    let (monitor, dir) = temp_monitor("garbled");
    fs::write(monitor.pid_path("op"), "not-a-pid\n").unwrap();

    assert!(!monitor.is_running("op"));
    assert!(!monitor.pid_path("op").exists());

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn success_sentinel_yields_success() {
    let (monitor, dir) = temp_monitor("success");
    fs::write(
        monitor.log_path("op"),
        format!("phase one done\n{SUCCESS_SENTINEL}\n"),
    )
    .unwrap();

    assert_eq!(monitor.status("op"), ProcessStatus::Success);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn failure_sentinel_yields_failed_with_trailing_excerpt() {
    let (monitor, dir) = temp_monitor("failure");

    // 60 lines of context, then the sentinel; no PID file.
    let mut log = String::new();
    for i in 0..60 {
        log.push_str(&format!("line {i}\n"));
    }
    log.push_str(FAILURE_SENTINEL);
    log.push('\n');
    fs::write(monitor.log_path("op"), &log).unwrap();

    match monitor.status("op") {
        ProcessStatus::Failed { excerpt } => {
            let lines: Vec<&str> = excerpt.lines().collect();
            assert_eq!(lines.len(), EXCERPT_LINES);
            assert_eq!(*lines.last().unwrap(), FAILURE_SENTINEL);
            assert_eq!(lines[0], "line 11");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn last_sentinel_wins_on_retried_operations() {
    let (monitor, dir) = temp_monitor("retry");
    fs::write(
        monitor.log_path("op"),
        format!("{FAILURE_SENTINEL}\nsecond attempt\n{SUCCESS_SENTINEL}\n"),
    )
    .unwrap();

    assert_eq!(monitor.status("op"), ProcessStatus::Success);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn exited_without_sentinel_is_unknown() {
    let (monitor, dir) = temp_monitor("unknown");
    fs::write(monitor.log_path("op"), "started\nworking\n").unwrap();

    assert_eq!(monitor.status("op"), ProcessStatus::Unknown);

    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn no_markers_at_all_is_not_found() {
    let (monitor, dir) = temp_monitor("notfound");
    assert_eq!(monitor.status("missing"), ProcessStatus::NotFound);
    assert_eq!(monitor.last_log_lines("missing", 10), "");
    fs::remove_dir_all(dir).unwrap();
}

#[test]
fn sentinel_must_match_the_whole_line() {
    let (monitor, dir) = temp_monitor("substring");
    fs::write(
        monitor.log_path("op"),
        format!("note: {SUCCESS_SENTINEL} would appear here\n"),
    )
    .unwrap();

    assert_eq!(monitor.status("op"), ProcessStatus::Unknown);

    fs::remove_dir_all(dir).unwrap();
}
