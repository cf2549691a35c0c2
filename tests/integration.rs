//! Integration tests driving the banwatch binary.
//!
//! Nothing here needs root: the engine test uses `run --dry-run` and every
//! path points into a temporary directory.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use chrono::Utc;
use tempfile::TempDir;

use banwatch::records::BanRecord;
use banwatch::status::StatusSnapshot;
use banwatch::store::{JsonStore, Store};

/// Path to the compiled binary
fn get_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_banwatch"))
}

/// Run banwatch and return output
fn run_banwatch(args: &[&str]) -> std::process::Output {
    Command::new(get_binary_path())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to execute banwatch")
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// A config whose every path lives under `dir`.
fn write_config(dir: &Path, sources: &str) -> PathBuf {
    let yaml = format!(
        "engine:\n  poll_interval: 1s\n  sweep_interval: 1h\n\
         paths:\n  store: {d}/records.json\n  status: {d}/status.json\n  lock: {d}/banwatch.lock\n\
         sources:\n{sources}",
        d = dir.display(),
        sources = sources
    );
    let path = dir.join("config.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

fn test_source(dir: &Path) -> String {
    format!(
        "  - id: test\n    locator: {}/test.log\n    pattern: '^test.*<IP>.*300$'\n    max_matches: 3\n    find_time: 10m\n    ban_time: 1h\n",
        dir.display()
    )
}

#[test]
fn test_version_command() {
    let output = run_banwatch(&["version"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains(&format!("banwatch {}", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn test_help_command() {
    let output = run_banwatch(&["--help"]);
    assert!(output.status.success());
    let out = stdout(&output);
    for cmd in ["run", "check", "validate", "status", "bans", "unban", "sample-config"] {
        assert!(out.contains(cmd), "help lacks {}: {}", cmd, out);
    }
}

#[test]
fn test_sample_config_is_valid() {
    let output = run_banwatch(&["sample-config"]);
    assert!(output.status.success());
    let config: banwatch::Config = serde_yaml::from_str(&stdout(&output)).unwrap();
    config.validate().unwrap();
    assert_eq!(config.sources.len(), 2);
    assert!(config.sources.iter().any(|s| s.paused));
}

#[test]
fn test_check_reports_matches_and_ignored() {
    let output = run_banwatch(&[
        "check",
        "--pattern",
        "^test.*<IP>.*300$",
        "--ignore",
        "10.0.0.0/8",
        "test 1.2.3.4 300",
        "test 10.9.8.7 300",
        "test 1.2.3.4 301",
    ]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("MATCH   1.2.3.4"), "{}", out);
    assert!(out.contains("IGNORED 10.9.8.7"), "{}", out);
    assert!(out.contains("3 line(s): 1 match(es), 1 ignored"), "{}", out);
}

#[test]
fn test_check_reads_stdin() {
    let mut child = Command::new(get_binary_path())
        .args(["check", "-p", "from <IP>"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"login from 5.6.7.8\nnothing here\n")
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("2 line(s): 1 match(es), 0 ignored"));
}

#[test]
fn test_check_rejects_pattern_without_placeholder() {
    let output = run_banwatch(&["check", "--pattern", "no address here", "line"]);
    assert!(!output.status.success());
}

#[test]
fn test_validate_lists_sources() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &test_source(dir.path()));
    let output = run_banwatch(&["validate", "-c", config.to_str().unwrap()]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Configuration OK"));
    assert!(out.contains("ban after 3 matches in 10m, for 1h"), "{}", out);
}

#[test]
fn test_validate_rejects_duplicate_sources() {
    let dir = TempDir::new().unwrap();
    let source = test_source(dir.path());
    let config = write_config(dir.path(), &format!("{}{}", source, source));
    let output = run_banwatch(&["validate", "-c", config.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Duplicate source id"));
}

#[test]
fn test_status_without_engine() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "  []\n");
    let output = run_banwatch(&["status", "-c", config.to_str().unwrap()]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("NO STATUS"));
}

#[tokio::test]
async fn test_unban_lifts_bans_offline() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &test_source(dir.path()));
    {
        let store = JsonStore::open(&dir.path().join("records.json")).unwrap();
        store
            .create_ban(BanRecord::new(
                "1.2.3.4".parse().unwrap(),
                "test",
                Utc::now(),
                Duration::from_secs(3_600),
            ))
            .await
            .unwrap();
    }

    let listed = run_banwatch(&["bans", "-c", config.to_str().unwrap()]);
    assert!(stdout(&listed).contains("1.2.3.4"));

    let output = run_banwatch(&["unban", "1.2.3.4", "-c", config.to_str().unwrap()]);
    assert!(output.status.success(), "{:?}", output);
    assert!(stdout(&output).contains("Lifted ban #1 (test)"));

    let listed = run_banwatch(&["bans", "-c", config.to_str().unwrap()]);
    assert!(stdout(&listed).contains("No active bans."));

    let store = JsonStore::open(&dir.path().join("records.json")).unwrap();
    assert_eq!(store.unbans().await.unwrap().len(), 1);
}

#[test]
fn test_unban_rejects_bad_address() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "  []\n");
    let output = run_banwatch(&["unban", "1.2.3", "-c", config.to_str().unwrap()]);
    assert!(!output.status.success());
}

fn active_bans_on_disk(path: &Path) -> usize {
    let Ok(content) = std::fs::read_to_string(path) else {
        return 0;
    };
    let Ok(json) = serde_json::from_str::<serde_json::Value>(&content) else {
        return 0;
    };
    json["bans"]
        .as_array()
        .map(|bans| bans.iter().filter(|b| b["active"] == true).count())
        .unwrap_or(0)
}

#[test]
fn test_run_dry_run_bans_and_shuts_down_cleanly() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("test.log");
    std::fs::write(&log, "").unwrap();
    let config = write_config(dir.path(), &test_source(dir.path()));

    let child = Command::new(get_binary_path())
        .args(["run", "--dry-run", "-c", config.to_str().unwrap()])
        .env_remove("RUST_LOG")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    // Give the engine time to set up and start tailing
    std::thread::sleep(Duration::from_millis(1500));
    let mut f = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
    f.write_all(b"test 1.2.3.4 300\ntest 1.2.3.4 300\ntest 1.2.3.4 300\n")
        .unwrap();

    let store = dir.path().join("records.json");
    let deadline = Instant::now() + Duration::from_secs(10);
    while active_bans_on_disk(&store) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }

    // SAFETY: signalling the child we spawned
    unsafe {
        libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
    }
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success(), "{:?}", output);
    assert_eq!(active_bans_on_disk(&store), 1);

    let logs = stdout(&output);
    assert!(logs.contains("iptables -I banwatch -s 1.2.3.4/32"), "{}", logs);
    assert!(logs.contains("iptables -X banwatch"), "{}", logs);

    let status = StatusSnapshot::load(&dir.path().join("status.json"))
        .unwrap()
        .unwrap();
    assert_eq!(status.active_bans, 1);
    assert_eq!(status.applied_rules, 0);
}
