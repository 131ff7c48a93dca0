use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use regex::Regex;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn mirrors(data_dir: &Path) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("mirrors").into();
    cmd.env("MIRRORS_DATA_DIR", data_dir);
    cmd.timeout(Duration::from_secs(30));
    cmd
}

fn write_config(dir: &Path, sched_expr: &str) -> PathBuf {
    let updater = dir.join("update.sh");
    std::fs::write(&updater, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&updater, std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = dir.join("mirrors.toml");
    std::fs::write(
        &config,
        format!(
            r#"
[main]
country = "CN"
location = "Shanghai"

[site.alpine]
master_dir = "{master}/alpine"
updater = "{updater}"
sched_type = "interval"
sched_expr = "6h"

[site.gentoo]
master_dir = "{master}/gentoo"
updater = "{updater}"
sched_type = "cron"
sched_expr = "{sched_expr}"
"#,
            master = dir.display(),
            updater = updater.display(),
        ),
    )
    .unwrap();
    config
}

fn spawn_daemon(data_dir: &Path, config: &Path) -> Child {
    let child = std::process::Command::new(env!("CARGO_BIN_EXE_mirrors"))
        .args(["daemon", "--config"])
        .arg(config)
        .env("MIRRORS_DATA_DIR", data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let socket = data_dir.join("mirrors.sock");
    let start = Instant::now();
    while !socket.exists() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "daemon socket was not created"
        );
        std::thread::sleep(Duration::from_millis(50));
    }
    child
}

fn wait_for_exit(child: &mut Child) {
    let start = Instant::now();
    while child.try_wait().unwrap().is_none() {
        if start.elapsed() > Duration::from_secs(10) {
            let _ = child.kill();
            panic!("daemon did not exit after kill");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_e2e_check_accepts_valid_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "0 */4 * * *");

    mirrors(&dir.path().join("data"))
        .arg("check")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("alpine"))
        .stdout(predicate::str::contains("gentoo"))
        .stdout(predicate::str::contains("2 site(s) ok"));
}

#[test]
fn test_e2e_check_rejects_bad_schedule() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "every tuesday");

    mirrors(&dir.path().join("data"))
        .arg("check")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("gentoo"))
        .stderr(predicate::str::contains("invalid schedule"));
}

#[test]
fn test_e2e_check_missing_config_file() {
    let dir = TempDir::new().unwrap();

    mirrors(&dir.path().join("data"))
        .args(["check", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn test_e2e_status_without_daemon_fails() {
    let dir = TempDir::new().unwrap();

    mirrors(&dir.path().join("data"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("daemon is not running"));
}

#[test]
fn test_e2e_log_prints_tail() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    std::fs::create_dir_all(data_dir.join("logs")).unwrap();
    let lines: String = (1..=30).map(|i| format!("line {i}\n")).collect();
    std::fs::write(data_dir.join("logs").join("alpine.log"), lines).unwrap();

    mirrors(&data_dir)
        .args(["log", "alpine", "--lines", "3"])
        .assert()
        .success()
        .stdout("line 28\nline 29\nline 30\n");

    mirrors(&data_dir)
        .args(["log", "gentoo"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no log for site 'gentoo'"));
}

#[test]
fn test_e2e_status_and_kill_against_running_daemon() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("data");
    let config = write_config(dir.path(), "0 */4 * * *");

    let mut daemon = spawn_daemon(&data_dir, &config);

    let output = mirrors(&data_dir).arg("status").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let row = Regex::new(r"alpine\W+idle").unwrap();
    assert!(row.is_match(&stdout), "unexpected status table:\n{stdout}");
    assert!(stdout.contains("never"), "no update has run yet:\n{stdout}");

    let output = mirrors(&data_dir)
        .args(["status", "gentoo", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["type"], "sites");
    assert_eq!(json["sites"][0]["id"], "gentoo");
    assert_eq!(json["sites"][0]["update_status"], "idle");
    assert_eq!(json["sites"][0]["initialized"], true);

    mirrors(&data_dir)
        .args(["status", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown mirror site: nope"));

    let output = mirrors(&data_dir)
        .args(["status", "nope", "--json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["type"], "error");

    mirrors(&data_dir)
        .arg("kill")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon shutting down"));

    wait_for_exit(&mut daemon);
    assert!(!data_dir.join("mirrors.pid").exists());
    assert!(!data_dir.join("mirrors.sock").exists());
    assert!(!data_dir.join("control.sock").exists());
}
