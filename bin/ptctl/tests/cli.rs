//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command-line behaviour of the control CLI."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;

use assert_cmd::Command;

fn ptctl() -> Command {
    let mut cmd = Command::cargo_bin("ptctl").expect("ptctl binary");
    cmd.env_remove("PT_CONFIG").env("RUST_LOG", "error");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("run ptctl");
    assert!(
        output.status.success(),
        "ptctl failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn backends_lists_in_memory() {
    let stdout = stdout_of(ptctl().arg("backends"));
    assert!(stdout.lines().any(|line| line == "in-memory"));
}

#[test]
fn config_check_accepts_valid_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("pt.toml");
    fs::write(
        &path,
        "[session]\nnetwork = \"plant\"\n\n[workers]\nthread_count = 4\nqueue_capacity = 128\noverflow = \"drop-oldest\"\n",
    )
    .expect("write config");

    let stdout = stdout_of(ptctl().args(["config", "check", "--config"]).arg(&path));
    assert!(stdout.contains("is valid"));
    assert!(stdout.contains("network=plant"));
    assert!(stdout.contains("threads=4 queue=128"));
}

#[test]
fn config_check_rejects_zero_threads() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("pt.toml");
    fs::write(&path, "[workers]\nthread_count = 0\n").expect("write config");
    ptctl()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn config_default_round_trips_through_check() {
    let rendered = stdout_of(ptctl().args(["config", "default"]));
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("pt.toml");
    fs::write(&path, rendered).expect("write config");
    ptctl()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn pubsub_demo_delivers_every_message() {
    let stdout = stdout_of(ptctl().args(["demo", "pubsub", "--count", "5", "--threads", "2"]));
    assert!(stdout.contains("received 5/5 message(s)"));
    assert!(stdout.contains("payload=hello-4"));
}

#[test]
fn rpc_demo_echoes_payload_and_dumps_metrics() {
    let stdout = stdout_of(ptctl().args(["demo", "rpc", "--payload", "ping", "--metrics"]));
    assert!(stdout.contains("reply from demo/echo: payload=ping"));
    assert!(stdout.contains("pt_rpc_replies_sent_total 1"));
}

#[test]
fn rpc_demo_without_server_fails_with_timeout() {
    let output = ptctl()
        .args(["demo", "rpc", "--no-server", "--timeout-ms", "100"])
        .output()
        .expect("run ptctl");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("timed out"));
}

#[test]
fn log_dir_receives_a_rolling_log_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let logs = dir.path().join("logs");
    ptctl()
        .arg("--log-dir")
        .arg(&logs)
        .arg("backends")
        .assert()
        .success();
    assert!(logs.is_dir());
}

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("pt.toml");
    fs::write(&path, contents).expect("write config");
    path
}

#[test]
fn rpc_demo_takes_its_timeout_from_the_config_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let network = format!("cli-{}", uuid::Uuid::new_v4());
    let path = write_config(
        &dir,
        &format!("[session]\nnetwork = \"{network}\"\n\n[rpc]\ntimeout = 1\n"),
    );

    let started = std::time::Instant::now();
    let output = ptctl()
        .args(["demo", "rpc", "--no-server", "--config"])
        .arg(&path)
        .output()
        .expect("run ptctl");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("timed out after 1s"));
    assert!(started.elapsed() >= std::time::Duration::from_millis(900));
}

#[test]
fn demo_respects_disabled_metrics_and_configured_workers() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_config(
        &dir,
        "[workers]\nthread_count = 3\nqueue_capacity = 64\n\n[metrics]\nenabled = false\n",
    );

    let stdout = stdout_of(
        ptctl()
            .args(["demo", "pubsub", "--count", "4", "--metrics", "-c"])
            .arg(&path),
    );
    assert!(stdout.contains("received 4/4 message(s)"));
    assert!(stdout.contains("metrics are disabled in the configuration"));
    assert!(!stdout.contains("pt_messages_published_total"));
}

#[test]
fn demo_rejects_an_invalid_config_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_config(&dir, "[workers]\nthread_count = 0\n");
    ptctl()
        .args(["demo", "rpc", "--config"])
        .arg(&path)
        .assert()
        .failure();
}
