use assert_cmd::prelude::*;
use axum::{routing::post, Json, Router};
use std::{fs, net::TcpListener, process::Command};
use tempfile::TempDir;
use tokio::runtime::Runtime;

fn write_env(dir: &TempDir, relays: &str) -> String {
    let env_path = dir.path().join("env");
    let content = format!("RELAYS={relays}\nBIND_HTTP=127.0.0.1:0\nEMERGENCY_TIMEOUT_MS=500\n");
    fs::write(&env_path, content).unwrap();
    env_path.to_str().unwrap().to_string()
}

fn event_json(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "pubkey": "abc",
        "kind": 1301,
        "created_at": 1,
        "tags": [["t", "running"]],
        "content": "",
        "sig": "",
    })
}

/// Relay whose HTTP endpoint answers every query with two events. The runtime
/// must outlive the test's command invocations.
fn spawn_http_relay() -> (Runtime, String) {
    let rt = Runtime::new().unwrap();
    let listener = rt
        .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().route(
        "/query",
        post(|| async { Json(vec![event_json("e1"), event_json("e2")]) }),
    );
    rt.spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (rt, format!("ws://{addr}"))
}

fn dead_relay() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    format!("ws://{}", listener.local_addr().unwrap())
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::cargo_bin("relayq")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    for cmd in ["query", "teams", "serve"] {
        assert!(text.contains(cmd));
    }
}

#[test]
fn query_help_lists_filter_flags() {
    let output = Command::cargo_bin("relayq")
        .unwrap()
        .args(["query", "--help"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("--relay <URL>"));
    assert!(text.contains("--author <PUBKEY>"));
    assert!(text.contains("--tag-t <TOPIC>"));
    assert!(text.contains("--method <METHOD>"));
}

#[test]
fn query_cli_prints_events_as_ndjson() {
    let (_rt, relay) = spawn_http_relay();
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &relay);

    let output = Command::cargo_bin("relayq")
        .unwrap()
        .args(["--env", &env_path, "query", "--relay", &relay, "--kind", "1301", "--stats"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).unwrap();
    let ids: Vec<String> = stdout
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("method=http"));
    assert!(stderr.contains("\"http_success\":1"));
}

#[test]
fn query_cli_merges_configured_relays() {
    let (_rt, relay) = spawn_http_relay();
    let dead = dead_relay();
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &format!("{relay},{dead}"));

    let output = Command::cargo_bin("relayq")
        .unwrap()
        .args(["--env", &env_path, "query", "--kind", "1301", "--timeout-ms", "500"])
        .assert()
        .success()
        .get_output()
        .clone();
    assert_eq!(String::from_utf8(output.stdout).unwrap().lines().count(), 2);
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains(&format!("{dead} method=http events=0")));
    assert!(stderr.contains("emergency_direct_failed"));
}

#[test]
fn query_cli_fails_when_unreachable() {
    let dead = dead_relay();
    let dir = TempDir::new().unwrap();
    let env_path = write_env(&dir, &dead);

    let output = Command::cargo_bin("relayq")
        .unwrap()
        .args(["--env", &env_path, "query", "--timeout-ms", "300"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8(output).unwrap().contains("no relay answered"));
}

#[test]
fn query_cli_rejects_unknown_method() {
    Command::cargo_bin("relayq")
        .unwrap()
        .args(["query", "--method", "pigeon"])
        .assert()
        .failure();
}

#[test]
fn missing_relays_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let env_path = dir.path().join("env");
    fs::write(&env_path, "RELAYS=\n").unwrap();
    Command::cargo_bin("relayq")
        .unwrap()
        .args(["--env", env_path.to_str().unwrap(), "query"])
        .env_remove("RELAYS")
        .assert()
        .failure();
}
