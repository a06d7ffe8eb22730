// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! End-to-end tests driving a real `Broker` over a loopback TCP socket,
//! through real WebSocket handshakes, against either the scripted fixture
//! agent (`acp-broker-fixture-agent`) or a plain `sleep`/shell process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use acp_broker::broker::Broker;
use acp_broker::config::{load_broker_config, AgentRegistry, BrokerConfig};

fn fixture_agent_path() -> String {
    env!("CARGO_BIN_EXE_acp-broker-fixture-agent").to_string()
}

fn write_agent_registry(dir: &std::path::Path, name: &str, command: &str, args: &[&str]) -> PathBuf {
    let path = dir.join("agent_servers.json");
    let body = json!({
        "agent_servers": {
            name: {"command": command, "args": args, "env": {}}
        }
    });
    std::fs::write(&path, body.to_string()).unwrap();
    path
}

async fn start_broker(config: BrokerConfig, registry_path: &std::path::Path) {
    let registry = AgentRegistry::load(registry_path).unwrap();
    let broker = Arc::new(Broker::new(config, Some(registry)));
    tokio::spawn(broker.run());
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn base_config(port: u16) -> BrokerConfig {
    let mut config = load_broker_config(None, &std::collections::HashMap::new()).unwrap();
    config.port = port;
    config.bind_host = "127.0.0.1".to_string();
    config.push = false;
    config
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(port: u16, path: &str, token: Option<&str>) -> WsStream {
    let mut url = format!("ws://127.0.0.1:{port}{path}");
    if let Some(t) = token {
        url.push_str(&format!("?token={t}"));
    }
    let (ws, _) = tokio_tungstenite::connect_async(url).await.expect("handshake succeeds");
    ws
}

async fn send(ws: &mut WsStream, value: &Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Read frames until one satisfies `pred`, skipping unrelated notifications
/// (e.g. the "connected" progress frame sent on connect).
async fn recv_matching(ws: &mut WsStream, pred: impl Fn(&Value) -> bool) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("stream open").expect("no ws error");
            if let Message::Text(text) = msg {
                let value: Value = serde_json::from_str(&text).unwrap();
                if pred(&value) {
                    return value;
                }
            }
        }
    })
    .await
    .expect("matching frame arrives before timeout")
}

#[tokio::test]
async fn test_echo_round_trip_through_fixture_agent() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = write_agent_registry(dir.path(), "OpenCode", &fixture_agent_path(), &[]);
    start_broker(base_config(18801), &registry_path).await;

    let mut ws = connect(18801, "/acp", None).await;
    send(&mut ws, &json!({"jsonrpc": "2.0", "id": 1, "method": "foo/bar", "params": {}})).await;

    let response = recv_matching(&mut ws, |v| v.get("id") == Some(&json!(1))).await;
    assert_eq!(response["result"]["echoedMethod"], json!("foo/bar"));
}

#[tokio::test]
async fn test_request_times_out_against_a_silent_child() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = write_agent_registry(dir.path(), "OpenCode", "sleep", &["5"]);
    let mut config = base_config(18802);
    config.request_timeout_ms = 150;
    start_broker(config, &registry_path).await;

    let mut ws = connect(18802, "/acp", None).await;
    send(&mut ws, &json!({"jsonrpc": "2.0", "id": 1, "method": "ping", "params": {}})).await;

    let response = recv_matching(&mut ws, |v| v.get("id") == Some(&json!(1))).await;
    let message = response["error"]["message"].as_str().unwrap().to_lowercase();
    assert!(message.contains("timeout"), "expected a timeout message, got: {message}");
}

#[tokio::test]
async fn test_session_update_notification_fans_out_to_the_loading_connection() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = write_agent_registry(dir.path(), "OpenCode", &fixture_agent_path(), &[]);
    start_broker(base_config(18803), &registry_path).await;

    let mut conn1 = connect(18803, "/acp", None).await;
    send(&mut conn1, &json!({"jsonrpc": "2.0", "id": 1, "method": "session/new", "params": {}})).await;
    let created = recv_matching(&mut conn1, |v| v.get("id") == Some(&json!(1))).await;
    let session_id = created["result"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(session_id, "sess-fixture");

    let mut conn2 = connect(18803, "/acp", None).await;
    send(&mut conn2, &json!({"jsonrpc": "2.0", "id": 2, "method": "session/load", "params": {"sessionId": session_id}})).await;
    let loaded = recv_matching(&mut conn2, |v| v.get("id") == Some(&json!(2))).await;
    assert_eq!(loaded["result"]["sessionId"], json!("sess-fixture"));

    send(&mut conn1, &json!({"jsonrpc": "2.0", "id": 3, "method": "session/prompt", "params": {"sessionId": session_id}})).await;

    // conn2 subscribed to the session via session/load, so it receives the
    // agent's proactive session/update notification even though conn1 sent
    // the prompt.
    let update = recv_matching(&mut conn2, |v| v.get("method") == Some(&json!("session/update"))).await;
    assert_eq!(update["params"]["sessionId"], json!("sess-fixture"));

    let prompt_response = recv_matching(&mut conn1, |v| v.get("id") == Some(&json!(3))).await;
    assert_eq!(prompt_response["result"]["stopReason"], json!("end_turn"));
}

#[tokio::test]
async fn test_session_new_with_remote_materializes_a_worktree_and_sets_cwd() {
    let dir = tempfile::tempdir().unwrap();

    let origin_dir = dir.path().join("origin");
    tokio::fs::create_dir_all(&origin_dir).await.unwrap();
    git(&origin_dir, &["init", "--initial-branch=main"]).await;
    git(&origin_dir, &["commit", "--allow-empty", "-c", "user.name=t", "-c", "user.email=t@t", "-m", "init"]).await;

    let git_root = dir.path().join("git-root");
    tokio::fs::create_dir_all(&git_root).await.unwrap();

    let registry_path = write_agent_registry(dir.path(), "OpenCode", &fixture_agent_path(), &[]);
    let mut config = base_config(18804);
    config.git_root = Some(git_root.clone());
    start_broker(config, &registry_path).await;

    let mut ws = connect(18804, "/acp", None).await;
    send(
        &mut ws,
        &json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "session/new",
            "params": {"_meta": {"remote": {"url": origin_dir.to_string_lossy(), "branch": "main"}}},
        }),
    )
    .await;

    let response = recv_matching(&mut ws, |v| v.get("id") == Some(&json!(1))).await;
    assert_eq!(response["result"]["sessionId"], json!("sess-fixture"));

    let forwarded_cwd = response["result"]["receivedParams"]["cwd"].as_str().unwrap();
    assert!(
        PathBuf::from(forwarded_cwd).starts_with(&git_root),
        "expected cwd under {:?}, got {forwarded_cwd}",
        git_root
    );

    let worktrees_root = git_root.join(".acp-remote-worktrees").join("origin");
    assert!(worktrees_root.exists(), "expected a worktree directory under {:?}", worktrees_root);
    let mut entries = tokio::fs::read_dir(&worktrees_root).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_some());
}

#[tokio::test]
async fn test_unauthorized_upgrade_is_rejected_before_any_agent_is_spawned() {
    let dir = tempfile::tempdir().unwrap();
    let registry_path = write_agent_registry(dir.path(), "OpenCode", &fixture_agent_path(), &[]);
    let mut config = base_config(18805);
    config.token = Some("supersecret".to_string());
    start_broker(config, &registry_path).await;

    let url = "ws://127.0.0.1:18805/acp";
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected an HTTP 401 handshake rejection, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_git_root_map_sends_a_matched_remote_to_its_mapped_root_not_the_default() {
    let dir = tempfile::tempdir().unwrap();

    let mapped_origin = dir.path().join("mapped-origin");
    tokio::fs::create_dir_all(&mapped_origin).await.unwrap();
    git(&mapped_origin, &["init", "--initial-branch=main"]).await;
    git(&mapped_origin, &["commit", "--allow-empty", "-c", "user.name=t", "-c", "user.email=t@t", "-m", "init"]).await;

    let mapped_root = dir.path().join("mapped-root");
    let default_root = dir.path().join("default-root");
    tokio::fs::create_dir_all(&mapped_root).await.unwrap();
    tokio::fs::create_dir_all(&default_root).await.unwrap();

    let mut git_root_map = std::collections::HashMap::new();
    git_root_map.insert(mapped_origin.to_string_lossy().to_string(), mapped_root.clone());

    let manager = acp_broker::git::GitWorkspaceManager::new(default_root.clone(), git_root_map, None, None, false);
    let remote = acp_broker::git::RemoteGitInfo {
        url: mapped_origin.to_string_lossy().to_string(),
        branch: Some("main".to_string()),
        revision: None,
    };

    let ctx = manager.ensure_repo_workdir(&remote, "run-map-test", &|_, _| {}).await.unwrap();

    assert!(ctx.repo_dir.starts_with(&mapped_root), "expected clone under {:?}, got {:?}", mapped_root, ctx.repo_dir);
    assert!(
        tokio::fs::read_dir(&default_root).await.unwrap().next_entry().await.unwrap().is_none(),
        "default root should stay empty when the remote matches a mapped root"
    );
}

async fn git(dir: &std::path::Path, args: &[&str]) {
    let output = tokio::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .await
        .expect("git is installed");
    assert!(output.status.success(), "git {:?} failed: {}", args, String::from_utf8_lossy(&output.stderr));
}
