// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-connection message loop: one sequential task per socket so
//! request ordering is preserved for that connection while different
//! connections run fully in parallel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::agent_runtime::{AgentRuntime, AgentSpawnConfig};
use crate::config::AgentConfig as ConfiguredAgent;
use crate::git::RemoteGitInfo;
use crate::rpc::{build_error_envelope, classify, expand_batch, normalize_response, Envelope};
use crate::telemetry::LogCoalescer;

use super::BrokerShared;

pub struct ConnectionHandle {
    pub id: String,
    pub sender: mpsc::UnboundedSender<Value>,
    pub default_runtime_id: String,
}

/// Send a `remote/progress` notification to the client and record it with
/// the connection's log coalescer, which groups repeats of the same stage
/// into a single log line rather than logging every milestone individually.
fn send_progress(
    out_tx: &mpsc::UnboundedSender<Value>,
    coalescer: &std::sync::Mutex<LogCoalescer>,
    label: &str,
    stage: &str,
    message: &str,
) {
    let _ = out_tx.send(json!({
        "jsonrpc": "2.0",
        "method": "remote/progress",
        "params": {"stage": stage, "message": message},
    }));
    coalescer.lock().unwrap().record(label, stage, message);
}

fn build_notification_observer(
    broker: Arc<BrokerShared>,
    runtime_id: String,
) -> impl Fn(Value) + Send + Sync + 'static {
    move |value: Value| {
        let broker = broker.clone();
        let runtime_id = runtime_id.clone();
        tokio::spawn(async move {
            let session_id = value
                .get("params")
                .and_then(|p| p.get("sessionId").or_else(|| p.get("session_id")))
                .and_then(Value::as_str)
                .map(str::to_string);

            let targets: Vec<String> = match session_id.as_deref() {
                Some(sid) if broker.session_registry.get(sid).await.is_some() => {
                    broker.session_registry.get_subscribers(sid).await.into_iter().collect()
                }
                _ => {
                    let conns = broker.connections.read().await;
                    conns
                        .values()
                        .filter(|c| c.default_runtime_id == runtime_id)
                        .map(|c| c.id.clone())
                        .collect()
                }
            };

            let conns = broker.connections.read().await;
            for id in targets {
                if let Some(handle) = conns.get(&id) {
                    let _ = handle.sender.send(value.clone());
                }
            }
        });
    }
}

/// Runs for the lifetime of one WebSocket connection.
pub async fn handle_connection(
    ws_stream: WebSocketStream<TcpStream>,
    connection_id: String,
    agent_config: ConfiguredAgent,
    broker: Arc<BrokerShared>,
) {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();

    let runtime_id = format!("rt:{connection_id}");
    let runtime = AgentRuntime::new(
        runtime_id.clone(),
        AgentSpawnConfig {
            command: agent_config.command,
            args: agent_config.args,
            env: agent_config.env,
        },
    );
    runtime.set_notification_observer(build_notification_observer(broker.clone(), runtime_id.clone()));

    broker.runtimes.write().await.insert(runtime_id.clone(), runtime.clone());
    broker.connections.write().await.insert(
        connection_id.clone(),
        ConnectionHandle {
            id: connection_id.clone(),
            sender: out_tx.clone(),
            default_runtime_id: runtime_id.clone(),
        },
    );

    let writer_task = tokio::spawn(async move {
        while let Some(value) = out_rx.recv().await {
            if ws_tx.send(Message::Text(value.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let coalescer = std::sync::Mutex::new(LogCoalescer::new());
    send_progress(&out_tx, &coalescer, &connection_id, "connection", "connected");
    info!(connection = %connection_id, runtime = %runtime_id, "connection established");

    let mut subscribed_sessions: HashSet<String> = HashSet::new();
    let mut request_method_by_id: HashMap<String, String> = HashMap::new();

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let Ok(value) = serde_json::from_str::<Value>(&text) else {
                    let _ = out_tx.send(build_error_envelope(&Value::Null, -32600, "malformed JSON"));
                    continue;
                };
                for frame in expand_batch(value) {
                    handle_frame(
                        frame,
                        &connection_id,
                        &runtime_id,
                        &runtime,
                        &broker,
                        &out_tx,
                        &coalescer,
                        &mut subscribed_sessions,
                        &mut request_method_by_id,
                    )
                    .await;
                }
            }
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            Ok(_) => {}
        }
    }

    for session_id in &subscribed_sessions {
        broker.session_registry.detach(session_id, &connection_id).await;
    }
    broker.connections.write().await.remove(&connection_id);
    if !broker.session_registry.has_sessions_for_runtime(&runtime_id).await {
        runtime.stop().await;
        broker.runtimes.write().await.remove(&runtime_id);
    }
    coalescer.lock().unwrap().flush_all();
    writer_task.abort();
    info!(connection = %connection_id, "connection closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    frame: Value,
    connection_id: &str,
    runtime_id: &str,
    default_runtime: &Arc<AgentRuntime>,
    broker: &Arc<BrokerShared>,
    out_tx: &mpsc::UnboundedSender<Value>,
    coalescer: &std::sync::Mutex<LogCoalescer>,
    subscribed_sessions: &mut HashSet<String>,
    request_method_by_id: &mut HashMap<String, String>,
) {
    let envelope = match classify(&frame) {
        Ok(e) => e,
        Err(e) => {
            let id = frame.get("id").cloned().unwrap_or(Value::Null);
            let _ = out_tx.send(build_error_envelope(&id, e.code(), e.to_string()));
            return;
        }
    };

    match envelope {
        Envelope::Notification { method, params } => {
            let runtime = resolve_runtime_for_notification(&params, runtime_id, default_runtime, broker).await;
            let payload = json!({"jsonrpc": "2.0", "method": method, "params": params});
            if let Err(e) = runtime.send_notification(payload).await {
                warn!(%method, error = %e, "failed to forward notification");
            }
        }
        Envelope::Request { id, method, params } => {
            request_method_by_id.insert(id.to_string(), method.clone());
            let response = dispatch_request(
                &id,
                &method,
                params,
                connection_id,
                runtime_id,
                default_runtime,
                broker,
                out_tx,
                coalescer,
                subscribed_sessions,
            )
            .await;
            request_method_by_id.remove(&id.to_string());
            let _ = out_tx.send(response);
        }
    }
}

async fn resolve_runtime_for_notification(
    params: &Value,
    runtime_id: &str,
    default_runtime: &Arc<AgentRuntime>,
    broker: &Arc<BrokerShared>,
) -> Arc<AgentRuntime> {
    if let Some(session_id) = params.get("sessionId").and_then(Value::as_str) {
        if let Some(record) = broker.session_registry.get(session_id).await {
            if let Some(rt) = broker.runtimes.read().await.get(&record.runtime_id) {
                return rt.clone();
            }
        }
    }
    let _ = runtime_id;
    default_runtime.clone()
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_request(
    id: &Value,
    method: &str,
    params: Value,
    connection_id: &str,
    runtime_id: &str,
    default_runtime: &Arc<AgentRuntime>,
    broker: &Arc<BrokerShared>,
    out_tx: &mpsc::UnboundedSender<Value>,
    coalescer: &std::sync::Mutex<LogCoalescer>,
    subscribed_sessions: &mut HashSet<String>,
) -> Value {
    let timeout = Duration::from_millis(broker.config.request_timeout_ms);

    match method {
        "session/new" => {
            handle_session_new(id, params, connection_id, runtime_id, default_runtime, broker, out_tx, coalescer, timeout)
                .await
        }
        "session/load" => {
            handle_session_load(id, params, connection_id, broker, subscribed_sessions, timeout).await
        }
        "session/prompt" => {
            handle_session_prompt(
                id, params, connection_id, runtime_id, default_runtime, broker, out_tx, coalescer, timeout,
            )
            .await
        }
        _ => {
            let mut params = params;
            strip_meta(&mut params);
            let payload = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
            match default_runtime.send_request(payload, timeout).await {
                Ok(raw) => normalize_response(&raw, id),
                Err(e) => build_error_envelope(id, -32000, e.to_string()),
            }
        }
    }
}

fn strip_meta(params: &mut Value) {
    if let Some(obj) = params.as_object_mut() {
        obj.remove("_meta");
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_session_new(
    id: &Value,
    mut params: Value,
    connection_id: &str,
    runtime_id: &str,
    default_runtime: &Arc<AgentRuntime>,
    broker: &Arc<BrokerShared>,
    out_tx: &mpsc::UnboundedSender<Value>,
    coalescer: &std::sync::Mutex<LogCoalescer>,
    timeout: Duration,
) -> Value {
    let remote: Option<RemoteGitInfo> = params
        .get("_meta")
        .and_then(|m| m.get("remote"))
        .filter(|r| r.get("url").and_then(Value::as_str).is_some())
        .and_then(|r| serde_json::from_value(r.clone()).ok());

    strip_meta(&mut params);

    let Some(remote) = remote else {
        let payload = json!({"jsonrpc": "2.0", "id": id, "method": "session/new", "params": params});
        return match default_runtime.send_request(payload, timeout).await {
            Ok(raw) => normalize_response(&raw, id),
            Err(e) => build_error_envelope(id, -32000, e.to_string()),
        };
    };

    let run_id = format!("run-{}", uuid::Uuid::new_v4());
    let out_tx_progress = out_tx.clone();
    let notify = move |stage: &str, message: &str| send_progress(&out_tx_progress, coalescer, connection_id, stage, message);

    let ctx = match broker.git_manager.ensure_repo_workdir(&remote, &run_id, &notify).await {
        Ok(ctx) => ctx,
        Err(e) => return build_error_envelope(id, -32000, e.to_string()),
    };

    let push_out_tx = out_tx.clone();
    let push_notify =
        move |stage: &str, message: &str| send_progress(&push_out_tx, coalescer, connection_id, stage, message);
    let push_outcome = broker.git_manager.ensure_committed_and_pushed(&ctx, &push_notify).await.ok();

    if let Some(obj) = params.as_object_mut() {
        obj.insert("cwd".to_string(), json!(ctx.workdir.to_string_lossy()));
    }
    let payload = json!({"jsonrpc": "2.0", "id": id, "method": "session/new", "params": params});

    let raw = match default_runtime.send_request(payload, timeout).await {
        Ok(raw) => raw,
        Err(e) => return build_error_envelope(id, -32000, e.to_string()),
    };

    let mut response = normalize_response(&raw, id);
    if let Some(session_id) = response.get("result").and_then(|r| r.get("sessionId")).and_then(Value::as_str) {
        let session_id = session_id.to_string();
        broker.session_registry.ensure(&session_id, runtime_id).await;
        broker.session_registry.set_git_context(&session_id, ctx).await;

        if let Some(outcome) = push_outcome {
            if outcome.pushed {
                if let Some(result) = response.get_mut("result").and_then(Value::as_object_mut) {
                    result.insert(
                        "_meta".to_string(),
                        json!({"target": {"url": remote.url, "branch": remote.branch, "revision": outcome.revision}}),
                    );
                }
            }
        }
    }

    response
}

async fn handle_session_load(
    id: &Value,
    mut params: Value,
    connection_id: &str,
    broker: &Arc<BrokerShared>,
    subscribed_sessions: &mut HashSet<String>,
    timeout: Duration,
) -> Value {
    let Some(session_id) = params.get("sessionId").and_then(Value::as_str).map(str::to_string) else {
        return build_error_envelope(id, -32602, "missing required param: sessionId");
    };

    let Some(record) = broker.session_registry.get(&session_id).await else {
        return build_error_envelope(id, -32000, "Session not found");
    };

    if broker.session_registry.attach(&session_id, connection_id).await.is_ok() {
        subscribed_sessions.insert(session_id.clone());
    }

    strip_meta(&mut params);
    if let Some(ctx) = &record.git_context {
        if let Some(obj) = params.as_object_mut() {
            obj.insert("cwd".to_string(), json!(ctx.workdir.to_string_lossy()));
        }
    }

    let Some(runtime) = broker.runtimes.read().await.get(&record.runtime_id).cloned() else {
        return build_error_envelope(id, -32000, "agent runtime not found");
    };

    let payload = json!({"jsonrpc": "2.0", "id": id, "method": "session/load", "params": params});
    match runtime.send_request(payload, timeout).await {
        Ok(raw) => normalize_response(&raw, id),
        Err(e) => build_error_envelope(id, -32000, e.to_string()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_session_prompt(
    id: &Value,
    mut params: Value,
    connection_id: &str,
    runtime_id: &str,
    default_runtime: &Arc<AgentRuntime>,
    broker: &Arc<BrokerShared>,
    out_tx: &mpsc::UnboundedSender<Value>,
    coalescer: &std::sync::Mutex<LogCoalescer>,
    timeout: Duration,
) -> Value {
    let session_id = params.get("sessionId").and_then(Value::as_str).map(str::to_string);
    strip_meta(&mut params);

    let record = match &session_id {
        Some(sid) => broker.session_registry.get(sid).await,
        None => None,
    };

    let runtime = match &record {
        Some(r) => broker.runtimes.read().await.get(&r.runtime_id).cloned().unwrap_or_else(|| default_runtime.clone()),
        None => default_runtime.clone(),
    };
    let _ = runtime_id;

    let payload = json!({"jsonrpc": "2.0", "id": id, "method": "session/prompt", "params": params});
    let raw = match runtime.send_request(payload, timeout).await {
        Ok(raw) => raw,
        Err(e) => return build_error_envelope(id, -32000, e.to_string()),
    };

    let mut response = normalize_response(&raw, id);
    normalize_prompt_result(&mut response);

    if let (Some(sid), Some(r)) = (&session_id, &record) {
        if let Some(ctx) = &r.git_context {
            let out_tx_progress = out_tx.clone();
            let notify =
                move |stage: &str, message: &str| send_progress(&out_tx_progress, coalescer, connection_id, stage, message);
            if let Ok(outcome) = broker.git_manager.ensure_committed_and_pushed(ctx, &notify).await {
                if outcome.pushed {
                    if let Some(result) = response.get_mut("result").and_then(Value::as_object_mut) {
                        result.insert(
                            "_meta".to_string(),
                            json!({"target": {"url": ctx.remote_url, "branch": ctx.branch_name, "revision": outcome.revision}}),
                        );
                    }
                }
            }
            broker.session_registry.touch(sid).await;
        }
    }

    response
}

fn normalize_prompt_result(response: &mut Value) {
    let Some(obj) = response.as_object_mut() else { return };
    if let Some(result) = obj.get("result").cloned() {
        if result.is_string() {
            obj.insert("result".to_string(), json!({"stopReason": result}));
        }
    }
    if let Some(result) = obj.get_mut("result").and_then(Value::as_object_mut) {
        const KNOWN_STOP_REASONS: &[&str] =
            &["end_turn", "max_tokens", "max_turn_requests", "refusal", "cancelled"];
        match result.get("stopReason").and_then(Value::as_str) {
            Some(reason) if KNOWN_STOP_REASONS.contains(&reason) => {}
            other => {
                warn!(stop_reason = ?other, "session/prompt result missing or unknown stopReason, forcing end_turn");
                result.insert("stopReason".to_string(), json!("end_turn"));
            }
        }
        if let Some(meta) = result.get("_meta") {
            if !meta.is_object() && !meta.is_null() {
                result.insert("_meta".to_string(), Value::Null);
            }
        }
    }
    debug!("normalized session/prompt result");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prompt_result_accepts_known_stop_reason() {
        let mut response = json!({"jsonrpc": "2.0", "id": 1, "result": {"stopReason": "refusal"}});
        normalize_prompt_result(&mut response);
        assert_eq!(response["result"]["stopReason"], json!("refusal"));
    }

    #[test]
    fn test_normalize_prompt_result_forces_end_turn_on_unknown_stop_reason() {
        let mut response = json!({"jsonrpc": "2.0", "id": 1, "result": {"stopReason": "made_up_reason"}});
        normalize_prompt_result(&mut response);
        assert_eq!(response["result"]["stopReason"], json!("end_turn"));
    }

    #[test]
    fn test_normalize_prompt_result_forces_end_turn_when_missing() {
        let mut response = json!({"jsonrpc": "2.0", "id": 1, "result": {}});
        normalize_prompt_result(&mut response);
        assert_eq!(response["result"]["stopReason"], json!("end_turn"));
    }

    #[test]
    fn test_normalize_prompt_result_wraps_bare_string_result() {
        let mut response = json!({"jsonrpc": "2.0", "id": 1, "result": "end_turn"});
        normalize_prompt_result(&mut response);
        assert_eq!(response["result"]["stopReason"], json!("end_turn"));
    }
}
