// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The agent runtime: one supervised child process, line-delimited JSON in
//! both directions, request/response correlation by id, timeouts.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::AgentRuntimeError;

use super::env::build_child_env;

const LOG_RING_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Command, arguments, and environment overlay used to spawn the child.
#[derive(Debug, Clone)]
pub struct AgentSpawnConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, Value>,
}

type NotificationObserver = Arc<dyn Fn(Value) + Send + Sync>;
type LogObserver = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct ChildHandle {
    stdin: ChildStdin,
    generation: u64,
    kill_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    started: bool,
    spawn_cwd: Option<PathBuf>,
    child: Option<ChildHandle>,
    child_generation: u64,
    pending: HashMap<String, oneshot::Sender<Value>>,
    log_ring: VecDeque<LogEntry>,
}

/// Supervises at most one child process at a time for a single runtime id.
pub struct AgentRuntime {
    pub id: String,
    spawn_config: AgentSpawnConfig,
    inner: Mutex<Inner>,
    notification_observer: StdRwLock<Option<NotificationObserver>>,
    log_observer: StdRwLock<Option<LogObserver>>,
}

impl AgentRuntime {
    pub fn new(id: impl Into<String>, spawn_config: AgentSpawnConfig) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            spawn_config,
            inner: Mutex::new(Inner {
                started: false,
                spawn_cwd: None,
                child: None,
                child_generation: 0,
                pending: HashMap::new(),
                log_ring: VecDeque::new(),
            }),
            notification_observer: StdRwLock::new(None),
            log_observer: StdRwLock::new(None),
        })
    }

    pub fn set_notification_observer(&self, f: impl Fn(Value) + Send + Sync + 'static) {
        *self.notification_observer.write().unwrap() = Some(Arc::new(f));
    }

    pub fn set_log_observer(&self, f: impl Fn(&LogEntry) + Send + Sync + 'static) {
        *self.log_observer.write().unwrap() = Some(Arc::new(f));
    }

    /// Set the spawn working directory. Only valid before the first `start`.
    pub async fn set_spawn_cwd(&self, path: PathBuf) -> Result<(), AgentRuntimeError> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Err(AgentRuntimeError::SpawnFailed(
                "cannot set spawn cwd after start".to_string(),
            ));
        }
        inner.spawn_cwd = Some(path);
        Ok(())
    }

    pub async fn log_ring_snapshot(&self) -> Vec<LogEntry> {
        self.inner.lock().await.log_ring.iter().cloned().collect()
    }

    /// Idempotent: spawns the child if not already started.
    pub async fn start(self: &Arc<Self>) -> Result<(), AgentRuntimeError> {
        let mut inner = self.inner.lock().await;
        if inner.started {
            return Ok(());
        }

        let base_env: HashMap<String, String> = std::env::vars().collect();
        let env = build_child_env(&base_env, &self.spawn_config.env);

        let mut command = Command::new(&self.spawn_config.command);
        command
            .args(&self.spawn_config.args)
            .env_clear()
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &inner.spawn_cwd {
            command.current_dir(cwd);
        }

        let mut child: Child = command
            .spawn()
            .map_err(|e| AgentRuntimeError::SpawnFailed(e.to_string()))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        inner.child_generation += 1;
        let generation = inner.child_generation;
        let (kill_tx, mut kill_rx) = oneshot::channel();

        inner.child = Some(ChildHandle {
            stdin,
            generation,
            kill_tx: Some(kill_tx),
        });
        inner.started = true;
        drop(inner);

        let stderr_rt = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    stderr_rt
                        .push_log(LogLevel::Warn, format!("stderr: {line}"))
                        .await;
                }
            }
        });

        let rt = self.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(l)) => {
                                if !l.trim().is_empty() {
                                    rt.handle_line(generation, l).await;
                                }
                            }
                            Ok(None) | Err(_) => break,
                        }
                    }
                    _ = &mut kill_rx => {
                        let _ = child.start_kill();
                    }
                    status = child.wait() => {
                        let code = status.ok().and_then(|s| s.code());
                        rt.push_log(LogLevel::Error, format!("child exited: code={code:?}")).await;
                        rt.mark_stopped(generation).await;
                        break;
                    }
                }
            }
        });

        info!(runtime = %self.id, command = %self.spawn_config.command, "agent runtime started");
        Ok(())
    }

    async fn mark_stopped(&self, generation: u64) {
        let mut inner = self.inner.lock().await;
        if inner.child_generation == generation {
            inner.started = false;
            inner.child = None;
        }
    }

    /// Send a request, racing the child's reply against `timeout`.
    pub async fn send_request(
        self: &Arc<Self>,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, AgentRuntimeError> {
        self.start().await?;

        let id = payload.get("id").cloned().unwrap_or(Value::Null);
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();

        {
            let mut inner = self.inner.lock().await;
            inner.pending.insert(key.clone(), tx);
            self.write_line(&mut inner, &payload).await?;
        }

        tokio::select! {
            result = rx => {
                result.map_err(|_| AgentRuntimeError::Timeout)
            }
            _ = tokio::time::sleep(timeout) => {
                let mut inner = self.inner.lock().await;
                inner.pending.remove(&key);
                warn!(runtime = %self.id, %key, "agent response timeout");
                Err(AgentRuntimeError::Timeout)
            }
        }
    }

    /// Fire-and-forget notification, no reply expected.
    pub async fn send_notification(self: &Arc<Self>, payload: Value) -> Result<(), AgentRuntimeError> {
        self.start().await?;
        let mut inner = self.inner.lock().await;
        self.write_line(&mut inner, &payload).await
    }

    async fn write_line(&self, inner: &mut Inner, payload: &Value) -> Result<(), AgentRuntimeError> {
        let handle = inner
            .child
            .as_mut()
            .ok_or(AgentRuntimeError::NotStarted)?;
        let mut line = serde_json::to_vec(payload).map_err(|e| AgentRuntimeError::WriteFailed(e.to_string()))?;
        line.push(b'\n');
        handle
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| AgentRuntimeError::WriteFailed(e.to_string()))
    }

    /// Stop the child, if any, bumping the generation so any in-flight
    /// stdout already queued from the superseded child is ignored.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        inner.child_generation += 1;
        inner.started = false;
        if let Some(mut handle) = inner.child.take() {
            if let Some(kill_tx) = handle.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
    }

    async fn handle_line(self: &Arc<Self>, generation: u64, line: String) {
        let value: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                self.push_log(LogLevel::Warn, format!("raw: {line}")).await;
                return;
            }
        };

        let id = value.get("id").filter(|v| !v.is_null());
        if let Some(id) = id {
            let key = id.to_string();
            let resolved = {
                let mut inner = self.inner.lock().await;
                if inner.child_generation != generation {
                    return;
                }
                inner.pending.remove(&key)
            };
            if let Some(sender) = resolved {
                let _ = sender.send(value);
                return;
            }
        }

        if id.is_none() {
            if value.get("method").and_then(Value::as_str).is_some() {
                self.emit_notification(value);
                return;
            }
        }

        debug!(runtime = %self.id, "incoming: {}", line);
        self.push_log(LogLevel::Info, format!("incoming: {line}")).await;
    }

    fn emit_notification(&self, value: Value) {
        if let Some(observer) = self.notification_observer.read().unwrap().clone() {
            observer(value);
        }
    }

    async fn push_log(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!(runtime = %self.id, "{}", message),
            LogLevel::Warn => warn!(runtime = %self.id, "{}", message),
            LogLevel::Error => error!(runtime = %self.id, "{}", message),
        }
        let entry = LogEntry {
            level,
            message,
            at: Utc::now(),
        };
        if let Some(observer) = self.log_observer.read().unwrap().clone() {
            observer(&entry);
        }
        let mut inner = self.inner.lock().await;
        inner.log_ring.push_back(entry);
        if inner.log_ring.len() > LOG_RING_CAPACITY {
            inner.log_ring.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_config() -> AgentSpawnConfig {
        AgentSpawnConfig {
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_send_request_round_trip_via_echo_child() {
        let runtime = AgentRuntime::new("rt:test-echo", echo_config());
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let response = runtime
            .send_request(payload.clone(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response, payload);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_send_request_times_out_without_reply() {
        let runtime = AgentRuntime::new(
            "rt:test-silent",
            AgentSpawnConfig {
                command: "sleep".to_string(),
                args: vec!["5".to_string()],
                env: HashMap::new(),
            },
        );
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "ping"});
        let result = runtime.send_request(payload, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(AgentRuntimeError::Timeout)));
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_set_spawn_cwd_rejected_after_start() {
        let runtime = AgentRuntime::new("rt:test-cwd", echo_config());
        runtime
            .send_notification(json!({"jsonrpc": "2.0", "method": "ping"}))
            .await
            .unwrap();
        let result = runtime.set_spawn_cwd(PathBuf::from("/tmp")).await;
        assert!(result.is_err());
        runtime.stop().await;
    }

    #[tokio::test]
    async fn test_notification_observer_invoked_for_id_less_method() {
        let runtime = AgentRuntime::new("rt:test-notify", echo_config());
        let (tx, rx) = std::sync::mpsc::channel();
        runtime.set_notification_observer(move |value| {
            let _ = tx.send(value);
        });
        runtime
            .send_notification(json!({"jsonrpc": "2.0", "method": "remote/progress", "params": {"stage": "x"}}))
            .await
            .unwrap();
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received["method"], json!("remote/progress"));
        runtime.stop().await;
    }
}
