// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The WebSocket listener, per-connection dispatcher, and the HTTP admin
//! surface sharing the same port.

mod connection;
pub mod http;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tracing::{error, info, warn};

use crate::config::{AgentRegistry, BrokerConfig};
use crate::error::BrokerError;
use crate::git::GitWorkspaceManager;
use crate::rpc::is_authorized;
use crate::session::SessionRegistry;

pub use connection::ConnectionHandle;

/// State shared across every connection handler task.
pub struct BrokerShared {
    pub config: BrokerConfig,
    pub session_registry: Arc<SessionRegistry>,
    pub git_manager: Arc<GitWorkspaceManager>,
    pub runtimes: RwLock<HashMap<String, Arc<crate::agent_runtime::AgentRuntime>>>,
    pub connections: RwLock<HashMap<String, ConnectionHandle>>,
}

pub struct Broker {
    shared: Arc<BrokerShared>,
    agent_registry: Option<Arc<AgentRegistry>>,
    next_connection_id: AtomicU64,
}

impl Broker {
    pub fn new(config: BrokerConfig, agent_registry: Option<AgentRegistry>) -> Self {
        let git_manager = GitWorkspaceManager::new(
            config.git_root.clone().unwrap_or_else(|| std::env::temp_dir().join("acp-broker-git-root")),
            config.git_root_map.clone(),
            config.git_user_name.clone(),
            config.git_user_email.clone(),
            config.push,
        );
        let session_registry = SessionRegistry::new(Duration::from_millis(config.session_idle_ttl_ms));

        let shared = Arc::new(BrokerShared {
            config,
            session_registry,
            git_manager: Arc::new(git_manager),
            runtimes: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        });

        Self {
            shared,
            agent_registry: agent_registry.map(Arc::new),
            next_connection_id: AtomicU64::new(0),
        }
    }

    /// Bind and serve forever, accepting WebSocket upgrades and admin HTTP
    /// requests on the same port.
    pub async fn run(self: Arc<Self>) -> Result<(), BrokerError> {
        let addr = format!("{}:{}", self.shared.config.bind_host, self.shared.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| BrokerError::AgentRuntime(crate::error::AgentRuntimeError::Io(e)))?;
        info!(%addr, "broker listening");

        tokio::spawn(self.clone().sweep_loop());

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.accept_stream(stream).await {
                    warn!(%peer, error = %e, "connection error");
                }
            });
        }
    }

    /// Periodically sweep sessions whose idle TTL has elapsed, cleaning up
    /// any git worktree they materialized. Runs for the life of the broker;
    /// call via `tokio::spawn(broker.clone().sweep_loop())`.
    pub async fn sweep_loop(self: Arc<Self>) {
        let interval = Duration::from_millis((self.shared.config.session_idle_ttl_ms / 4).max(1000));
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let expired = self.shared.session_registry.sweep_expired().await;
            for record in expired {
                info!(session = %record.session_id, "session expired, cleaning up workspace");
                if let Some(ctx) = &record.git_context {
                    self.shared.git_manager.cleanup_workspace(ctx).await;
                }
                if !self.shared.session_registry.has_sessions_for_runtime(&record.runtime_id).await {
                    if let Some(runtime) = self.shared.runtimes.write().await.remove(&record.runtime_id) {
                        runtime.stop().await;
                    }
                }
            }
        }
    }

    async fn accept_stream(self: &Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let peeked = http::peek_request(&stream).await?;

        if !peeked.is_websocket_upgrade() {
            let mut stream = stream;
            let req = read_consuming(&mut stream).await?;
            let agents: Option<Vec<http::AgentSummary>> = self.agent_registry.as_ref().map(|r| {
                r.iter()
                    .map(|(name, cfg)| http::AgentSummary {
                        name: name.to_string(),
                        command: cfg.command.clone(),
                        args: cfg.args.clone(),
                        env: cfg.env.clone(),
                    })
                    .collect()
            });
            return http::handle_admin_request(&req, agents.as_deref(), &mut stream).await;
        }

        self.accept_websocket(stream).await
    }

    async fn accept_websocket(self: &Arc<Self>, stream: TcpStream) -> std::io::Result<()> {
        let config_path = normalize_path(&self.shared.config.path);
        let token = self.shared.config.token.clone();
        let selected_agent: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
        let selected_agent_cb = selected_agent.clone();

        let callback = move |req: &WsRequest, response: WsResponse| -> Result<WsResponse, ErrorResponse> {
            let path = normalize_path(req.uri().path());
            if path != config_path {
                return Err(reject(StatusCode::NOT_FOUND));
            }

            let auth_header = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok());
            let query_token = req.uri().query().and_then(http::query_token);
            if !is_authorized(token.as_deref(), auth_header, query_token.as_deref()) {
                return Err(reject(StatusCode::UNAUTHORIZED));
            }

            let agent = req
                .uri()
                .query()
                .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("agent=").map(str::to_string)));
            *selected_agent_cb.lock().unwrap() = agent;

            Ok(response)
        };

        let mut ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "websocket handshake rejected");
                return Ok(());
            }
        };

        let agent_name = selected_agent.lock().unwrap().clone();
        let agent_config = match self.resolve_agent(agent_name.as_deref()) {
            Some(cfg) => cfg,
            None => {
                error!("no agent configured, closing connection");
                let _ = ws_stream
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: "no agent configured".into(),
                    })))
                    .await;
                let _ = ws_stream.close(None).await;
                return Ok(());
            }
        };

        let connection_id = format!("conn-{}", self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        connection::handle_connection(ws_stream, connection_id, agent_config, self.shared.clone()).await;
        Ok(())
    }

    fn resolve_agent(&self, explicit: Option<&str>) -> Option<crate::config::AgentConfig> {
        self.agent_registry
            .as_ref()?
            .resolve(explicit)
            .map(|(_, cfg)| cfg.clone())
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn reject(status: StatusCode) -> ErrorResponse {
    WsResponse::builder()
        .status(status)
        .body(None::<String>)
        .expect("valid response")
}

async fn read_consuming(stream: &mut TcpStream) -> std::io::Result<http::RawRequest> {
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 8192];
    let mut filled = 0;
    loop {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if String::from_utf8_lossy(&buf[..filled]).contains("\r\n\r\n") {
            break;
        }
        if filled >= buf.len() {
            break;
        }
    }
    http::parse_request_bytes(&buf[..filled])
}
