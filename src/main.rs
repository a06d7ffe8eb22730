// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Broker entry point - CLI flags, config loading, server startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use acp_broker::broker::Broker;
use acp_broker::config::{load_broker_config, AgentRegistry};
use acp_broker::telemetry::{init_telemetry, TelemetryConfig};

/// ACP broker version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// WebSocket/JSON-RPC broker that multiplexes ACP sessions to stdio agent
/// processes.
#[derive(Parser)]
#[command(name = "acp-broker")]
#[command(author, version, about = "ACP broker", long_about = None)]
struct Cli {
    /// Path to the broker config JSON file
    #[arg(long, env = "ACP_BROKER_CONFIG")]
    config: Option<PathBuf>,

    /// Path to the agent_servers JSON file
    #[arg(long, env = "ACP_BROKER_AGENTS_CONFIG")]
    agents_config: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, env = "ACP_BROKER_PORT")]
    port: Option<u16>,

    /// WebSocket upgrade path
    #[arg(long, env = "ACP_BROKER_PATH")]
    path: Option<String>,

    /// Host/interface to bind to
    #[arg(long, env = "ACP_BROKER_BIND_HOST")]
    bind_host: Option<String>,

    /// Hostname to advertise to clients, if different from the bind host
    #[arg(long, env = "ACP_BROKER_ADVERTISE_HOST")]
    advertise_host: Option<String>,

    /// Protocol (ws/wss) to advertise to clients
    #[arg(long, env = "ACP_BROKER_ADVERTISE_PROTOCOL")]
    advertise_protocol: Option<String>,

    /// Bearer token required of incoming connections
    #[arg(long, env = "ACP_BROKER_TOKEN")]
    token: Option<String>,

    /// Per-request timeout in milliseconds
    #[arg(long, env = "ACP_BROKER_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// Idle session TTL in milliseconds
    #[arg(long, env = "ACP_BROKER_SESSION_IDLE_TTL_MS")]
    session_idle_ttl_ms: Option<u64>,

    /// Default root directory for local git clones
    #[arg(long, env = "ACP_BROKER_GIT_ROOT")]
    git_root: Option<PathBuf>,

    /// Git identity used for automated commits
    #[arg(long, env = "ACP_BROKER_GIT_USER_NAME")]
    git_user_name: Option<String>,

    #[arg(long, env = "ACP_BROKER_GIT_USER_EMAIL")]
    git_user_email: Option<String>,

    /// Disable pushing commits upstream
    #[arg(long)]
    no_push: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Show debug output
    #[arg(long)]
    debug: bool,
}

fn env_overrides(cli: &Cli) -> HashMap<String, String> {
    use acp_broker::config::env_keys;
    let mut env: HashMap<String, String> = std::env::vars().collect();

    if let Some(v) = cli.port {
        env.insert(env_keys::PORT.to_string(), v.to_string());
    }
    if let Some(v) = &cli.path {
        env.insert(env_keys::PATH.to_string(), v.clone());
    }
    if let Some(v) = &cli.bind_host {
        env.insert(env_keys::BIND_HOST.to_string(), v.clone());
    }
    if let Some(v) = &cli.advertise_host {
        env.insert(env_keys::ADVERTISE_HOST.to_string(), v.clone());
    }
    if let Some(v) = &cli.advertise_protocol {
        env.insert(env_keys::ADVERTISE_PROTOCOL.to_string(), v.clone());
    }
    if let Some(v) = &cli.token {
        env.insert(env_keys::TOKEN.to_string(), v.clone());
    }
    if let Some(v) = cli.request_timeout_ms {
        env.insert(env_keys::REQUEST_TIMEOUT_MS.to_string(), v.to_string());
    }
    if let Some(v) = cli.session_idle_ttl_ms {
        env.insert(env_keys::SESSION_IDLE_TTL_MS.to_string(), v.to_string());
    }
    if let Some(v) = &cli.git_root {
        env.insert(env_keys::GIT_ROOT.to_string(), v.to_string_lossy().to_string());
    }
    if let Some(v) = &cli.git_user_name {
        env.insert(env_keys::GIT_USER_NAME.to_string(), v.clone());
    }
    if let Some(v) = &cli.git_user_email {
        env.insert(env_keys::GIT_USER_EMAIL.to_string(), v.clone());
    }
    if cli.no_push {
        env.insert(env_keys::PUSH.to_string(), "false".to_string());
    }

    env
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry_config = if cli.debug {
        TelemetryConfig::development()
    } else if cli.verbose {
        TelemetryConfig::default().with_level(tracing::Level::DEBUG)
    } else {
        TelemetryConfig::default()
    };
    let _telemetry_guard = init_telemetry(&telemetry_config)?;

    tracing::info!(version = VERSION, "starting acp-broker");

    let env = env_overrides(&cli);
    let config = load_broker_config(cli.config.as_deref(), &env)?;

    let agents_path = cli.agents_config.unwrap_or_else(|| PathBuf::from("agent_servers.json"));
    let agent_registry = match AgentRegistry::load(&agents_path) {
        Ok(registry) => Some(registry),
        Err(e) => {
            tracing::warn!(path = %agents_path.display(), error = %e, "no agent registry loaded");
            None
        }
    };

    let broker = Arc::new(Broker::new(config, agent_registry));
    broker.run().await?;

    Ok(())
}
