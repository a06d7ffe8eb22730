// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the broker.
//!
//! One `thiserror` enum per module boundary, composed into a top-level
//! `BrokerError` via `#[from]`. `Result<T>` stays an `anyhow` alias for
//! application code that only needs to propagate; handlers that must pick a
//! JSON-RPC error code match on the typed variant first.

use thiserror::Error;

/// Errors from JSON-RPC envelope parsing and validation.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("malformed JSON-RPC payload: {0}")]
    Malformed(String),

    #[error("not a JSON object")]
    NotAnObject,

    #[error("missing \"method\"")]
    MissingMethod,

    #[error("missing required param: {0}")]
    MissingParam(&'static str),

    #[error("unauthorized")]
    Unauthorized,
}

impl RpcError {
    /// Default JSON-RPC error code for this failure class.
    pub fn code(&self) -> i64 {
        match self {
            RpcError::Malformed(_) | RpcError::NotAnObject | RpcError::MissingMethod => -32600,
            RpcError::MissingParam(_) => -32602,
            RpcError::Unauthorized => -32000,
        }
    }
}

/// Errors from the agent runtime supervisor.
#[derive(Error, Debug)]
pub enum AgentRuntimeError {
    #[error("ACP runtime is not started")]
    NotStarted,

    #[error("failed to spawn agent process: {0}")]
    SpawnFailed(String),

    #[error("failed to write to agent stdin: {0}")]
    WriteFailed(String),

    #[error("response timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the git workspace manager.
#[derive(Error, Debug)]
pub enum GitWorkspaceError {
    #[error("unsupported remote URL form: {0}")]
    UnsupportedRemote(String),

    #[error("no revision available for remote (missing branch and revision)")]
    NoRevision,

    #[error("no available clone directory for repo")]
    NoAvailableCloneDir,

    #[error("git command failed: {0}")]
    Git(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the session registry.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
}

/// Errors from configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),

    #[error("ACP config not found")]
    AgentConfigNotFound,

    #[error("config does not define any agent_servers")]
    NoAgentServers,

    #[error("invalid config format: {0}")]
    InvalidFormat(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level broker error, composing every module's error type.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("{0}")]
    Rpc(#[from] RpcError),

    #[error("{0}")]
    AgentRuntime(#[from] AgentRuntimeError),

    #[error("{0}")]
    GitWorkspace(#[from] GitWorkspaceError),

    #[error("{0}")]
    Session(#[from] SessionError),

    #[error("{0}")]
    Config(#[from] ConfigError),
}

/// Result type alias using anyhow for flexible error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Convert any std error into an anyhow::Error.
pub fn to_anyhow<E: std::error::Error + Send + Sync + 'static>(err: E) -> anyhow::Error {
    anyhow::Error::new(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(RpcError::MissingMethod.code(), -32600);
        assert_eq!(RpcError::MissingParam("sessionId").code(), -32602);
        assert_eq!(RpcError::Unauthorized.code(), -32000);
    }

    #[test]
    fn test_broker_error_from_rpc() {
        let err: BrokerError = RpcError::MissingMethod.into();
        assert!(matches!(err, BrokerError::Rpc(_)));
    }

    #[test]
    fn test_config_error_distinct_not_found_vs_empty() {
        let a = ConfigError::AgentConfigNotFound;
        let b = ConfigError::NoAgentServers;
        assert_ne!(a.to_string(), b.to_string());
    }
}
