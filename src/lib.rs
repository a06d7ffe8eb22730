// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A long-lived broker that terminates WebSocket/JSON-RPC connections from
//! browsers and IDEs speaking the Agent Client Protocol, and multiplexes
//! each session to a dedicated stdio-speaking agent child process.
//!
//! # Architecture
//!
//! - [`rpc`] - JSON-RPC envelope classification, normalization, and the
//!   bearer-token authorization predicate.
//! - [`agent_runtime`] - supervises one spawned agent child process: line
//!   framing over stdio, request/response correlation, timeouts, respawn.
//! - [`git`] - git-root resolution and worktree materialization for
//!   sessions that carry remote git context.
//! - [`session`] - the session registry and its Active/Draining/Expired
//!   lifecycle.
//! - [`broker`] - the WebSocket listener, per-connection dispatch, and the
//!   HTTP admin surface (`/health`, `/acp/agents`).
//! - [`config`] - broker and agent-registry configuration loading.
//! - [`error`] - error types and the crate-wide `Result` alias.
//! - [`telemetry`] - tracing setup and the notification log-coalescer.
//!
//! # Example
//!
//! ```rust,ignore
//! use acp_broker::config::load_broker_config;
//! use acp_broker::broker::Broker;
//!
//! let config = load_broker_config(None, &std::env::vars().collect())?;
//! std::sync::Arc::new(Broker::new(config, None)).run().await?;
//! ```

pub mod agent_runtime;
pub mod broker;
pub mod config;
pub mod error;
pub mod git;
pub mod rpc;
pub mod session;
pub mod telemetry;

pub use error::{BrokerError, Result};

/// Broker version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
