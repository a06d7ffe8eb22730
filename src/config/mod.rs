// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for the broker.
//!
//! Two independent sources, loaded separately:
//! - Broker config: a JSON file (port, bind host, auth token, git settings),
//!   overlaid by `ACP_BROKER_*` environment variables.
//! - Agent registry: a JSON file naming the `agent_servers` the broker may
//!   spawn, keyed by agent name in file-declaration order.

mod loader;
mod types;

pub use loader::{env_keys, load_broker_config, AgentRegistry};
pub use types::{AgentConfig, AgentRegistryFile, BrokerConfig};
