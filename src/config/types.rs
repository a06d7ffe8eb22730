// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Broker and agent configuration types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Broker configuration, merged from a JSON file and environment variables
/// (environment wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub port: u16,
    pub path: String,
    pub bind_host: String,
    pub advertise_host: Option<String>,
    pub advertise_protocol: Option<String>,
    pub token: Option<String>,
    pub request_timeout_ms: u64,
    pub session_idle_ttl_ms: u64,
    pub git_root: Option<PathBuf>,
    #[serde(default)]
    pub git_root_map: HashMap<String, PathBuf>,
    pub git_user_name: Option<String>,
    pub git_user_email: Option<String>,
    pub push: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            path: "/acp".to_string(),
            bind_host: "0.0.0.0".to_string(),
            advertise_host: None,
            advertise_protocol: None,
            token: None,
            request_timeout_ms: 60_000,
            session_idle_ttl_ms: 5 * 60 * 1000,
            git_root: None,
            git_root_map: HashMap::new(),
            git_user_name: None,
            git_user_email: None,
            push: true,
        }
    }
}

/// A single agent server definition, as found under `agent_servers.<name>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay. Values are JSON so non-scalars can be carried;
    /// a `null` value unsets the variable from the inherited environment.
    #[serde(default)]
    pub env: HashMap<String, serde_json::Value>,
}

/// The parsed `agent_servers` file: `{"agent_servers": {"<name>": AgentConfig}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistryFile {
    #[serde(default)]
    pub agent_servers: indexmap_like::OrderedMap,
}

/// Minimal insertion-order-preserving string map, since agent resolution
/// falls back to "the first key in file order" and a plain `HashMap` does
/// not preserve that order.
pub mod indexmap_like {
    use super::AgentConfig;
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::fmt;

    #[derive(Debug, Clone, Default)]
    pub struct OrderedMap {
        entries: Vec<(String, AgentConfig)>,
    }

    impl OrderedMap {
        pub fn iter(&self) -> impl Iterator<Item = (&str, &AgentConfig)> {
            self.entries.iter().map(|(k, v)| (k.as_str(), v))
        }

        pub fn get(&self, name: &str) -> Option<&AgentConfig> {
            self.entries.iter().find(|(k, _)| k == name).map(|(_, v)| v)
        }

        pub fn first(&self) -> Option<(&str, &AgentConfig)> {
            self.entries.first().map(|(k, v)| (k.as_str(), v))
        }

        pub fn is_empty(&self) -> bool {
            self.entries.is_empty()
        }

        pub fn len(&self) -> usize {
            self.entries.len()
        }
    }

    impl Serialize for OrderedMap {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(self.entries.len()))?;
            for (k, v) in &self.entries {
                map.serialize_entry(k, v)?;
            }
            map.end()
        }
    }

    impl<'de> Deserialize<'de> for OrderedMap {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            struct OrderedMapVisitor;

            impl<'de> Visitor<'de> for OrderedMapVisitor {
                type Value = OrderedMap;

                fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                    f.write_str("a map of agent name to agent config")
                }

                fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                    let mut entries = Vec::new();
                    while let Some((k, v)) = access.next_entry::<String, AgentConfig>()? {
                        entries.push((k, v));
                    }
                    Ok(OrderedMap { entries })
                }
            }

            deserializer.deserialize_map(OrderedMapVisitor)
        }
    }
}
