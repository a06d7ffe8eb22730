// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from a JSON file plus environment variables.
//!
//! Config-file parsing itself stays schema-free JSON (no JSON5 comment/
//! trailing-comma tolerance — see SPEC_FULL.md §4.F). Environment variables
//! always win over the file when both set a key.

use std::collections::HashMap;
use std::path::Path;

use crate::error::ConfigError;

use super::types::{AgentConfig, AgentRegistryFile, BrokerConfig};

/// Environment variable names, one per `BrokerConfig` field.
pub mod env_keys {
    pub const PORT: &str = "ACP_BROKER_PORT";
    pub const PATH: &str = "ACP_BROKER_PATH";
    pub const BIND_HOST: &str = "ACP_BROKER_BIND_HOST";
    pub const ADVERTISE_HOST: &str = "ACP_BROKER_ADVERTISE_HOST";
    pub const ADVERTISE_PROTOCOL: &str = "ACP_BROKER_ADVERTISE_PROTOCOL";
    pub const TOKEN: &str = "ACP_BROKER_TOKEN";
    pub const REQUEST_TIMEOUT_MS: &str = "ACP_BROKER_REQUEST_TIMEOUT_MS";
    pub const SESSION_IDLE_TTL_MS: &str = "ACP_BROKER_SESSION_IDLE_TTL_MS";
    pub const GIT_ROOT: &str = "ACP_BROKER_GIT_ROOT";
    pub const GIT_USER_NAME: &str = "ACP_BROKER_GIT_USER_NAME";
    pub const GIT_USER_EMAIL: &str = "ACP_BROKER_GIT_USER_EMAIL";
    pub const PUSH: &str = "ACP_BROKER_PUSH";
}

/// Load the broker config file at `path` if it exists, falling back to
/// defaults, then overlay any set environment variables.
pub fn load_broker_config(
    path: Option<&Path>,
    env: &HashMap<String, String>,
) -> Result<BrokerConfig, ConfigError> {
    let mut config = match path {
        Some(p) if p.exists() => load_broker_config_file(p)?,
        _ => BrokerConfig::default(),
    };

    apply_env_overlay(&mut config, env);

    if let Some(root) = &config.git_root {
        if root.is_relative() {
            let cwd = std::env::current_dir()?;
            config.git_root = Some(cwd.join(root));
        }
    }

    Ok(config)
}

fn load_broker_config_file(path: &Path) -> Result<BrokerConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(ConfigError::from)
}

fn apply_env_overlay(config: &mut BrokerConfig, env: &HashMap<String, String>) {
    if let Some(v) = env.get(env_keys::PORT).and_then(|s| s.parse().ok()) {
        config.port = v;
    }
    if let Some(v) = env.get(env_keys::PATH) {
        config.path = v.clone();
    }
    if let Some(v) = env.get(env_keys::BIND_HOST) {
        config.bind_host = v.clone();
    }
    if let Some(v) = env.get(env_keys::ADVERTISE_HOST) {
        config.advertise_host = Some(v.clone());
    }
    if let Some(v) = env.get(env_keys::ADVERTISE_PROTOCOL) {
        config.advertise_protocol = Some(v.clone());
    }
    if let Some(v) = env.get(env_keys::TOKEN) {
        config.token = Some(v.clone());
    }
    if let Some(v) = env.get(env_keys::REQUEST_TIMEOUT_MS).and_then(|s| s.parse().ok()) {
        config.request_timeout_ms = v;
    }
    if let Some(v) = env.get(env_keys::SESSION_IDLE_TTL_MS).and_then(|s| s.parse().ok()) {
        config.session_idle_ttl_ms = v;
    }
    if let Some(v) = env.get(env_keys::GIT_ROOT) {
        config.git_root = Some(v.into());
    }
    if let Some(v) = env.get(env_keys::GIT_USER_NAME) {
        config.git_user_name = Some(v.clone());
    }
    if let Some(v) = env.get(env_keys::GIT_USER_EMAIL) {
        config.git_user_email = Some(v.clone());
    }
    if let Some(v) = env.get(env_keys::PUSH) {
        config.push = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

/// Registry of named agent servers, in file-declaration order.
pub struct AgentRegistry {
    file: AgentRegistryFile,
}

impl AgentRegistry {
    /// Load `{"agent_servers": {...}}` from `path`.
    ///
    /// An absent file and a present-but-empty `agent_servers` map produce
    /// distinct errors, matching the broker's `/acp/agents` 404 behavior.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::AgentConfigNotFound);
        }
        let content = std::fs::read_to_string(path)?;
        let file: AgentRegistryFile = serde_json::from_str(&content)?;
        if file.agent_servers.is_empty() {
            return Err(ConfigError::NoAgentServers);
        }
        Ok(Self { file })
    }

    /// Resolve an agent by explicit name, falling back to `OpenCode` if
    /// present, then the first entry in file order.
    pub fn resolve(&self, explicit: Option<&str>) -> Option<(&str, &AgentConfig)> {
        if let Some(name) = explicit {
            if let Some(cfg) = self.file.agent_servers.get(name) {
                return Some((name, cfg));
            }
            return None;
        }
        if let Some(cfg) = self.file.agent_servers.get("OpenCode") {
            return Some(("OpenCode", cfg));
        }
        self.file.agent_servers.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AgentConfig)> {
        self.file.agent_servers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_broker_config_defaults_without_file() {
        let env = HashMap::new();
        let config = load_broker_config(None, &env).unwrap();
        assert_eq!(config.port, 8787);
    }

    #[test]
    fn test_env_overrides_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broker.json");
        std::fs::write(&path, r#"{"port": 9000}"#).unwrap();

        let mut env = HashMap::new();
        env.insert(env_keys::PORT.to_string(), "9999".to_string());

        let config = load_broker_config(Some(&path), &env).unwrap();
        assert_eq!(config.port, 9999);
    }

    #[test]
    fn test_file_value_used_when_env_absent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("broker.json");
        std::fs::write(&path, r#"{"port": 9000, "push": false}"#).unwrap();

        let env = HashMap::new();
        let config = load_broker_config(Some(&path), &env).unwrap();
        assert_eq!(config.port, 9000);
        assert!(!config.push);
    }

    #[test]
    fn test_agent_registry_missing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agents.json");
        let err = AgentRegistry::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::AgentConfigNotFound));
    }

    #[test]
    fn test_agent_registry_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agents.json");
        std::fs::write(&path, r#"{"agent_servers": {}}"#).unwrap();
        let err = AgentRegistry::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NoAgentServers));
    }

    #[test]
    fn test_agent_registry_resolve_opencode_fallback() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agents.json");
        std::fs::write(
            &path,
            r#"{"agent_servers": {"Zeta": {"command": "z"}, "OpenCode": {"command": "oc"}}}"#,
        )
        .unwrap();
        let registry = AgentRegistry::load(&path).unwrap();
        let (name, cfg) = registry.resolve(None).unwrap();
        assert_eq!(name, "OpenCode");
        assert_eq!(cfg.command, "oc");
    }

    #[test]
    fn test_agent_registry_resolve_first_in_order_without_opencode() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agents.json");
        std::fs::write(
            &path,
            r#"{"agent_servers": {"Zeta": {"command": "z"}, "Alpha": {"command": "a"}}}"#,
        )
        .unwrap();
        let registry = AgentRegistry::load(&path).unwrap();
        let (name, _) = registry.resolve(None).unwrap();
        assert_eq!(name, "Zeta");
    }

    #[test]
    fn test_agent_registry_resolve_explicit_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("agents.json");
        std::fs::write(
            &path,
            r#"{"agent_servers": {"Zeta": {"command": "z"}, "Alpha": {"command": "a"}}}"#,
        )
        .unwrap();
        let registry = AgentRegistry::load(&path).unwrap();
        let (name, cfg) = registry.resolve(Some("Alpha")).unwrap();
        assert_eq!(name, "Alpha");
        assert_eq!(cfg.command, "a");
    }
}
