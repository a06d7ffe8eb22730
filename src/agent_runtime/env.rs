// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Environment overlay for spawned agent children.

use std::collections::HashMap;

use serde_json::Value;

/// Build the environment for a child process: start from `base` (normally
/// the broker's own environment), then apply `overlay`. A `null` overlay
/// value removes the variable; scalars pass through as their string form;
/// objects and arrays are JSON-encoded.
pub fn build_child_env(
    base: &HashMap<String, String>,
    overlay: &HashMap<String, Value>,
) -> HashMap<String, String> {
    let mut env = base.clone();
    for (key, value) in overlay {
        match value {
            Value::Null => {
                env.remove(key);
            }
            Value::String(s) => {
                env.insert(key.clone(), s.clone());
            }
            Value::Bool(b) => {
                env.insert(key.clone(), b.to_string());
            }
            Value::Number(n) => {
                env.insert(key.clone(), n.to_string());
            }
            other => {
                env.insert(key.clone(), other.to_string());
            }
        }
    }
    env
}
