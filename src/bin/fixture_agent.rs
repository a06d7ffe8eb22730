// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A scripted stdio agent for the integration test suite. Reads one
//! NDJSON request per line and writes a deterministic reply, optionally
//! preceded by a notification, so tests can assert on fixed output without
//! depending on a real agent binary being installed.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

const SESSION_ID: &str = "sess-fixture";

fn main() {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };

        let id = request.get("id").cloned();
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");

        match method {
            "session/new" => {
                let received_params = request.get("params").cloned().unwrap_or(Value::Null);
                write_line(&mut stdout, &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"sessionId": SESSION_ID, "receivedParams": received_params},
                }));
            }
            "session/load" => {
                write_line(&mut stdout, &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"sessionId": SESSION_ID},
                }));
            }
            "session/prompt" => {
                write_line(&mut stdout, &json!({
                    "jsonrpc": "2.0",
                    "method": "session/update",
                    "params": {"sessionId": SESSION_ID, "update": {"kind": "agent_message_chunk", "text": "hi"}},
                }));
                write_line(&mut stdout, &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"stopReason": "end_turn"},
                }));
            }
            "" => {}
            other => {
                if id.is_some() {
                    write_line(&mut stdout, &json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": {"echoedMethod": other},
                    }));
                }
            }
        }
    }
}

fn write_line(stdout: &mut io::Stdout, value: &Value) {
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}
