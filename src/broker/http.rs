// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Hand-rolled HTTP/1.1 request parsing for the admin routes
//! (`/health`, `/acp/agents`) and for peeking a connection to decide
//! whether it is a WebSocket upgrade before tungstenite takes over.

use std::collections::HashMap;
use std::io;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const PEEK_CAP: usize = 8192;

/// One entry of the `GET /acp/agents` response body.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub env: std::collections::HashMap<String, Value>,
}

/// A minimally parsed HTTP/1.1 request line plus headers.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
}

impl RawRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        let upgrade = self.header("upgrade").map(|v| v.eq_ignore_ascii_case("websocket")).unwrap_or(false);
        let connection = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
        upgrade && connection
    }
}

/// Peek at `stream` (without consuming it) and parse the request line and
/// headers. Used purely to decide whether this connection is a WebSocket
/// upgrade attempt; the bytes remain available for tungstenite or for our
/// own consuming read afterward.
pub async fn peek_request(stream: &TcpStream) -> io::Result<RawRequest> {
    let mut buf = vec![0u8; PEEK_CAP];
    let mut filled = 0;
    loop {
        let n = stream.peek(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if let Some(text) = std::str::from_utf8(&buf[..filled]).ok() {
            if text.contains("\r\n\r\n") {
                break;
            }
        }
        if filled >= buf.len() {
            break;
        }
    }
    parse_request(&buf[..filled])
}

/// Parse a request line and headers from already-read bytes (used after a
/// consuming read decided this is not a WebSocket upgrade).
pub fn parse_request_bytes(bytes: &[u8]) -> io::Result<RawRequest> {
    parse_request(bytes)
}

fn parse_request(bytes: &[u8]) -> io::Result<RawRequest> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty request"))?;

    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing method"))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing target"))?;

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    Ok(RawRequest { method, path, query, headers })
}

/// Extract the `token` query parameter, if present.
pub fn query_token(query: Option<&str>) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == "token" {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Write a JSON response with CORS enabled for every origin.
pub async fn write_json_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    status: u16,
    reason: &str,
    body: &Value,
) -> io::Result<()> {
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body_str}",
        body_str.len()
    );
    writer.write_all(response.as_bytes()).await
}

/// Handle a non-upgrade admin request: `/health`, `/acp/agents`, 404 for
/// anything else.
pub async fn handle_admin_request<W: AsyncWrite + Unpin>(
    req: &RawRequest,
    agents: Option<&[AgentSummary]>,
    writer: &mut W,
) -> io::Result<()> {
    match (req.method.as_str(), req.path.as_str()) {
        ("GET", "/health") => write_json_response(writer, 200, "OK", &json!({"ok": true})).await,
        ("GET", "/acp/agents") => match agents {
            Some(entries) => write_json_response(writer, 200, "OK", &json!({"agents": entries})).await,
            None => {
                write_json_response(
                    writer,
                    404,
                    "Not Found",
                    &json!({"error": {"message": "ACP config not found"}}),
                )
                .await
            }
        },
        _ => write_json_response(writer, 404, "Not Found", &json!({"error": {"message": "not found"}})).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_line_and_headers() {
        let raw = b"GET /acp?agent=OpenCode&token=abc HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/acp");
        assert_eq!(req.query.as_deref(), Some("agent=OpenCode&token=abc"));
        assert!(req.is_websocket_upgrade());
    }

    #[test]
    fn test_query_token_extraction() {
        assert_eq!(query_token(Some("agent=x&token=secret")), Some("secret".to_string()));
        assert_eq!(query_token(None), None);
        assert_eq!(query_token(Some("agent=x")), None);
    }

    #[test]
    fn test_non_upgrade_request_detected() {
        let raw = b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let req = parse_request(raw).unwrap();
        assert!(!req.is_websocket_upgrade());
    }
}
