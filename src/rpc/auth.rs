// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bearer-token authorization for the WebSocket upgrade path.

/// Check an incoming connection's credentials against the configured
/// token. An empty/absent `expected` allows every connection. Otherwise the
/// `Authorization` header must match verbatim or with a `"Bearer "` prefix
/// stripped, or the `token` query parameter must match.
pub fn is_authorized(
    expected: Option<&str>,
    authorization_header: Option<&str>,
    query_token: Option<&str>,
) -> bool {
    let expected = match expected {
        Some(t) if !t.is_empty() => t,
        _ => return true,
    };

    if let Some(header) = authorization_header {
        if header == expected {
            return true;
        }
        if let Some(stripped) = header.strip_prefix("Bearer ") {
            if stripped == expected {
                return true;
            }
        }
    }

    query_token == Some(expected)
}
