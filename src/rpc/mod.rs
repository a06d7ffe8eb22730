// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-RPC 2.0 envelope handling for the ACP dialect.

mod auth;
mod codec;

pub use auth::is_authorized;
pub use codec::{build_error_envelope, classify, expand_batch, normalize_response, Envelope};
