// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Telemetry and logging infrastructure.
//!
//! # Usage
//!
//! ```rust,ignore
//! use acp_broker::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```
//!
//! `LogCoalescer` groups bursty `remote/progress` notifications per session
//! into a single log line; flush it explicitly on connection close and
//! process shutdown rather than relying on a drop hook.

mod coalesce;
mod init;

pub use coalesce::LogCoalescer;
pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
