//   Copyright (c) 2024-2026 Anton Kundenko <singaraiona@gmail.com>
//   All rights reserved.
//
//   Permission is hereby granted, free of charge, to any person obtaining a copy
//   of this software and associated documentation files (the "Software"), to deal
//   in the Software without restriction, including without limitation the rights
//   to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
//   copies of the Software, and to permit persons to whom the Software is
//   furnished to do so, subject to the following conditions:
//
//   The above copyright notice and this permission notice shall be included in all
//   copies or substantial portions of the Software.
//
//   THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
//   IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//   FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//   AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//   LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
//   OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
//   SOFTWARE.

//! Command wire format: a tagged enum with a closed set of variants, plus the
//! interception capability for embedders that want to answer commands
//! themselves.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{GatewayError, Result};

/// A structured request from a client. Field presence per variant is enforced
/// during deserialization; unrecognized `type` values and missing fields map
/// to the corresponding gateway errors in [`parse_command`].
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum Command {
    #[serde(rename = "exec", rename_all = "camelCase")]
    Exec {
        sql: String,
        query_id: Option<String>,
    },

    #[serde(rename = "arrow", rename_all = "camelCase")]
    Arrow {
        sql: String,
        query_id: Option<String>,
        #[serde(default)]
        persist: bool,
    },

    #[serde(rename = "json", rename_all = "camelCase")]
    Json {
        sql: String,
        query_id: Option<String>,
        #[serde(default)]
        persist: bool,
    },

    #[serde(rename = "insertArrowFile", rename_all = "camelCase")]
    InsertArrowFile {
        file_name: String,
        table_name: String,
        query_id: Option<String>,
    },

    #[serde(rename = "saveProjectAs", rename_all = "camelCase")]
    SaveProjectAs {
        source_path: PathBuf,
        target_path: PathBuf,
        query_id: Option<String>,
    },
}

impl Command {
    /// The wire-level command type, for logging and cache scoping.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Exec { .. } => "exec",
            Command::Arrow { .. } => "arrow",
            Command::Json { .. } => "json",
            Command::InsertArrowFile { .. } => "insertArrowFile",
            Command::SaveProjectAs { .. } => "saveProjectAs",
        }
    }

    /// Client-provided query identifier, if any.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Command::Exec { query_id, .. }
            | Command::Arrow { query_id, .. }
            | Command::Json { query_id, .. }
            | Command::InsertArrowFile { query_id, .. }
            | Command::SaveProjectAs { query_id, .. } => query_id.as_deref(),
        }
    }

    pub fn sql(&self) -> Option<&str> {
        match self {
            Command::Exec { sql, .. } | Command::Arrow { sql, .. } | Command::Json { sql, .. } => {
                Some(sql)
            }
            _ => None,
        }
    }
}

/// Parse a JSON command, mapping serde's diagnostics onto gateway errors.
pub fn parse_command(raw: &[u8]) -> Result<Command> {
    serde_json::from_slice(raw).map_err(|e| {
        let message = e.to_string();
        if let Some(variant) = backtick_capture(&message, "unknown variant ") {
            GatewayError::UnknownCommand(variant)
        } else if let Some(field) = backtick_capture(&message, "missing field ") {
            GatewayError::MissingField(field)
        } else {
            GatewayError::InvalidCommand(message)
        }
    })
}

/// Extract the backtick-quoted token following `prefix` in a serde message,
/// e.g. "unknown variant `frob`, expected one of ..." -> "frob".
fn backtick_capture(message: &str, prefix: &str) -> Option<String> {
    let rest = message.split(prefix).nth(1)?;
    let rest = rest.strip_prefix('`')?;
    Some(rest.split('`').next()?.to_string())
}

/// Result of a dispatched command, before response framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryOutcome {
    /// The command completed with no payload.
    Done,
    /// Columnar result as an Arrow IPC stream.
    Arrow(Vec<u8>),
    /// Result serialized as a JSON array of record objects.
    Json(String),
}

/// Capability interface for embedders: inspect a command before the built-in
/// dispatcher and either answer it (`Some`) or defer (`None`).
#[async_trait]
pub trait CommandInterceptor: Send + Sync {
    async fn intercept(
        &self,
        command: &Command,
        query_id: &str,
    ) -> Option<Result<QueryOutcome>>;
}
