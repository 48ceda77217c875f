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

//! Gateway error type shared across the dispatcher, lifecycle manager and
//! network facade.

use thiserror::Error;

/// Errors surfaced by the gateway. Engine failures keep their message
/// verbatim; interrupts are folded into [`GatewayError::Cancelled`].
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The dispatcher was invoked while no engine session is active.
    #[error("database connection is not initialized")]
    NoEngine,

    /// Unrecognized command `type`.
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// An identifier failed the tile route's safe-name filter.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A required command field was absent.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Request body or frame could not be parsed as a command.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The engine raised a SQL or execution error.
    #[error("{0}")]
    Engine(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The worker was aborted via an engine interrupt or an external cancel.
    #[error("Query was cancelled")]
    Cancelled,

    /// The command arrived while a shutdown or reconnection is in progress.
    #[error("Server is shutting down")]
    ShuttingDown,
}

impl From<arrow::error::ArrowError> for GatewayError {
    fn from(err: arrow::error::ArrowError) -> Self {
        GatewayError::Engine(err.to_string())
    }
}

impl From<duckdb::Error> for GatewayError {
    /// Engine interrupts surface as `Cancelled`; everything else keeps the
    /// engine's message verbatim.
    fn from(err: duckdb::Error) -> Self {
        let message = err.to_string();
        if message.to_ascii_lowercase().contains("interrupt") {
            GatewayError::Cancelled
        } else {
            GatewayError::Engine(message)
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_displays_client_message() {
        assert_eq!(GatewayError::Cancelled.to_string(), "Query was cancelled");
        assert_eq!(
            GatewayError::ShuttingDown.to_string(),
            "Server is shutting down"
        );
    }

    #[test]
    fn engine_message_is_verbatim() {
        let err = GatewayError::Engine("Catalog Error: table t does not exist".into());
        assert_eq!(err.to_string(), "Catalog Error: table t does not exist");
    }
}
