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

//! Mirador: an asynchronous HTTP/WebSocket gateway in front of an embedded
//! DuckDB analytics database.
//!
//! Architecture: the async facade (axum) never touches the engine. Commands
//! are dispatched through the [`gateway::Gateway`], which runs synchronous
//! engine calls on a bounded worker pool with per-query cancellation
//! tracking, a content-addressed result cache, and a lifecycle manager that
//! handles save-as, close/reopen and graceful shutdown without losing data.

pub mod cache;
pub mod command;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod pool;
pub mod query;
pub mod server;
pub mod tile;

pub use command::{Command, CommandInterceptor, QueryOutcome};
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
