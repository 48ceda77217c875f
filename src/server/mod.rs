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

//! Network facade: stateless HTTP and WebSocket endpoints over the gateway.
//!
//! The facade parses commands, frames results and propagates the per-query
//! identifier header; everything else is the gateway's business.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::gateway::Gateway;

/// Build the full route set with permissive CORS.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route(
            "/",
            post(routes::handle_post)
                .get(routes::handle_root_get)
                .options(routes::handle_options),
        )
        .route("/cancel", post(routes::handle_cancel))
        .route("/shutdown", post(routes::handle_shutdown))
        .route("/connection", post(routes::handle_connection))
        .route(
            "/tiles/{table_name}/{column_name}/{z}/{x}/{y}",
            get(routes::handle_tile),
        )
        .route(
            "/tiles/{table_name}/{column_name}",
            get(routes::handle_tile_metadata),
        )
        .layer(CorsLayer::permissive())
        .with_state(gateway)
}
