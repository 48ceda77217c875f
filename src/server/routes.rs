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

//! HTTP route handlers: command dispatch, cancellation, shutdown, connection
//! management and the tile endpoints.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::command::{parse_command, QueryOutcome};
use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::pool::generate_query_id;
use crate::tile;

use super::ws;

pub(crate) const QUERY_ID_HEADER: &str = "x-query-id";
const MVT_CONTENT_TYPE: &str = "application/vnd.mapbox-vector-tile";

// ---------------------------------------------------------------------------
// Response framing
// ---------------------------------------------------------------------------

pub(crate) fn error_body(message: &str) -> String {
    json!({ "success": false, "error": { "message": message } }).to_string()
}

fn error_status(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::NoEngine | GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn error_response(err: &GatewayError) -> Response {
    (
        error_status(err),
        [(header::CONTENT_TYPE, "application/json")],
        error_body(&err.to_string()),
    )
        .into_response()
}

fn outcome_response(outcome: QueryOutcome) -> Response {
    match outcome {
        QueryOutcome::Done => {
            (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain")], "").into_response()
        }
        QueryOutcome::Arrow(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        QueryOutcome::Json(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            text,
        )
            .into_response(),
    }
}

/// Parse and dispatch one command, tagging the response with the effective
/// query identifier.
async fn handle_command(gateway: &Gateway, raw: &[u8]) -> Response {
    let command = match parse_command(raw) {
        Ok(command) => command,
        Err(e) => return error_response(&e),
    };
    let query_id = command
        .query_id()
        .map(str::to_string)
        .unwrap_or_else(generate_query_id);

    let mut response = match gateway.dispatch(command, &query_id).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => error_response(&e),
    };
    if let Ok(value) = HeaderValue::from_str(&query_id) {
        response.headers_mut().insert(QUERY_ID_HEADER, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Command endpoints
// ---------------------------------------------------------------------------

pub async fn handle_post(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    handle_command(&gateway, &body).await
}

/// `GET /` doubles as the WebSocket endpoint and the `?query=` form.
pub async fn handle_root_get(
    State(gateway): State<Arc<Gateway>>,
    upgrade: Option<WebSocketUpgrade>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(upgrade) = upgrade {
        return upgrade.on_upgrade(move |socket| ws::serve(socket, gateway));
    }
    match params.get("query") {
        Some(query) => handle_command(&gateway, query.as_bytes()).await,
        None => (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "text/plain")],
            "Missing 'query' parameter",
        )
            .into_response(),
    }
}

pub async fn handle_options() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Admin endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CancelRequest {
    #[serde(rename = "queryId")]
    query_id: Option<String>,
}

pub async fn handle_cancel(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let request: CancelRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/json")],
                error_body(&format!("invalid cancel request: {e}")),
            )
                .into_response()
        }
    };
    let Some(query_id) = request.query_id else {
        return (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json")],
            error_body("Missing queryId in request"),
        )
            .into_response();
    };

    info!(query_id, "received cancellation request");
    if gateway.cancel_query(&query_id) {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            json!({
                "success": true,
                "message": format!("Query {query_id} cancelled successfully"),
            })
            .to_string(),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            error_body(&format!("Query {query_id} not found or already completed")),
        )
            .into_response()
    }
}

pub async fn handle_shutdown(State(gateway): State<Arc<Gateway>>) -> Response {
    gateway.graceful_shutdown();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        json!({ "success": true, "message": "Graceful shutdown initiated" }).to_string(),
    )
        .into_response()
}

#[derive(Deserialize)]
struct ConnectionRequest {
    action: Option<String>,
    #[serde(rename = "dbPath")]
    db_path: Option<PathBuf>,
}

/// Admin-scoped connection control, for hosts where the database file stays
/// locked while a session is open.
pub async fn handle_connection(State(gateway): State<Arc<Gateway>>, body: Bytes) -> Response {
    let request: ConnectionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                [(header::CONTENT_TYPE, "application/json")],
                error_body(&format!("invalid connection request: {e}")),
            )
                .into_response()
        }
    };

    match request.action.as_deref() {
        Some("close") => match gateway.close_connection().await {
            Ok(()) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                json!({ "success": true, "message": "Connection closed" }).to_string(),
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "error closing connection");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [(header::CONTENT_TYPE, "application/json")],
                    error_body(&e.to_string()),
                )
                    .into_response()
            }
        },
        Some("reopen") => {
            let Some(db_path) = request.db_path else {
                return (
                    StatusCode::BAD_REQUEST,
                    [(header::CONTENT_TYPE, "application/json")],
                    error_body("dbPath is required for reopening connection"),
                )
                    .into_response();
            };
            match gateway.reopen_connection(&db_path).await {
                Ok(()) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/json")],
                    json!({ "success": true, "message": "Connection reopened" }).to_string(),
                )
                    .into_response(),
                Err(e) => {
                    warn!(error = %e, "error reopening connection");
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        [(header::CONTENT_TYPE, "application/json")],
                        error_body(&e.to_string()),
                    )
                        .into_response()
                }
            }
        }
        other => (
            StatusCode::BAD_REQUEST,
            [(header::CONTENT_TYPE, "application/json")],
            error_body(&format!("Invalid action: {}", other.unwrap_or("<none>"))),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Tile endpoints
// ---------------------------------------------------------------------------

fn tile_error_response(err: &GatewayError) -> Response {
    let status = match err {
        GatewayError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        error_body(&err.to_string()),
    )
        .into_response()
}

pub async fn handle_tile(
    State(gateway): State<Arc<Gateway>>,
    Path((table_name, column_name, z, x, y)): Path<(String, String, u32, u32, u32)>,
) -> Response {
    match tile::render_tile(&gateway, &table_name, &column_name, z, x, y).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, MVT_CONTENT_TYPE)],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(table_name, column_name, z, x, y, error = %e, "error generating dynamic tile");
            tile_error_response(&e)
        }
    }
}

pub async fn handle_tile_metadata(
    State(gateway): State<Arc<Gateway>>,
    Path((table_name, column_name)): Path<(String, String)>,
) -> Response {
    match tile::tile_metadata(&gateway, &table_name, &column_name).await {
        Ok(metadata) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            metadata,
        )
            .into_response(),
        Err(e) => {
            warn!(table_name, column_name, error = %e, "error generating tile metadata");
            tile_error_response(&e)
        }
    }
}
