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

//! WebSocket command loop.
//!
//! Text frames carry individual JSON commands, processed in receive order
//! for the connection. Columnar results go back as binary frames, JSON and
//! errors as text frames; `done` results produce no frame at all.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde_json::json;
use tracing::{debug, info};

use crate::command::{parse_command, QueryOutcome};
use crate::gateway::Gateway;
use crate::pool::generate_query_id;

/// Drive one connection until the peer disconnects.
pub async fn serve(mut socket: WebSocket, gateway: Arc<Gateway>) {
    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "websocket receive error");
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if !handle_frame(&mut socket, &gateway, text.as_bytes()).await {
                    break;
                }
            }
            Message::Close(_) => break,
            // Binary frames are server-to-client only; pings are handled by axum.
            _ => {}
        }
    }
    info!("websocket disconnected");
}

/// Dispatch one command frame. Returns false when the socket is gone.
async fn handle_frame(socket: &mut WebSocket, gateway: &Gateway, raw: &[u8]) -> bool {
    let reply = match parse_command(raw) {
        Err(e) => Some(Message::Text(
            json!({ "error": e.to_string() }).to_string().into(),
        )),
        Ok(command) => {
            let query_id = command
                .query_id()
                .map(str::to_string)
                .unwrap_or_else(generate_query_id);
            match gateway.dispatch(command, &query_id).await {
                Ok(QueryOutcome::Done) => None,
                Ok(QueryOutcome::Arrow(bytes)) => Some(Message::Binary(bytes.into())),
                Ok(QueryOutcome::Json(text)) => Some(Message::Text(text.into())),
                Err(e) => Some(Message::Text(
                    json!({ "error": e.to_string() }).to_string().into(),
                )),
            }
        }
    };
    match reply {
        Some(frame) => socket.send(frame).await.is_ok(),
        None => true,
    }
}
