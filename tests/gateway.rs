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

//! Integration tests for the HTTP/WebSocket gateway.
//!
//! Starts the mirador binary as a child process against a temporary
//! database (extensions skipped — installing them needs network access) and
//! drives it with a real HTTP client.

use std::io::Cursor;
use std::net::TcpStream;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use arrow::ipc::reader::StreamReader;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// RAII guard that kills the server child process on drop.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

/// Start the server on a given port against a fresh temp database.
fn start_server(port: u16, db_path: &std::path::Path) -> ServerGuard {
    let binary = env!("CARGO_BIN_EXE_mirador");
    let child = Command::new(binary)
        .arg("--db-path")
        .arg(db_path)
        .arg("--port")
        .arg(port.to_string())
        .arg("--skip-extensions")
        .env("RUST_LOG", "warn")
        .spawn()
        .expect("failed to start mirador");
    let guard = ServerGuard(child);
    wait_until_ready(port);
    guard
}

/// Poll until the listener accepts connections (bundled engine startup can
/// take a moment on a cold target directory).
fn wait_until_ready(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("server on port {port} did not become ready");
}

fn url(port: u16, path: &str) -> String {
    format!("http://127.0.0.1:{port}{path}")
}

async fn post_command(port: u16, command: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url(port, "/"))
        .json(&command)
        .send()
        .await
        .expect("request failed")
}

#[tokio::test]
async fn exec_returns_empty_body_with_query_id() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18331, &dir.path().join("t.duckdb"));

    let resp = post_command(
        18331,
        json!({
            "type": "exec",
            "sql": "CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1),(2),(3);"
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.headers().contains_key("x-query-id"));
    assert!(resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn json_query_with_persist_replays_identically() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18332, &dir.path().join("t.duckdb"));

    let setup = post_command(
        18332,
        json!({
            "type": "exec",
            "sql": "CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (1),(2),(3);"
        }),
    )
    .await;
    assert_eq!(setup.status(), 200);

    let query = json!({
        "type": "json",
        "sql": "SELECT x FROM t ORDER BY x",
        "persist": true
    });
    let first = post_command(18332, query.clone()).await;
    assert_eq!(first.status(), 200);
    assert_eq!(
        first.headers()["content-type"].to_str().unwrap(),
        "application/json"
    );
    let first_body = first.text().await.unwrap();
    assert_eq!(first_body, r#"[{"x":1},{"x":2},{"x":3}]"#);

    // Second run is served from the cache with the same bytes.
    let second = post_command(18332, query).await;
    assert_eq!(second.status(), 200);
    assert_eq!(second.text().await.unwrap(), first_body);
}

#[tokio::test]
async fn arrow_result_is_an_ipc_stream() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18333, &dir.path().join("t.duckdb"));

    post_command(
        18333,
        json!({
            "type": "exec",
            "sql": "CREATE TABLE t AS SELECT * FROM range(5) r(v)"
        }),
    )
    .await;

    let resp = post_command(
        18333,
        json!({ "type": "arrow", "sql": "SELECT v FROM t ORDER BY v" }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/octet-stream"
    );

    let bytes = resp.bytes().await.unwrap();
    let reader = StreamReader::try_new(Cursor::new(bytes.to_vec()), None).unwrap();
    let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
    assert_eq!(rows, 5);
}

#[tokio::test]
async fn cancel_of_unknown_query_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18334, &dir.path().join("t.duckdb"));

    let resp = reqwest::Client::new()
        .post(url(18334, "/cancel"))
        .json(&json!({ "queryId": "no-such-query" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn cancel_interrupts_a_running_query() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18335, &dir.path().join("t.duckdb"));

    // A cross join large enough to run for many seconds unless interrupted.
    let slow = tokio::spawn(post_command(
        18335,
        json!({
            "type": "json",
            "sql": "SELECT sum(a.range * b.range) FROM range(50000) a, range(50000) b",
            "queryId": "Q1"
        }),
    ));
    tokio::time::sleep(Duration::from_millis(500)).await;

    let cancel = reqwest::Client::new()
        .post(url(18335, "/cancel"))
        .json(&json!({ "queryId": "Q1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(cancel.status(), 200);

    let resp = slow.await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Query was cancelled");
}

#[tokio::test]
async fn engine_errors_use_the_error_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18336, &dir.path().join("t.duckdb"));

    let resp = post_command(
        18336,
        json!({ "type": "json", "sql": "SELECT * FROM missing_table" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
    assert!(resp.headers().contains_key("x-query-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("missing_table"));
}

#[tokio::test]
async fn unknown_command_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18337, &dir.path().join("t.duckdb"));

    let resp = post_command(18337, json!({ "type": "frobnicate" })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("frobnicate"));
}

#[tokio::test]
async fn save_project_as_switches_to_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("a.duckdb");
    let target = dir.path().join("saved/b.duckdb");
    let _server = start_server(18338, &source);

    post_command(
        18338,
        json!({
            "type": "exec",
            "sql": "CREATE TABLE t(x INTEGER); INSERT INTO t VALUES (42);"
        }),
    )
    .await;

    let resp = post_command(
        18338,
        json!({
            "type": "saveProjectAs",
            "sourcePath": source.to_str().unwrap(),
            "targetPath": target.to_str().unwrap()
        }),
    )
    .await;
    assert_eq!(resp.status(), 200);
    assert!(resp.bytes().await.unwrap().is_empty());
    assert!(target.exists());
    assert!(source.exists(), "original database must remain");

    // The session now serves from the copy.
    let resp = post_command(18338, json!({ "type": "json", "sql": "SELECT x FROM t" })).await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"[{"x":42}]"#);
}

#[tokio::test]
async fn connection_close_and_reopen_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("t.duckdb");
    let _server = start_server(18339, &db);

    let close = reqwest::Client::new()
        .post(url(18339, "/connection"))
        .json(&json!({ "action": "close" }))
        .send()
        .await
        .unwrap();
    assert_eq!(close.status(), 200);

    // With no session, commands fail server-side.
    let resp = post_command(18339, json!({ "type": "exec", "sql": "SELECT 1" })).await;
    assert_eq!(resp.status(), 500);

    let reopen = reqwest::Client::new()
        .post(url(18339, "/connection"))
        .json(&json!({ "action": "reopen", "dbPath": db.to_str().unwrap() }))
        .send()
        .await
        .unwrap();
    assert_eq!(reopen.status(), 200);

    let resp = post_command(18339, json!({ "type": "exec", "sql": "SELECT 1" })).await;
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn reopen_without_db_path_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18340, &dir.path().join("t.duckdb"));

    let resp = reqwest::Client::new()
        .post(url(18340, "/connection"))
        .json(&json!({ "action": "reopen" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn graceful_shutdown_exits_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start_server(18341, &dir.path().join("t.duckdb"));

    let resp = reqwest::Client::new()
        .post(url(18341, "/shutdown"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);

    // New commands are refused while the deferred shutdown runs.
    let resp = post_command(18341, json!({ "type": "exec", "sql": "SELECT 1" })).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["message"], "Server is shutting down");

    // The process terminates on its own shortly after.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if server.0.try_wait().unwrap().is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "server did not exit");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn get_with_query_parameter() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18342, &dir.path().join("t.duckdb"));

    let command = json!({ "type": "json", "sql": "SELECT 7 AS seven" }).to_string();
    let resp = reqwest::Client::new()
        .get(url(18342, "/"))
        .query(&[("query", command.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), r#"[{"seven":7}]"#);

    let resp = reqwest::Client::new()
        .get(url(18342, "/"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn websocket_frames_follow_result_type() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18343, &dir.path().join("t.duckdb"));

    let (mut ws, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:18343/")
        .await
        .expect("websocket connect");

    // exec produces no reply frame; the next frame answers the json command.
    ws.send(Message::Text(
        json!({ "type": "exec", "sql": "CREATE TABLE t AS SELECT 1 AS x" }).to_string(),
    ))
    .await
    .unwrap();
    ws.send(Message::Text(
        json!({ "type": "json", "sql": "SELECT x FROM t" }).to_string(),
    ))
    .await
    .unwrap();

    match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => assert_eq!(text, r#"[{"x":1}]"#),
        other => panic!("expected text frame, got {other:?}"),
    }

    ws.send(Message::Text(
        json!({ "type": "arrow", "sql": "SELECT x FROM t" }).to_string(),
    ))
    .await
    .unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Binary(bytes) => {
            let reader = StreamReader::try_new(Cursor::new(bytes.to_vec()), None).unwrap();
            let rows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
            assert_eq!(rows, 1);
        }
        other => panic!("expected binary frame, got {other:?}"),
    }

    // Errors arrive as text frames with an error object.
    ws.send(Message::Text(
        json!({ "type": "json", "sql": "SELECT * FROM nope" }).to_string(),
    ))
    .await
    .unwrap();
    match ws.next().await.unwrap().unwrap() {
        Message::Text(text) => {
            let value: Value = serde_json::from_str(&text).unwrap();
            assert!(value["error"].as_str().unwrap().contains("nope"));
        }
        other => panic!("expected text frame, got {other:?}"),
    }
}

#[tokio::test]
async fn independent_queries_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18344, &dir.path().join("t.duckdb"));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        tasks.push(tokio::spawn(post_command(
            18344,
            json!({ "type": "json", "sql": "SELECT count(*) AS n FROM range(1000000)" }),
        )));
    }
    for task in tasks {
        let resp = task.await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), r#"[{"n":1000000}]"#);
    }
}

// Requires the spatial extension, which is installed from the network on
// first use — run explicitly with `cargo test -- --ignored`.
#[tokio::test]
#[ignore = "requires the spatial extension"]
async fn tile_endpoint_serves_mvt() {
    let dir = tempfile::tempdir().unwrap();
    let binary = env!("CARGO_BIN_EXE_mirador");
    let child = Command::new(binary)
        .arg("--db-path")
        .arg(dir.path().join("t.duckdb"))
        .arg("--port")
        .arg("18345")
        .env("RUST_LOG", "warn")
        .spawn()
        .expect("failed to start mirador");
    let _server = ServerGuard(child);
    wait_until_ready(18345);

    let setup = post_command(
        18345,
        json!({
            "type": "exec",
            "sql": "CREATE TABLE roads(geom GEOMETRY); \
                    INSERT INTO roads VALUES (ST_GeomFromText('LINESTRING(-10 0, 10 0)'));"
        }),
    )
    .await;
    assert_eq!(setup.status(), 200);

    let resp = reqwest::Client::new()
        .get(url(18345, "/tiles/roads/geom/0/0/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/vnd.mapbox-vector-tile"
    );
    assert!(!resp.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_tile_identifier_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let _server = start_server(18346, &dir.path().join("t.duckdb"));

    let resp = reqwest::Client::new()
        .get(url(18346, "/tiles/bad%20name/geom/0/0/0"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("invalid identifier"));
}
