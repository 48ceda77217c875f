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

//! Mirador server binary.
//!
//! Usage:
//!     mirador --db-path <PATH> [OPTIONS]
//!
//! Options:
//!     --db-path <PATH>      Path to the DuckDB database file (required)
//!     --port <PORT>         Listen port (default: 3000)
//!     --cache-dir <PATH>    Result cache directory (default: temp dir)
//!     --skip-extensions     Do not install engine extensions (offline/dev)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mirador::cache::DiskCache;
use mirador::engine::SessionConfig;
use mirador::gateway::Gateway;
use mirador::lifecycle;
use mirador::server;

#[derive(Parser)]
#[command(
    name = "mirador",
    version,
    about = "HTTP/WebSocket gateway for an embedded DuckDB analytics database"
)]
struct Args {
    /// Path to the DuckDB database file
    #[arg(long = "db-path")]
    db_path: Option<PathBuf>,

    /// Port to listen on
    #[arg(long, default_value_t = 3000)]
    port: u16,

    /// Result cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Skip installing engine extensions (development / offline use)
    #[arg(long)]
    skip_extensions: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let start = Instant::now();

    let Some(db_path) = args.db_path else {
        eprintln!("Error: no database path provided. Please specify a path using --db-path.");
        std::process::exit(1);
    };

    info!(
        cwd = %std::env::current_dir().map(|d| d.display().to_string()).unwrap_or_default(),
        db_path = %db_path.display(),
        port = args.port,
        "backend starting"
    );

    if let Err(e) = lifecycle::prepare_database_path(&db_path) {
        eprintln!("Error: failed to prepare database directory: {e}");
        std::process::exit(1);
    }
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "database file check done");

    let config = if args.skip_extensions {
        SessionConfig::bare(&db_path)
    } else {
        SessionConfig::new(&db_path)
    };

    let cache_dir = args
        .cache_dir
        .unwrap_or_else(|| std::env::temp_dir().join("mirador-cache"));
    let cache = match DiskCache::new(&cache_dir) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error: failed to initialize cache at {}: {e}", cache_dir.display());
            std::process::exit(1);
        }
    };
    info!(dir = %cache.directory().display(), "caching enabled");

    let gateway = match Gateway::open(config, Arc::new(cache)) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            eprintln!("Error: failed to initialize database backend: {e}");
            std::process::exit(1);
        }
    };
    info!(
        elapsed_ms = start.elapsed().as_millis() as u64,
        "backend initialization complete"
    );

    let app = server::router(gateway);
    let addr = format!("0.0.0.0:{}", args.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("Error: failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "listening at http://localhost:{0} and ws://localhost:{0}",
        args.port
    );

    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("Error: server terminated: {e}");
        std::process::exit(1);
    }
}
