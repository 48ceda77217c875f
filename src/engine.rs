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

//! Engine session: the gateway's handle on the embedded DuckDB database.
//!
//! One `Session` exists process-wide at a time. Workers never touch it
//! directly — they execute on `Cursor`s, independent connections cloned from
//! the session. Cursors are `Send` but not `Sync`; a cursor belongs to
//! exactly one worker task for that task's entire lifetime.

use std::num::NonZeroUsize;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::available_parallelism;

use duckdb::{Connection, InterruptHandle};
use tracing::{debug, info};

use crate::error::{GatewayError, Result};

/// Process CPU count, falling back to 4 when it cannot be determined.
pub fn cpu_count() -> usize {
    available_parallelism().map(NonZeroUsize::get).unwrap_or(4)
}

// ---------------------------------------------------------------------------
// Extensions
// ---------------------------------------------------------------------------

/// Engine extensions the gateway installs and loads at session open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    Httpfs,
    Iceberg,
    Spatial,
    H3,
}

impl Extension {
    /// The full set a production session requires.
    pub const MANDATORY: [Extension; 4] = [
        Extension::Httpfs,
        Extension::Iceberg,
        Extension::Spatial,
        Extension::H3,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Extension::Httpfs => "httpfs",
            Extension::Iceberg => "iceberg",
            Extension::Spatial => "spatial",
            Extension::H3 => "h3",
        }
    }

    fn install_sql(self) -> &'static str {
        match self {
            Extension::Httpfs => "INSTALL httpfs; LOAD httpfs;",
            Extension::Iceberg => "INSTALL iceberg; LOAD iceberg;",
            Extension::Spatial => "INSTALL spatial; LOAD spatial;",
            // h3 lives in the community repository.
            Extension::H3 => "INSTALL h3 FROM community; LOAD h3;",
        }
    }
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Everything needed to (re)open a session. Kept by the gateway so the same
/// extension set applies across save-as and reopen.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub path: PathBuf,
    pub extensions: Vec<Extension>,
    pub threads: usize,
}

impl SessionConfig {
    /// Production configuration: all mandatory extensions, engine threads
    /// sized to the CPU count.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SessionConfig {
            path: path.into(),
            extensions: Extension::MANDATORY.to_vec(),
            threads: cpu_count(),
        }
    }

    /// Same, but with no extensions. For development and offline test
    /// environments — extension install needs network access on first use.
    pub fn bare(path: impl Into<PathBuf>) -> Self {
        SessionConfig {
            extensions: Vec::new(),
            ..SessionConfig::new(path)
        }
    }

    /// Re-target the configuration at a different database file.
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        SessionConfig {
            path: path.into(),
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Session and cursors
// ---------------------------------------------------------------------------

/// An open engine handle. Either fully initialized — database open, all
/// configured extensions loaded, thread count applied — or not constructed
/// at all.
pub struct Session {
    conn: Connection,
    path: PathBuf,
}

impl Session {
    /// Open the database (creating it if absent), install and load the
    /// configured extensions, and set the engine thread count. Any failure
    /// propagates; there is no partially-initialized session.
    pub fn open(config: &SessionConfig) -> Result<Session> {
        let conn = Connection::open(&config.path)?;
        for extension in &config.extensions {
            debug!(extension = extension.name(), "loading engine extension");
            conn.execute_batch(extension.install_sql())?;
        }
        conn.execute_batch(&format!("SET threads TO {}", config.threads))?;
        info!(
            path = %config.path.display(),
            threads = config.threads,
            "initialized engine session"
        );
        Ok(Session {
            conn,
            path: config.path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create an independent cursor for one worker task. Applies best-effort
    /// per-cursor settings; their failure never aborts the query.
    pub fn cursor(&self) -> Result<Cursor> {
        let conn = self.conn.try_clone()?;
        if let Err(e) = conn.execute_batch("SET enable_geoparquet_conversion = false") {
            debug!(error = %e, "per-cursor setting skipped");
        }
        Ok(Cursor { conn })
    }

    /// Signal the statement currently executing on the session's own
    /// connection to abort. Idempotent; a no-op when nothing is running.
    pub fn interrupt(&self) {
        self.conn.interrupt_handle().interrupt();
    }

    /// Flush the WAL into the main database file.
    pub fn force_checkpoint(&self) -> Result<()> {
        self.conn.execute_batch("FORCE CHECKPOINT")?;
        Ok(())
    }

    /// Release the handle. Subsequent cursor acquisition requires a fresh
    /// `Session::open`.
    pub fn close(self) -> Result<()> {
        self.conn
            .close()
            .map_err(|(_, e)| GatewayError::from(e))
    }
}

/// An independent execution context cloned from the session.
///
/// Owned by exactly one worker task; closed (dropped) on every exit path,
/// including interruption. Dereferences to the underlying connection for
/// statement execution.
pub struct Cursor {
    conn: Connection,
}

impl Cursor {
    /// Thread-safe token that interrupts whatever this cursor is executing.
    /// Valid to fire from any thread while the cursor lives.
    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.conn.interrupt_handle()
    }
}

impl Deref for Cursor {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}
