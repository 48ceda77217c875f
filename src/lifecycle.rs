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

//! Connection lifecycle: startup recovery, quiesce/swap/reopen sequences for
//! save-as and connection management, and graceful shutdown.
//!
//! Ordering invariant for every swap: block new work, cancel in-flight work,
//! clear the cache, checkpoint, close — then open the replacement. A failed
//! save-as reopens the original; the gateway is never left session-less
//! silently.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};

use crate::engine::{Session, SessionConfig};
use crate::error::{GatewayError, Result};
use crate::gateway::Gateway;

/// The engine's write-ahead log sidecar for a database file.
pub fn wal_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(".wal");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Filesystem helpers
// ---------------------------------------------------------------------------

/// Remove a file; on permission denial, relax the file mode and retry once.
pub fn try_remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            warn!(path = %path.display(), "permission denied removing file, unlocking and retrying");
            unlock_path(path);
            fs::remove_file(path)
        }
        Err(e) => Err(e),
    }
}

/// Best-effort: relax mode bits so the file can be deleted.
fn unlock_path(path: &Path) {
    let Ok(metadata) = fs::metadata(path) else {
        return;
    };
    let mut permissions = metadata.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o666);
    }
    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
    }
    if let Err(e) = fs::set_permissions(path, permissions) {
        warn!(path = %path.display(), error = %e, "failed to relax file permissions");
    }
}

/// Quarantine (rename) and then remove a stale WAL sidecar left by an
/// unclean shutdown — a leftover WAL can prevent opening the database.
pub fn cleanup_stale_wal(db_path: &Path) {
    let wal = wal_path(db_path);
    if !wal.exists() {
        return;
    }
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let quarantine = PathBuf::from(format!("{}.quarantine.{stamp}", wal.display()));

    // Rename first so a racing process never sees a half-deleted WAL.
    match fs::rename(&wal, &quarantine) {
        Ok(()) => {
            warn!(
                wal = %wal.display(),
                quarantine = %quarantine.display(),
                "quarantined stale WAL file"
            );
            if try_remove(&quarantine).is_err() {
                warn!(quarantine = %quarantine.display(), "left quarantined WAL in place");
            }
        }
        Err(_) => {
            if let Err(e) = try_remove(&wal) {
                error!(wal = %wal.display(), error = %e, "failed to remove stale WAL");
            }
        }
    }
}

/// Startup checks before the first open: the database directory must exist,
/// and a zero-length database file blocks open and is removed.
pub fn prepare_database_path(db_path: &Path) -> Result<()> {
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            warn!(dir = %dir.display(), "database directory does not exist, creating");
            fs::create_dir_all(dir)?;
        }
    }
    if let Ok(metadata) = fs::metadata(db_path) {
        if metadata.len() == 0 {
            warn!(path = %db_path.display(), "found empty database file, removing");
            try_remove(db_path)?;
        }
    }
    Ok(())
}

/// Open a session, recovering from stale-WAL and corrupt-file failures.
///
/// A stale WAL is cleaned proactively. If open still fails with an I/O error
/// mentioning the WAL, clean again and retry once; otherwise (or if the
/// retry fails) remove the database file and create it fresh.
pub fn open_session_with_recovery(config: &SessionConfig) -> Result<Session> {
    cleanup_stale_wal(&config.path);

    let err = match Session::open(config) {
        Ok(session) => return Ok(session),
        Err(e) => e,
    };

    let message = err.to_string().to_lowercase();
    if !message.contains("io error") {
        return Err(err);
    }
    error!(path = %config.path.display(), error = %err, "database file error");

    if message.contains("wal") {
        warn!("error indicates a WAL issue, cleaning up and reconnecting");
        cleanup_stale_wal(&config.path);
        match Session::open(config) {
            Ok(session) => {
                info!("recovered by removing stale WAL");
                return Ok(session);
            }
            Err(e) => warn!(error = %e, "WAL cleanup path failed"),
        }
    }

    let wal = wal_path(&config.path);
    if wal.exists() {
        if let Err(e) = try_remove(&wal) {
            warn!(error = %e, "could not remove WAL during recovery");
        }
    }
    if config.path.exists() {
        try_remove(&config.path)?;
        info!(path = %config.path.display(), "removed invalid database file");
    }
    Session::open(config)
}

/// Poll up to one second for the engine to delete the WAL after a
/// checkpoint.
pub async fn wait_for_wal_disappear(db_path: &Path) {
    let wal = wal_path(db_path);
    let deadline = Instant::now() + Duration::from_secs(1);
    while wal.exists() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Gateway lifecycle transitions
// ---------------------------------------------------------------------------

impl Gateway {
    /// Quiesce for a connection change: block new commands, cancel in-flight
    /// work, clear the cache, checkpoint and close the current session.
    /// Every step is best-effort; failures log and continue.
    pub async fn deactivate_backend(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.registry.cancel_all();

        info!("clearing cache before reconnection");
        self.cache.clear();

        let mut session = self.session.lock().await;
        if let Some(current) = session.as_ref() {
            info!("forcing checkpoint before closing current connection");
            let path = current.path().to_path_buf();
            if let Err(e) = current.force_checkpoint() {
                warn!(error = %e, "FORCE CHECKPOINT failed, continuing");
            }
            wait_for_wal_disappear(&path).await;
        }
        if let Some(current) = session.take() {
            if let Err(e) = current.close() {
                warn!(error = %e, "error closing current connection, continuing");
            }
        }
    }

    /// Open a session at `path` and resume accepting commands.
    pub async fn activate_backend(&self, path: &Path) -> Result<()> {
        let config = {
            let current = self.config.lock().unwrap_or_else(|e| e.into_inner());
            current.with_path(path)
        };
        info!(path = %config.path.display(), "re-initializing engine session");

        let open_config = config.clone();
        let session = tokio::task::spawn_blocking(move || Session::open(&open_config))
            .await
            .map_err(|e| GatewayError::Engine(e.to_string()))??;

        let mut guard = self.session.lock().await;
        *guard = Some(session);
        *self.config.lock().unwrap_or_else(|e| e.into_inner()) = config;
        self.shutdown.store(false, Ordering::Relaxed);
        Ok(())
    }

    /// Quiesce, copy the database file to `target`, and swap the session to
    /// it. On failure after the quiesce, the original database is reopened
    /// and the error re-raised.
    pub async fn save_project_as(&self, source: &Path, target: &Path) -> Result<()> {
        let source_abs = std::path::absolute(source)?;
        let target_abs = std::path::absolute(target)?;
        if source_abs == target_abs {
            info!("source and target paths are the same; nothing to do");
            return Ok(());
        }

        info!(
            source = %source_abs.display(),
            target = %target_abs.display(),
            "starting save project as"
        );
        self.deactivate_backend().await;

        if let Err(e) = self.copy_and_activate(&source_abs, &target_abs).await {
            warn!(error = %e, "save project as failed, restoring original connection");
            match self.activate_backend(&source_abs).await {
                Ok(()) => info!("restored connection to original database"),
                Err(restore) => {
                    error!(error = %restore, "failed to restore original database connection")
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn copy_and_activate(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(dir) = target.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                if let Err(e) = fs::create_dir_all(dir) {
                    warn!(error = %e, "failed to ensure target directory exists");
                }
            }
        }

        // The copy must not block the request scheduler.
        let (from, to) = (source.to_path_buf(), target.to_path_buf());
        tokio::task::spawn_blocking(move || fs::copy(&from, &to))
            .await
            .map_err(|e| GatewayError::Engine(e.to_string()))??;
        info!(target = %target.display(), "copy completed");

        self.activate_backend(target).await
    }

    /// Close the session without reopening, releasing the database file lock
    /// for external file operations.
    pub async fn close_connection(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        match session.take() {
            Some(current) => {
                info!("closing connection to release file lock");
                current.close()?;
                info!("connection closed");
            }
            None => info!("connection already closed"),
        }
        Ok(())
    }

    /// Close any existing session and re-initialize at `path`.
    pub async fn reopen_connection(&self, path: &Path) -> Result<()> {
        {
            let mut session = self.session.lock().await;
            if let Some(current) = session.take() {
                info!("closing existing connection before reopening");
                if let Err(e) = current.close() {
                    warn!(error = %e, "error closing connection before reopen");
                }
            }
        }
        self.activate_backend(path).await
    }

    /// Begin a graceful shutdown. Blocks new commands and cancels in-flight
    /// work immediately; the checkpoint, close and process exit happen on a
    /// deferred task so the caller can still receive a response.
    pub fn graceful_shutdown(self: std::sync::Arc<Self>) {
        info!("received shutdown request, preparing for graceful shutdown");
        self.shutdown.store(true, Ordering::Relaxed);
        self.registry.cancel_all();
        info!("clearing cache");
        self.cache.clear();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.finalize_shutdown().await;
        });
    }

    async fn finalize_shutdown(&self) {
        info!("performing delayed shutdown");
        let db_path = self.database_path();
        {
            let mut session = self.session.lock().await;
            if let Some(current) = session.as_ref() {
                info!("forcing checkpoint to flush WAL into the main database file");
                if let Err(e) = current.force_checkpoint() {
                    warn!(error = %e, "checkpoint failed during shutdown");
                }
                wait_for_wal_disappear(&db_path).await;
            }
            if let Some(current) = session.take() {
                if let Err(e) = current.close() {
                    warn!(error = %e, "error closing connection during shutdown");
                }
            }
        }

        let wal = wal_path(&db_path);
        if wal.exists() {
            info!(wal = %wal.display(), "removing remaining WAL file at shutdown");
            if let Err(e) = try_remove(&wal) {
                warn!(error = %e, "could not remove WAL on shutdown");
            }
        }

        self.pool.shutdown();
        info!("exiting process gracefully");
        tokio::time::sleep(Duration::from_millis(500)).await;
        std::process::exit(0);
    }
}
