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

//! The gateway core: one shared state object bridging the async request
//! layer to the worker pool, with cancellation tracking and cache
//! integration.
//!
//! The engine session lives behind an async mutex held only for cursor
//! acquisition and lifecycle transitions — never across an engine call. Each
//! dispatched command runs as exactly one pool job owning its cursor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{self, cache_key, ResultCache};
use crate::command::{Command, CommandInterceptor, QueryOutcome};
use crate::engine::{Cursor, Session, SessionConfig};
use crate::error::{GatewayError, Result};
use crate::lifecycle;
use crate::pool::{QueryRegistry, WorkerPool};
use crate::query;

/// Process-wide gateway state. One instance exists for the lifetime of the
/// process, shared by every route handler.
pub struct Gateway {
    pub(crate) session: Mutex<Option<Session>>,
    pub(crate) config: StdMutex<SessionConfig>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) pool: WorkerPool,
    pub(crate) registry: QueryRegistry,
    pub(crate) cache: Arc<dyn ResultCache>,
    interceptor: Option<Arc<dyn CommandInterceptor>>,
}

impl Gateway {
    /// Open the gateway against the configured database, applying startup
    /// recovery (stale WAL quarantine, corrupt-file fallback).
    pub fn open(config: SessionConfig, cache: Arc<dyn ResultCache>) -> Result<Gateway> {
        let session = lifecycle::open_session_with_recovery(&config)?;
        Ok(Gateway {
            session: Mutex::new(Some(session)),
            config: StdMutex::new(config),
            shutdown: AtomicBool::new(false),
            pool: WorkerPool::with_default_size()?,
            registry: QueryRegistry::new(),
            cache,
            interceptor: None,
        })
    }

    /// Install a command interceptor. Intercepted commands never reach the
    /// built-in dispatcher.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Gateway {
        self.interceptor = Some(interceptor);
        self
    }

    pub fn cache(&self) -> &dyn ResultCache {
        self.cache.as_ref()
    }

    pub fn registry(&self) -> &QueryRegistry {
        &self.registry
    }

    /// Path of the database the gateway is currently configured for.
    pub fn database_path(&self) -> std::path::PathBuf {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .path
            .clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Interrupt the in-flight query with the given id. True when found.
    pub fn cancel_query(&self, query_id: &str) -> bool {
        self.registry.cancel(query_id)
    }

    // -----------------------------------------------------------------------
    // Worker execution
    // -----------------------------------------------------------------------

    /// Run synchronous engine work on the pool with cancellation tracking.
    ///
    /// A fresh cursor is acquired under the session mutex, moved into the
    /// job, and closed on every exit path. The registry holds the cursor's
    /// interrupt handle for the duration; dropping the returned future (or a
    /// fired cancellation token) interrupts the engine and surfaces
    /// `Cancelled`.
    pub async fn run_db_task<T, F>(&self, query_id: &str, execute: F) -> Result<T>
    where
        F: FnOnce(&Cursor) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let cursor = {
            let session = self.session.lock().await;
            let session = session.as_ref().ok_or(GatewayError::NoEngine)?;
            session.cursor()?
        };
        let interrupt = cursor.interrupt_handle();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = oneshot::channel();

        self.pool.submit(Box::new(move || {
            let result = execute(&cursor);
            drop(cursor);
            let _ = done_tx.send(result);
        }))?;
        self.registry.register(query_id, interrupt, cancel.clone());

        let mut guard = QueryGuard {
            registry: &self.registry,
            query_id,
            completed: false,
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
            done = done_rx => match done {
                Ok(result) => {
                    guard.completed = true;
                    result
                }
                // The worker vanished (pool torn down mid-flight).
                Err(_) => Err(GatewayError::Cancelled),
            },
        };
        drop(guard);
        result
    }

    // -----------------------------------------------------------------------
    // Command dispatch
    // -----------------------------------------------------------------------

    /// Route one command. `query_id` is the effective identifier the caller
    /// either provided or generated.
    pub async fn dispatch(&self, command: Command, query_id: &str) -> Result<QueryOutcome> {
        if self.is_shutting_down() {
            warn!(query_id, "rejecting command: shutdown has been requested");
            return Err(GatewayError::ShuttingDown);
        }

        let start = Instant::now();
        info!(command = command.kind(), query_id, "processing command");
        if let Some(sql) = command.sql() {
            if sql.chars().count() > 200 {
                let preview: String = sql.chars().take(200).collect();
                debug!(query_id, sql = %preview, "sql (truncated)");
            } else {
                debug!(query_id, sql, "sql");
            }
        }

        if let Some(interceptor) = &self.interceptor {
            if let Some(result) = interceptor.intercept(&command, query_id).await {
                return result;
            }
        }

        let result = match command {
            Command::Exec { sql, .. } => {
                self.run_db_task(query_id, move |cursor| {
                    cursor.execute_batch(&sql)?;
                    Ok(QueryOutcome::Done)
                })
                .await
            }
            Command::Arrow { sql, persist, .. } => {
                let cache = Arc::clone(&self.cache);
                self.run_db_task(query_id, move |cursor| {
                    let key = cache_key(&sql, "arrow");
                    let bytes = cache::retrieve(cache.as_ref(), &key, persist, || {
                        query::get_arrow_ipc(cursor, &sql)
                    })?;
                    Ok(QueryOutcome::Arrow(bytes))
                })
                .await
            }
            Command::Json { sql, persist, .. } => {
                let cache = Arc::clone(&self.cache);
                self.run_db_task(query_id, move |cursor| {
                    let key = cache_key(&sql, "json");
                    let bytes = cache::retrieve(cache.as_ref(), &key, persist, || {
                        query::get_json(cursor, &sql).map(String::into_bytes)
                    })?;
                    let text = String::from_utf8(bytes)
                        .map_err(|e| GatewayError::Engine(e.to_string()))?;
                    Ok(QueryOutcome::Json(text))
                })
                .await
            }
            Command::InsertArrowFile {
                file_name,
                table_name,
                ..
            } => {
                self.run_db_task(query_id, move |cursor| {
                    query::insert_arrow_file(cursor, &file_name, &table_name)?;
                    Ok(QueryOutcome::Done)
                })
                .await
            }
            // Mutates the global session; never enters the worker pool.
            Command::SaveProjectAs {
                source_path,
                target_path,
                ..
            } => self
                .save_project_as(&source_path, &target_path)
                .await
                .map(|()| QueryOutcome::Done),
        };

        let elapsed = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(query_id, elapsed_ms = elapsed, "command done"),
            Err(e) => info!(query_id, elapsed_ms = elapsed, error = %e, "command failed"),
        }
        result
    }
}

/// Unregisters the query on scope exit; interrupts it first when the task is
/// leaving without a completed result (external cancellation, dropped
/// future).
struct QueryGuard<'a> {
    registry: &'a QueryRegistry,
    query_id: &'a str,
    completed: bool,
}

impl Drop for QueryGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.registry.cancel(self.query_id);
        }
        self.registry.unregister(self.query_id);
    }
}
