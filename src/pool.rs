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

//! Worker pool and in-flight query registry.
//!
//! Engine calls are synchronous, so they run on a fixed pool of OS threads
//! fed from the async layer through a channel. Each submitted task owns its
//! cursor; the registry keeps only the thread-safe pieces needed to cancel a
//! query from outside — the interrupt handle and a cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Sender};
use duckdb::InterruptHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::cpu_count;
use crate::error::{GatewayError, Result};

/// Fresh opaque query identifier for commands that did not bring one.
pub fn generate_query_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Bounded-parallelism pool of named OS threads sharing one job queue.
///
/// The queue itself is unbounded; parallelism is bounded by the thread
/// count. `shutdown` closes the queue without joining the workers.
pub struct WorkerPool {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Pool sized to the CPU count, minimum 4.
    pub fn with_default_size() -> Result<WorkerPool> {
        WorkerPool::new(cpu_count().max(4))
    }

    pub fn new(size: usize) -> Result<WorkerPool> {
        let (tx, rx) = unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("mirador-db-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        info!(size, "started worker pool");
        Ok(WorkerPool {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn submit(&self, job: Job) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(job).map_err(|_| GatewayError::ShuttingDown),
            None => Err(GatewayError::ShuttingDown),
        }
    }

    /// Close the job queue. Idle workers exit as the channel drains; running
    /// jobs are not waited for.
    pub fn shutdown(&self) {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

// ---------------------------------------------------------------------------
// Query registry
// ---------------------------------------------------------------------------

/// Cancellation state of one in-flight query. The cursor itself lives on the
/// worker thread; only `Send + Sync` pieces are tracked here.
pub struct QueryRecord {
    interrupt: Arc<InterruptHandle>,
    cancel: CancellationToken,
    pub started_at: Instant,
}

/// In-flight queries by identifier, guarded by a single mutex held only for
/// map updates — never across engine calls.
#[derive(Default)]
pub struct QueryRegistry {
    records: Mutex<HashMap<String, QueryRecord>>,
}

impl QueryRegistry {
    pub fn new() -> QueryRegistry {
        QueryRegistry::default()
    }

    /// Track a query before its execution begins. A duplicate identifier
    /// replaces the previous record.
    pub fn register(
        &self,
        query_id: &str,
        interrupt: Arc<InterruptHandle>,
        cancel: CancellationToken,
    ) {
        let record = QueryRecord {
            interrupt,
            cancel,
            started_at: Instant::now(),
        };
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.insert(query_id.to_string(), record).is_some() {
            warn!(query_id, "replaced duplicate in-flight query id");
        }
    }

    /// Drop the record for a completed, failed or interrupted query.
    pub fn unregister(&self, query_id: &str) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(query_id);
    }

    pub fn contains(&self, query_id: &str) -> bool {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(query_id)
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interrupt the query with the given id. Returns whether the id was
    /// found; the interrupt itself is best-effort and asynchronous with the
    /// engine's reaction.
    pub fn cancel(&self, query_id: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get(query_id) {
            Some(record) => {
                debug!(
                    query_id,
                    running_ms = record.started_at.elapsed().as_millis() as u64,
                    "interrupting query"
                );
                record.interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    /// Interrupt every in-flight query, wake every awaiting caller and clear
    /// the registry. Used during reconnection and shutdown.
    pub fn cancel_all(&self) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for (query_id, record) in records.drain() {
            info!(query_id, "cancelling query");
            record.interrupt.interrupt();
            record.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_in_parallel() {
        let pool = WorkerPool::new(4).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        for _ in 0..4 {
            let done = done.clone();
            pool.submit(Box::new(move || {
                thread::sleep(Duration::from_millis(200));
                done.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        while done.load(Ordering::SeqCst) < 4 {
            thread::sleep(Duration::from_millis(10));
        }
        // Four 200 ms jobs on four workers: parallel, not sequential.
        assert!(
            start.elapsed() < Duration::from_millis(700),
            "jobs did not overlap: {:?}",
            start.elapsed()
        );
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(matches!(err, GatewayError::ShuttingDown));
    }

    #[test]
    fn registry_tracks_and_cancels() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let registry = QueryRegistry::new();
        assert!(!registry.cancel("missing"));

        registry.register("q1", conn.interrupt_handle(), CancellationToken::new());
        assert!(registry.contains("q1"));
        assert!(registry.cancel("q1"));
        // Cancellation does not unregister; completion does.
        assert!(registry.contains("q1"));
        registry.unregister("q1");
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_fires_tokens_and_clears() {
        let conn = duckdb::Connection::open_in_memory().unwrap();
        let registry = QueryRegistry::new();
        let token = CancellationToken::new();
        registry.register("q1", conn.interrupt_handle(), token.clone());
        registry.register("q2", conn.interrupt_handle(), CancellationToken::new());

        registry.cancel_all();
        assert!(token.is_cancelled());
        assert!(registry.is_empty());
    }
}
