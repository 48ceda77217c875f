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

//! Content-addressed result cache.
//!
//! Keys are a fingerprint of the SQL text plus a logical output scope, so two
//! commands with identical SQL and the same type always hit the same entry.
//! Backings are pluggable: an in-memory map or a directory of files.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::Result;

/// Deterministic cache key: `hex(sha256(sql)) + "." + scope`.
///
/// The scope is the logical command type (`arrow`, `json`, `tile-mvt`), which
/// keeps differently-shaped results of the same SQL apart.
pub fn cache_key(sql: &str, scope: &str) -> String {
    format!("{}.{}", hex::encode(Sha256::digest(sql.as_bytes())), scope)
}

/// A thread-safe key/value store for query artifacts.
///
/// Entries are never mutated in place; `put` replaces the whole value. The
/// cache is not authoritative — a miss is always recomputable.
pub trait ResultCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]);
    fn clear(&self);
}

/// Return the cached value for `key`, or compute it with `produce` and store
/// it only when `persist` is true.
///
/// Presence is checked explicitly: an empty payload is a valid cached value,
/// not a miss.
pub fn retrieve<F>(cache: &dyn ResultCache, key: &str, persist: bool, produce: F) -> Result<Vec<u8>>
where
    F: FnOnce() -> Result<Vec<u8>>,
{
    if let Some(value) = cache.get(key) {
        debug!(key, "cache hit");
        return Ok(value);
    }
    let value = produce()?;
    if persist {
        cache.put(key, &value);
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// In-memory backing
// ---------------------------------------------------------------------------

/// Mutex-guarded map. Suits tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, value: &[u8]) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_vec());
        }
    }

    fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

// ---------------------------------------------------------------------------
// On-disk backing
// ---------------------------------------------------------------------------

/// One file per key under a root directory.
///
/// Writes go through a temp file and a rename so readers never observe a
/// partial value. Keys are filesystem-safe by construction (hex digest plus a
/// short ASCII scope).
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(DiskCache { root })
    }

    pub fn directory(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl ResultCache for DiskCache {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        fs::read(self.entry_path(key)).ok()
    }

    fn put(&self, key: &str, value: &[u8]) {
        let path = self.entry_path(key);
        let tmp = self.root.join(format!(".{key}.tmp"));
        let result = fs::write(&tmp, value).and_then(|()| fs::rename(&tmp, &path));
        if let Err(e) = result {
            warn!(key, error = %e, "failed to persist cache entry");
            fs::remove_file(&tmp).ok();
        }
    }

    fn clear(&self) {
        let Ok(dir) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in dir.flatten() {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(path = %entry.path().display(), error = %e, "failed to remove cache entry");
            }
        }
    }
}
