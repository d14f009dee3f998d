//! Versioned cache of open segment readers.
//!
//! Readers are keyed by `(segment_name, last_offset)` — the version a
//! writer publishes after each successful flush. A publish replaces the
//! previous version's reader, so queries that start after a flush see
//! the new data while in-flight scans keep their `Arc` to the old view
//! until they finish (the old mapping unmaps when the last reference
//! drops).
//!
//! The cache is weight-bounded by the mapped file sizes; least-recently
//! used readers are evicted and closed when the budget is exceeded.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::storage::reader::SegmentReader;

// ── ReaderCache ────────────────────────────────────────────────────

pub struct ReaderCache {
    max_bytes: u64,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
    tick: u64,
}

struct CacheEntry {
    version: u64,
    reader: Arc<SegmentReader>,
    weight: u64,
    last_used: u64,
}

impl ReaderCache {
    /// Cache bounded to roughly `max_bytes` of mapped segment data.
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                total_bytes: 0,
                tick: 0,
            }),
        }
    }

    /// Reader for the currently published version of `segment`, if any.
    pub fn get(&self, segment: &str) -> Option<Arc<SegmentReader>> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        let entry = inner.entries.get_mut(segment)?;
        entry.last_used = tick;
        Some(Arc::clone(&entry.reader))
    }

    /// Publish `version` for `segment`, opening a fresh reader over
    /// `path`. The previous version's reader is dropped from the cache;
    /// an identical version is a no-op touch.
    pub fn publish(&self, segment: &str, version: u64, path: &Path) -> Result<Arc<SegmentReader>> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.tick += 1;
            let tick = inner.tick;
            if let Some(entry) = inner.entries.get_mut(segment) {
                if entry.version == version {
                    entry.last_used = tick;
                    return Ok(Arc::clone(&entry.reader));
                }
            }
        }

        // Open outside the lock; mmap setup can fault.
        let reader = Arc::new(SegmentReader::open(path)?);
        let weight = reader.file_size();

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(old) = inner.entries.remove(segment) {
            inner.total_bytes -= old.weight;
        }
        inner.entries.insert(
            segment.to_string(),
            CacheEntry {
                version,
                reader: Arc::clone(&reader),
                weight,
                last_used: tick,
            },
        );
        inner.total_bytes += weight;
        evict_over_budget(&mut inner, self.max_bytes, segment);
        Ok(reader)
    }

    /// Cached reader for `segment`, opening and publishing the file's
    /// current committed state on a miss.
    pub fn get_or_open(&self, segment: &str, path: &Path) -> Result<Arc<SegmentReader>> {
        if let Some(reader) = self.get(segment) {
            return Ok(reader);
        }
        let reader = Arc::new(SegmentReader::open(path)?);
        let weight = reader.file_size();
        let version = reader.last_offset();

        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        // Lost a race: another thread published meanwhile.
        if let Some(entry) = inner.entries.get_mut(segment) {
            entry.last_used = tick;
            return Ok(Arc::clone(&entry.reader));
        }
        inner.entries.insert(
            segment.to_string(),
            CacheEntry {
                version,
                reader: Arc::clone(&reader),
                weight,
                last_used: tick,
            },
        );
        inner.total_bytes += weight;
        evict_over_budget(&mut inner, self.max_bytes, segment);
        Ok(reader)
    }

    /// Drop a segment's reader (compaction removed the file).
    pub fn invalidate(&self, segment: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.entries.remove(segment) {
            inner.total_bytes -= old.weight;
        }
    }

    /// Published version for `segment`, if cached.
    pub fn version(&self, segment: &str) -> Option<u64> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(segment)
            .map(|e| e.version)
    }

    /// Number of cached readers.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of cached reader weights.
    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().unwrap().total_bytes
    }
}

/// Evict least-recently-used entries until the weight fits the budget.
/// The just-touched `keep` entry survives even when it alone exceeds
/// the budget — a query needs at least its own reader.
fn evict_over_budget(inner: &mut CacheInner, max_bytes: u64, keep: &str) {
    while inner.total_bytes > max_bytes && inner.entries.len() > 1 {
        let victim = inner
            .entries
            .iter()
            .filter(|(name, _)| name.as_str() != keep)
            .min_by_key(|(_, e)| e.last_used)
            .map(|(name, _)| name.clone());
        match victim {
            Some(name) => {
                if let Some(old) = inner.entries.remove(&name) {
                    inner.total_bytes -= old.weight;
                    tracing::debug!("reader cache evicted segment {}", name);
                }
            }
            None => break,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
