//! Flush dispatcher — periodic durability worker.
//!
//! One background thread walks the registered segments on a fixed
//! interval: `writer.flush()` → `writer.sync()` → publish the new
//! reader version. `flush_now()` drains the same work synchronously;
//! an atomic flag keeps the periodic and synchronous paths from
//! overlapping. The worker stops when the dispatcher drops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};

use crate::storage::reader_cache::ReaderCache;
use crate::storage::writer::SegmentWriter;

struct FlushTask {
    writer: Weak<SegmentWriter>,
    path: PathBuf,
}

struct Shared {
    tasks: Mutex<HashMap<String, FlushTask>>,
    cache: Weak<ReaderCache>,
    busy: AtomicBool,
}

pub struct FlushDispatcher {
    shared: Arc<Shared>,
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushDispatcher {
    /// Start the worker with the given flush interval.
    pub fn start(cache: &Arc<ReaderCache>, interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            tasks: Mutex::new(HashMap::new()),
            cache: Arc::downgrade(cache),
            busy: AtomicBool::new(false),
        });

        let (tx, rx) = bounded::<()>(1);
        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("resonance-flush".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        run_once(&worker_shared);
                    }
                }
            })
            .expect("failed to spawn flush worker");

        Self {
            shared,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Register a segment for periodic flushing.
    pub fn register(&self, writer: &Arc<SegmentWriter>) {
        let mut tasks = self.shared.tasks.lock().unwrap();
        tasks.insert(
            writer.name().to_string(),
            FlushTask {
                writer: Arc::downgrade(writer),
                path: writer.path().to_path_buf(),
            },
        );
    }

    /// Stop flushing a segment (compaction retired it).
    pub fn unregister(&self, segment: &str) {
        self.shared.tasks.lock().unwrap().remove(segment);
    }

    /// Number of registered segments.
    pub fn task_count(&self) -> usize {
        self.shared.tasks.lock().unwrap().len()
    }

    /// Drain all tasks synchronously.
    pub fn flush_now(&self) {
        run_once(&self.shared);
    }
}

impl Drop for FlushDispatcher {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One pass over the registered segments. Guarded against re-entry so
/// a slow sync cannot stack passes.
fn run_once(shared: &Shared) {
    if shared
        .busy
        .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }

    let snapshot: Vec<(String, Weak<SegmentWriter>, PathBuf)> = {
        let tasks = shared.tasks.lock().unwrap();
        tasks
            .iter()
            .map(|(name, t)| (name.clone(), t.writer.clone(), t.path.clone()))
            .collect()
    };

    let cache = shared.cache.upgrade();
    let mut dead: Vec<String> = Vec::new();

    for (name, weak_writer, path) in snapshot {
        let Some(writer) = weak_writer.upgrade() else {
            dead.push(name);
            continue;
        };
        if let Err(e) = writer.flush().and_then(|_| writer.sync()) {
            tracing::warn!("flush of segment {} failed: {}", name, e);
            continue;
        }
        if let Some(cache) = &cache {
            if let Err(e) = cache.publish(&name, writer.version(), &path) {
                tracing::warn!("publishing reader for segment {} failed: {}", name, e);
            }
        }
    }

    if !dead.is_empty() {
        let mut tasks = shared.tasks.lock().unwrap();
        for name in dead {
            tasks.remove(&name);
        }
    }

    shared.busy.store(false, Ordering::Release);
}

// ── Tests ──────────────────────────────────────────────────────────
