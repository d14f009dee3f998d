//! Phase segment group — one phase range's rolling segment series.
//!
//! A group owns segments `base-0, base-1, …` (plus `base-merged-<ts>`
//! after compaction), ordered oldest to newest. The newest segment is
//! the writable one; it rolls when it outgrows the configured byte
//! budget. The group also tracks the running mean phase of its inserts
//! as routing feedback.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::pattern::{PhaseRange, WavePattern};
use crate::storage::header::ChecksumKind;
use crate::storage::writer::SegmentWriter;

// ── Compaction policy ──────────────────────────────────────────────

/// More writers than this make a group compaction-eligible.
const COMPACT_MIN_WRITERS: usize = 3;

/// Average fill ratio below which an eligible group compacts.
const COMPACT_FILL_THRESHOLD: f64 = 0.35;

/// Segment file extension.
pub const SEGMENT_EXT: &str = "segment";

// ── Name helpers ───────────────────────────────────────────────────

/// Split a segment name into its group base and roll index.
/// `phase-3-7` → `("phase-3", Some(7))`; merged segments
/// (`phase-3-merged-17123…`) and unindexed names report `None`.
pub fn split_segment_name(name: &str) -> (&str, Option<u32>) {
    if let Some(pos) = name.rfind("-merged-") {
        return (&name[..pos], None);
    }
    match name.rfind('-') {
        Some(pos) => match name[pos + 1..].parse::<u32>() {
            Ok(idx) => (&name[..pos], Some(idx)),
            Err(_) => (name, None),
        },
        None => (name, None),
    }
}

/// File path of a segment inside the segments directory.
pub fn segment_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, SEGMENT_EXT))
}

// ── PhaseSegmentGroup ──────────────────────────────────────────────

pub struct PhaseSegmentGroup {
    base: String,
    dir: PathBuf,
    range: PhaseRange,
    checksum_kind: ChecksumKind,
    max_bytes: u64,
    inner: Mutex<GroupInner>,
}

struct GroupInner {
    /// Oldest to newest; the last entry is the writable segment.
    writers: Vec<Arc<SegmentWriter>>,
    next_index: u32,
    phase_sum: f64,
    phase_count: u64,
}

impl PhaseSegmentGroup {
    /// Open a group over its existing segments (may be none — the first
    /// segment is created lazily on first write).
    pub fn open(
        dir: &Path,
        base: &str,
        range: PhaseRange,
        checksum_kind: ChecksumKind,
        max_bytes: u64,
        existing: &[String],
    ) -> Result<Self> {
        // Merged segments (compaction output) are older than any
        // indexed segment that came after the swap.
        let mut merged: Vec<&String> = existing
            .iter()
            .filter(|n| n.contains("-merged-"))
            .collect();
        merged.sort();
        let mut indexed: Vec<(u32, &String)> = existing
            .iter()
            .filter_map(|n| match split_segment_name(n) {
                (_, Some(idx)) => Some((idx, n)),
                _ => None,
            })
            .collect();
        indexed.sort();

        let mut writers = Vec::with_capacity(existing.len());
        for name in merged.into_iter() {
            writers.push(Arc::new(SegmentWriter::open(
                &segment_path(dir, name),
                checksum_kind,
            )?));
        }
        for (_, name) in &indexed {
            writers.push(Arc::new(SegmentWriter::open(
                &segment_path(dir, name),
                checksum_kind,
            )?));
        }
        let next_index = indexed.last().map(|(idx, _)| idx + 1).unwrap_or(0);

        Ok(Self {
            base: base.to_string(),
            dir: dir.to_path_buf(),
            range,
            checksum_kind,
            max_bytes,
            inner: Mutex::new(GroupInner {
                writers,
                next_index,
                phase_sum: 0.0,
                phase_count: 0,
            }),
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn range(&self) -> PhaseRange {
        self.range
    }

    /// The writable segment: the newest one while it fits the byte
    /// budget, otherwise a freshly rolled successor.
    pub fn get_writable(&self) -> Result<Arc<SegmentWriter>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(current) = inner.writers.last() {
            if current.approx_size() <= self.max_bytes {
                return Ok(Arc::clone(current));
            }
        }
        self.roll_locked(&mut inner)
    }

    /// Force-roll a new segment and make it current.
    pub fn create_and_register_new_segment(&self) -> Result<Arc<SegmentWriter>> {
        let mut inner = self.inner.lock().unwrap();
        self.roll_locked(&mut inner)
    }

    fn roll_locked(&self, inner: &mut GroupInner) -> Result<Arc<SegmentWriter>> {
        let name = format!("{}-{}", self.base, inner.next_index);
        inner.next_index += 1;
        let writer = Arc::new(SegmentWriter::open(
            &segment_path(&self.dir, &name),
            self.checksum_kind,
        )?);
        inner.writers.push(Arc::clone(&writer));
        Ok(writer)
    }

    /// Snapshot of the group's writers, oldest first.
    pub fn writers(&self) -> Vec<Arc<SegmentWriter>> {
        self.inner.lock().unwrap().writers.clone()
    }

    /// Writer by segment name, if this group owns it.
    pub fn writer_named(&self, name: &str) -> Option<Arc<SegmentWriter>> {
        self.inner
            .lock()
            .unwrap()
            .writers
            .iter()
            .find(|w| w.name() == name)
            .cloned()
    }

    pub fn writer_count(&self) -> usize {
        self.inner.lock().unwrap().writers.len()
    }

    /// Compaction trigger: more than `COMPACT_MIN_WRITERS` segments
    /// whose average fill ratio fell below `COMPACT_FILL_THRESHOLD`.
    pub fn should_compact(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.writers.len() <= COMPACT_MIN_WRITERS {
            return false;
        }
        let avg: f64 = inner
            .writers
            .iter()
            .map(|w| w.fill_ratio())
            .sum::<f64>()
            / inner.writers.len() as f64;
        avg < COMPACT_FILL_THRESHOLD
    }

    /// Swap the writer set for the compaction output. Returns the
    /// retired writers so the compactor can close and delete them.
    pub fn reset_to(&self, merged: Arc<SegmentWriter>) -> Vec<Arc<SegmentWriter>> {
        let mut inner = self.inner.lock().unwrap();
        let retired = std::mem::replace(&mut inner.writers, vec![merged]);
        retired
    }

    /// Fold an insert's mean phase into the group's running mean.
    pub fn record_phase(&self, pattern: &WavePattern) {
        let mut inner = self.inner.lock().unwrap();
        inner.phase_sum += pattern.mean_phase();
        inner.phase_count += 1;
    }

    /// Running mean phase of inserts; the range center before any
    /// insert has been seen.
    pub fn mean_phase(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        if inner.phase_count == 0 {
            return self.range.center();
        }
        inner.phase_sum / inner.phase_count as f64
    }

    /// Total bytes across the group's segments.
    pub fn approx_size(&self) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .writers
            .iter()
            .map(|w| w.approx_size())
            .sum()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
