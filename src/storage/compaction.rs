//! Group compaction — rewrite live records into one segment.
//!
//! Runs under the store's global write lock, so no insert, delete, or
//! competing compaction can touch the group meanwhile. The merge
//! streams live records from the group's segments (oldest first),
//! re-checks each against the manifest, appends survivors to a fresh
//! `base-merged-<timestamp>` segment, and CAS-relocates their manifest
//! entries. Queries keep their old readers until the swap publishes the
//! merged reader; afterwards the retired files are closed and deleted.

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::flush::FlushDispatcher;
use crate::storage::group::{segment_path, PhaseSegmentGroup};
use crate::storage::header::{now_ms, ChecksumKind};
use crate::storage::manifest::Manifest;
use crate::storage::reader::SegmentReader;
use crate::storage::reader_cache::ReaderCache;
use crate::storage::writer::SegmentWriter;

/// Outcome of one group compaction.
#[derive(Debug, Clone)]
pub struct CompactionResult {
    pub merged_segment: String,
    pub records_moved: usize,
    pub segments_removed: Vec<String>,
}

/// Compact one group when its trigger fires. Returns `None` when the
/// group does not qualify (too few writers or healthy fill).
pub fn maybe_compact_group(
    group: &PhaseSegmentGroup,
    manifest: &Manifest,
    cache: &ReaderCache,
    dispatcher: &FlushDispatcher,
    dir: &Path,
    checksum_kind: ChecksumKind,
) -> Result<Option<CompactionResult>> {
    if !group.should_compact() {
        return Ok(None);
    }
    compact_group(group, manifest, cache, dispatcher, dir, checksum_kind).map(Some)
}

/// Unconditionally merge a group's segments. Callers hold the store's
/// write lock.
pub fn compact_group(
    group: &PhaseSegmentGroup,
    manifest: &Manifest,
    cache: &ReaderCache,
    dispatcher: &FlushDispatcher,
    dir: &Path,
    checksum_kind: ChecksumKind,
) -> Result<CompactionResult> {
    let old_writers = group.writers();

    let merged_name = format!("{}-merged-{}", group.base(), now_ms());
    let merged_path = segment_path(dir, &merged_name);
    let merged = Arc::new(SegmentWriter::open(&merged_path, checksum_kind)?);

    // Stream live records, oldest segment first, re-checking each
    // against the manifest so anything that moved or died mid-flight
    // is skipped.
    let mut records_moved = 0usize;
    for old in &old_writers {
        old.flush()?;
        let reader = SegmentReader::open(old.path())?;
        for record in reader.read_all_with_id()? {
            let Some(loc) = manifest.get(&record.id) else {
                continue;
            };
            if loc.segment != old.name() || loc.offset != record.offset {
                continue;
            }
            let new_offset = merged.write(&record.id, &record.pattern)?;
            if let Err(e) = manifest.relocate(
                &record.id,
                old.name(),
                record.offset,
                &merged_name,
                new_offset,
                loc.phase_center,
            ) {
                // Entry moved between the check and the swap; undo the
                // copy so the merged segment holds no orphan.
                tracing::warn!("compaction relocate of {} lost a race: {}", record.id, e);
                merged.mark_deleted(new_offset)?;
                continue;
            }
            records_moved += 1;
        }
    }

    merged.flush()?;
    merged.sync()?;
    manifest.register_segment(&merged_name);

    // Swap: from here queries resolve through the merged segment.
    let retired = group.reset_to(Arc::clone(&merged));
    dispatcher.register(&merged);
    cache.publish(&merged_name, merged.version(), &merged_path)?;

    let mut segments_removed = Vec::with_capacity(retired.len());
    for old in retired {
        let name = old.name().to_string();
        let path = old.path().to_path_buf();
        dispatcher.unregister(&name);
        cache.invalidate(&name);
        manifest.forget_segment(&name);
        old.close()?;
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("could not delete retired segment {}: {}", name, e);
        }
        segments_removed.push(name);
    }

    manifest.flush()?;

    tracing::debug!(
        "compacted group {}: {} records into {}, removed {} segments",
        group.base(),
        records_moved,
        merged_name,
        segments_removed.len()
    );

    Ok(CompactionResult {
        merged_segment: merged_name,
        records_moved,
        segments_removed,
    })
}

// ── Tests ──────────────────────────────────────────────────────────
