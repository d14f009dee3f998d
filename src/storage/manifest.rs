//! Pattern manifest — the id → location index.
//!
//! In memory: a map from 32-char hex IDs to `{segment, offset,
//! phase_center}` plus the set of known segment names (including
//! currently empty shards). On disk: a little-endian binary file
//!
//! ```text
//! [u32 n_seg][string × n_seg]
//! [u32 n_ids][string id, string seg, u64 offset, f64 phase_center] × n_ids
//! ```
//!
//! where `string` is a u16 length prefix + UTF-8 bytes. Persistence is
//! atomic: serialize to `manifest.idx.tmp`, copy the previous file to
//! `manifest.idx.bak` (best effort), then rename. Loading falls back to
//! the `.bak` copy when the primary is unreadable, and tolerates legacy
//! files whose entries lack the trailing `phase_center` (defaulting it
//! to 0.0).

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Result, StoreError};

// ── Location ───────────────────────────────────────────────────────

/// Where a live record lives.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub segment: String,
    pub offset: u64,
    pub phase_center: f64,
}

// ── Manifest ───────────────────────────────────────────────────────

pub struct Manifest {
    path: PathBuf,
    inner: RwLock<ManifestInner>,
}

struct ManifestInner {
    entries: HashMap<String, Location>,
    segments: BTreeSet<String>,
}

impl Manifest {
    /// Load the manifest at `path`, falling back to `<path>.bak`, then
    /// to an empty manifest when neither exists.
    pub fn load(path: &Path) -> Result<Self> {
        let inner = match read_manifest_file(path) {
            Ok(inner) => inner,
            Err(primary_err) => {
                let bak = bak_path(path);
                if bak.exists() {
                    tracing::warn!(
                        "manifest {} unreadable ({}), falling back to backup",
                        path.display(),
                        primary_err
                    );
                    read_manifest_file(&bak)?
                } else if path.exists() {
                    return Err(primary_err);
                } else {
                    ManifestInner {
                        entries: HashMap::new(),
                        segments: BTreeSet::new(),
                    }
                }
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        })
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Location> {
        self.inner.read().unwrap().entries.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().unwrap().entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All known segment names, sorted.
    pub fn known_segments(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .segments
            .iter()
            .cloned()
            .collect()
    }

    /// Snapshot of every entry (for router bootstrap and compaction).
    pub fn locations(&self) -> Vec<(String, Location)> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .map(|(id, loc)| (id.clone(), loc.clone()))
            .collect()
    }

    /// IDs currently mapped into `segment`.
    pub fn ids_in_segment(&self, segment: &str) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|(_, loc)| loc.segment == segment)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert an entry and mark its segment known.
    pub fn add(&self, id: &str, segment: &str, offset: u64, phase_center: f64) {
        let mut inner = self.inner.write().unwrap();
        inner.segments.insert(segment.to_string());
        inner.entries.insert(
            id.to_string(),
            Location {
                segment: segment.to_string(),
                offset,
                phase_center,
            },
        );
    }

    /// Insert an entry only when the id is absent. The check and the
    /// insert happen under one write lock, so of two racing inserts of
    /// the same content exactly one wins.
    pub fn try_add(&self, id: &str, segment: &str, offset: u64, phase_center: f64) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.contains_key(id) {
            return Err(StoreError::DuplicatePattern(id.to_string()));
        }
        inner.segments.insert(segment.to_string());
        inner.entries.insert(
            id.to_string(),
            Location {
                segment: segment.to_string(),
                offset,
                phase_center,
            },
        );
        Ok(())
    }

    /// Mark a segment known without any entries (empty shards survive
    /// restarts this way).
    pub fn register_segment(&self, segment: &str) {
        self.inner
            .write()
            .unwrap()
            .segments
            .insert(segment.to_string());
    }

    /// Forget a segment name (after compaction deleted the file).
    pub fn forget_segment(&self, segment: &str) {
        self.inner.write().unwrap().segments.remove(segment);
    }

    /// Remove an entry.
    pub fn remove(&self, id: &str) -> Result<Location> {
        self.inner
            .write()
            .unwrap()
            .entries
            .remove(id)
            .ok_or_else(|| StoreError::PatternNotFound(id.to_string()))
    }

    /// CAS relocation: move `id` from `(old_segment, old_offset)` to a
    /// new location, failing untouched when the entry has moved.
    pub fn relocate(
        &self,
        id: &str,
        old_segment: &str,
        old_offset: u64,
        new_segment: &str,
        new_offset: u64,
        phase_center: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let current = inner
            .entries
            .get(id)
            .ok_or_else(|| StoreError::PatternNotFound(id.to_string()))?;
        if current.segment != old_segment || current.offset != old_offset {
            return Err(StoreError::PatternNotFound(format!(
                "{} moved from {}@{}",
                id, old_segment, old_offset
            )));
        }
        inner.segments.insert(new_segment.to_string());
        inner.entries.insert(
            id.to_string(),
            Location {
                segment: new_segment.to_string(),
                offset: new_offset,
                phase_center,
            },
        );
        Ok(())
    }

    /// Atomically retire `old_id` and bind `new_id` to a fresh location
    /// (the replace path: tombstone + re-insert under one lock).
    pub fn replace_id(
        &self,
        old_id: &str,
        new_id: &str,
        segment: &str,
        offset: u64,
        phase_center: f64,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.entries.contains_key(old_id) {
            return Err(StoreError::PatternNotFound(old_id.to_string()));
        }
        if old_id != new_id && inner.entries.contains_key(new_id) {
            return Err(StoreError::DuplicatePattern(new_id.to_string()));
        }
        inner.entries.remove(old_id);
        inner.segments.insert(segment.to_string());
        inner.entries.insert(
            new_id.to_string(),
            Location {
                segment: segment.to_string(),
                offset,
                phase_center,
            },
        );
        Ok(())
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Serialize under the read lock and atomically replace the on-disk
    /// file: `.tmp` + fsync, best-effort `.bak`, rename.
    pub fn flush(&self) -> Result<()> {
        let bytes = {
            let inner = self.inner.read().unwrap();
            serialize_manifest(&inner)
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("idx.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if self.path.exists() {
            let _ = std::fs::copy(&self.path, bak_path(&self.path));
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn bak_path(path: &Path) -> PathBuf {
    path.with_extension("idx.bak")
}

// ── Binary format ──────────────────────────────────────────────────

fn serialize_manifest(inner: &ManifestInner) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(inner.segments.len() as u32).to_le_bytes());
    for name in &inner.segments {
        write_string(&mut out, name);
    }
    out.extend_from_slice(&(inner.entries.len() as u32).to_le_bytes());
    // Sorted for deterministic files.
    let mut ids: Vec<&String> = inner.entries.keys().collect();
    ids.sort();
    for id in ids {
        let loc = &inner.entries[id];
        write_string(&mut out, id);
        write_string(&mut out, &loc.segment);
        out.extend_from_slice(&loc.offset.to_le_bytes());
        out.extend_from_slice(&loc.phase_center.to_le_bytes());
    }
    out
}

fn read_manifest_file(path: &Path) -> Result<ManifestInner> {
    let bytes = std::fs::read(path)?;
    parse_manifest(&bytes, true).or_else(|_| parse_manifest(&bytes, false))
}

fn parse_manifest(bytes: &[u8], with_phase: bool) -> Result<ManifestInner> {
    let mut cursor = Cursor {
        bytes,
        position: 0,
    };

    let n_seg = cursor.read_u32()?;
    let mut segments = BTreeSet::new();
    for _ in 0..n_seg {
        segments.insert(cursor.read_string()?);
    }

    let n_ids = cursor.read_u32()?;
    // Cap the preallocation; a corrupt count fails on the first short
    // read instead of reserving gigabytes.
    let mut entries = HashMap::with_capacity((n_ids as usize).min(1 << 20));
    for _ in 0..n_ids {
        let id = cursor.read_string()?;
        let segment = cursor.read_string()?;
        let offset = cursor.read_u64()?;
        let phase_center = if with_phase {
            // Tolerate a final entry cut short before its phase field.
            match cursor.read_f64() {
                Ok(v) => v,
                Err(_) if cursor.at_end() => 0.0,
                Err(e) => return Err(e),
            }
        } else {
            0.0
        };
        segments.insert(segment.clone());
        entries.insert(
            id,
            Location {
                segment,
                offset,
                phase_center,
            },
        );
    }
    if !cursor.at_end() {
        return Err(StoreError::IncompleteWrite(
            "trailing bytes in manifest".into(),
        ));
    }
    Ok(ManifestInner { entries, segments })
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize, "manifest string too long");
    out.extend_from_slice(&(s.len() as u16).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.position + n > self.bytes.len() {
            return Err(StoreError::IncompleteWrite(format!(
                "manifest truncated at byte {}",
                self.position
            )));
        }
        let slice = &self.bytes[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = u16::from_le_bytes(self.take(2)?.try_into().unwrap()) as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| {
            StoreError::IncompleteWrite("invalid UTF-8 in manifest string".into())
        })
    }

    fn at_end(&self) -> bool {
        self.position >= self.bytes.len()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
