//! Mutable segment writer.
//!
//! A segment is a single file: a fixed header followed by append-only
//! records. The writer keeps the file mapped read/write, grows it by
//! doubling the mapping, and rewrites the header in place after every
//! mutation so a crash at any instant leaves either the previous
//! committed state or the new one — torn states are detected on reopen
//! by the checksum + commit flag.
//!
//! Write path per record:
//! 1. frame the record at `last_offset`
//! 2. advance `last_offset` / `record_count`
//! 3. recompute the payload checksum
//! 4. rewrite the header with `commit_flag = 1`
//! 5. force the header page to disk

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use memmap2::MmapMut;

use crate::codec;
use crate::error::{Result, StoreError};
use crate::pattern::{parse_id_hex, WavePattern, MAX_PATTERN_LEN, MIN_PATTERN_LEN};
use crate::storage::header::{now_ms, BinaryHeader, ChecksumKind};
use crate::storage::layout::{
    read_u32_at, record_size, FLAG_LIVE, FLAG_TOMBSTONE, RECORD_HEADER_SIZE,
    RECORD_LENGTH_OFFSET, RECORD_RESERVED,
};

// ── Constants ──────────────────────────────────────────────────────

/// Initial file capacity for a fresh segment.
const INITIAL_CAPACITY: u64 = 64 * 1024;

/// Hard ceiling on segment size; growth beyond this is refused.
pub const SEGMENT_HARD_MAX: u64 = 1024 * 1024 * 1024;

// ── SegmentWriter ──────────────────────────────────────────────────

/// Read/write mmap over one segment file. Mutations are serialized
/// through the internal write lock; cheap state reads (name, fill,
/// offsets) take the read lock.
pub struct SegmentWriter {
    name: String,
    path: PathBuf,
    state: RwLock<WriterState>,
}

struct WriterState {
    file: Option<File>,
    mmap: Option<MmapMut>,
    capacity: u64,
    header: BinaryHeader,
    live_bytes: u64,
}

impl WriterState {
    fn mmap(&self) -> Result<&MmapMut> {
        self.mmap
            .as_ref()
            .ok_or_else(|| closed_error())
    }

    fn mmap_mut(&mut self) -> Result<&mut MmapMut> {
        self.mmap
            .as_mut()
            .ok_or_else(|| closed_error())
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(|| closed_error())
    }

    /// Recompute the payload checksum, rewrite the header in place, and
    /// force the header range to disk.
    fn commit_header(&mut self) -> Result<()> {
        let header_size = self.header.header_size();
        let last = self.header.last_offset as usize;
        self.header.timestamp_ms = now_ms();
        self.header.commit_flag = 1;

        let mmap = self.mmap.as_mut().ok_or_else(closed_error)?;
        self.header.checksum = self.header.checksum_kind.compute(&mmap[header_size..last]);
        self.header.write_into(&mut mmap[..header_size]);
        mmap.flush_range(0, header_size)?;
        Ok(())
    }
}

fn closed_error() -> StoreError {
    StoreError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "segment writer is closed",
    ))
}

impl SegmentWriter {
    /// Open a segment for writing, creating it when absent.
    ///
    /// Reopening an existing segment tolerates `commit_flag = 0` (the
    /// next flush repairs it) but requires a header whose checksum
    /// validates at some width — a torn header leaves no trustworthy
    /// record boundary.
    pub fn open(path: &Path, checksum_kind: ChecksumKind) -> Result<Self> {
        let name = segment_name(path);
        let exists = path.exists() && std::fs::metadata(path)?.len() > 0;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        if exists {
            Self::open_existing(file, name, path.to_path_buf())
        } else {
            Self::create_fresh(file, name, path.to_path_buf(), checksum_kind)
        }
    }

    fn create_fresh(
        file: File,
        name: String,
        path: PathBuf,
        checksum_kind: ChecksumKind,
    ) -> Result<Self> {
        file.set_len(INITIAL_CAPACITY)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };

        let header = BinaryHeader::new(checksum_kind);
        let header_size = header.header_size();
        header.write_into(&mut mmap[..header_size]);
        mmap.flush_range(0, header_size)?;

        Ok(Self {
            name,
            path,
            state: RwLock::new(WriterState {
                file: Some(file),
                mmap: Some(mmap),
                capacity: INITIAL_CAPACITY,
                header,
                live_bytes: 0,
            }),
        })
    }

    fn open_existing(file: File, name: String, path: PathBuf) -> Result<Self> {
        let capacity = file.metadata()?.len();
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let header = BinaryHeader::infer_from_file(&mmap)?;
        let live_bytes = scan_live_bytes(&mmap, &header)?;

        Ok(Self {
            name,
            path,
            state: RwLock::new(WriterState {
                file: Some(file),
                mmap: Some(mmap),
                capacity,
                header,
                live_bytes,
            }),
        })
    }

    /// Segment name (file stem).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Append / tombstone ─────────────────────────────────────────

    /// Append a pattern record. Returns the record's start offset.
    pub fn write(&self, id_hex: &str, pattern: &WavePattern) -> Result<u64> {
        let id = parse_id_hex(id_hex)?;
        let len = pattern.len();
        let rsize = record_size(len);

        let mut st = self.state.write().unwrap();
        let offset = st.header.last_offset;
        let required = offset + rsize as u64;
        if required > SEGMENT_HARD_MAX {
            return Err(StoreError::SegmentOverflow(format!(
                "segment {} would grow to {} bytes (cap {})",
                self.name, required, SEGMENT_HARD_MAX
            )));
        }
        if required > st.capacity {
            grow(&mut st, required)?;
        }

        let off = offset as usize;
        let mmap = st.mmap_mut()?;
        let buf = &mut mmap[off..off + rsize];
        buf[0] = FLAG_LIVE;
        buf[1..17].copy_from_slice(&id);
        buf[17..21].copy_from_slice(&(len as u32).to_le_bytes());
        buf[21..25].copy_from_slice(&RECORD_RESERVED.to_le_bytes());
        codec::encode_samples_into(pattern, &mut buf[25..25 + 16 * len]);
        for b in &mut buf[25 + 16 * len..] {
            *b = 0;
        }

        st.header.last_offset = required;
        st.header.record_count += 1;
        st.live_bytes += rsize as u64;
        st.commit_header()?;

        Ok(offset)
    }

    /// Tombstone the record at `offset` — a single-byte flag flip that
    /// preserves framing, followed by a header commit so the stored
    /// checksum keeps matching the payload.
    pub fn mark_deleted(&self, offset: u64) -> Result<()> {
        self.set_flag(offset, FLAG_TOMBSTONE)
    }

    /// Revert a tombstone (rollback path).
    pub fn unmark_deleted(&self, offset: u64) -> Result<()> {
        self.set_flag(offset, FLAG_LIVE)
    }

    fn set_flag(&self, offset: u64, flag: u8) -> Result<()> {
        let mut st = self.state.write().unwrap();
        let header_size = st.header.header_size() as u64;
        if offset < header_size || offset + RECORD_HEADER_SIZE as u64 > st.header.last_offset {
            return Err(StoreError::PatternNotFound(format!(
                "no record at offset {} in segment {}",
                offset, self.name
            )));
        }

        let off = offset as usize;
        let len = {
            let mmap = st.mmap()?;
            read_u32_at(mmap, off + RECORD_LENGTH_OFFSET) as usize
        };
        if !(MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&len) {
            return Err(StoreError::IncompleteWrite(format!(
                "corrupt record framing at offset {} in segment {}",
                offset, self.name
            )));
        }
        let rsize = record_size(len) as u64;

        let mmap = st.mmap_mut()?;
        let previous = mmap[off];
        mmap[off] = flag;
        match (previous, flag) {
            (FLAG_LIVE, FLAG_TOMBSTONE) => st.live_bytes -= rsize,
            (FLAG_TOMBSTONE, FLAG_LIVE) => st.live_bytes += rsize,
            _ => {}
        }
        st.commit_header()
    }

    // ── Durability ─────────────────────────────────────────────────

    /// Recompute the checksum, rewrite the header, force the header
    /// page.
    pub fn flush(&self) -> Result<()> {
        let mut st = self.state.write().unwrap();
        st.commit_header()
    }

    /// Force the whole mapped range and the underlying file.
    pub fn sync(&self) -> Result<()> {
        let st = self.state.read().unwrap();
        st.mmap()?.flush()?;
        st.file()?.sync_all()?;
        Ok(())
    }

    /// Flush, sync, then unmap and close the file. Further operations
    /// fail. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut st = self.state.write().unwrap();
        if st.mmap.is_none() {
            return Ok(());
        }
        st.commit_header()?;
        st.mmap()?.flush()?;
        st.file()?.sync_all()?;
        st.mmap = None;
        st.file = None;
        Ok(())
    }

    // ── Observability ──────────────────────────────────────────────

    /// Bytes in use (header + records).
    pub fn approx_size(&self) -> u64 {
        self.state.read().unwrap().header.last_offset
    }

    /// Next record offset.
    pub fn write_offset(&self) -> u64 {
        self.state.read().unwrap().header.last_offset
    }

    /// Records ever appended (tombstoned ones included).
    pub fn record_count(&self) -> u32 {
        self.state.read().unwrap().header.record_count
    }

    /// Live payload bytes over total payload bytes. An empty segment
    /// reports 1.0 so fresh segments never look compaction-worthy.
    pub fn fill_ratio(&self) -> f64 {
        let st = self.state.read().unwrap();
        let payload = st.header.last_offset - st.header.header_size() as u64;
        if payload == 0 {
            return 1.0;
        }
        st.live_bytes as f64 / payload as f64
    }

    /// Would appending `pattern` exceed the hard segment cap?
    pub fn will_overflow(&self, pattern: &WavePattern) -> bool {
        let st = self.state.read().unwrap();
        st.header.last_offset + record_size(pattern.len()) as u64 > SEGMENT_HARD_MAX
    }

    /// Current committed `last_offset` — the reader-cache version for
    /// this segment.
    pub fn version(&self) -> u64 {
        self.approx_size()
    }
}

// ── Internals ──────────────────────────────────────────────────────

/// Double the capacity (at least to `required`), extend the file, and
/// remap. The old mapping is dropped; cached readers hold their own
/// maps and are invalidated through the versioned cache.
fn grow(st: &mut WriterState, required: u64) -> Result<()> {
    let mut new_capacity = st.capacity.max(INITIAL_CAPACITY);
    while new_capacity < required {
        new_capacity = (new_capacity * 2).min(SEGMENT_HARD_MAX);
        if new_capacity == SEGMENT_HARD_MAX {
            break;
        }
    }
    let new_capacity = new_capacity.max(required);

    let file = st.file()?;
    file.set_len(new_capacity)?;
    let remapped = unsafe { MmapMut::map_mut(file)? };
    st.mmap = Some(remapped);
    st.capacity = new_capacity;
    Ok(())
}

/// Walk record framing from the header end and sum live record bytes.
fn scan_live_bytes(data: &[u8], header: &BinaryHeader) -> Result<u64> {
    let mut live = 0u64;
    let mut off = header.header_size();
    let end = header.last_offset as usize;
    while off < end {
        if off + RECORD_HEADER_SIZE > end {
            return Err(StoreError::IncompleteWrite(format!(
                "record header overruns segment end at offset {}",
                off
            )));
        }
        let len = read_u32_at(data, off + RECORD_LENGTH_OFFSET) as usize;
        if !(MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&len) {
            return Err(StoreError::IncompleteWrite(format!(
                "corrupt record framing at offset {}",
                off
            )));
        }
        let rsize = record_size(len);
        if off + rsize > end {
            return Err(StoreError::IncompleteWrite(format!(
                "record overruns segment end at offset {}",
                off
            )));
        }
        if data[off] == FLAG_LIVE {
            live += rsize as u64;
        }
        off += rsize;
    }
    Ok(live)
}

fn segment_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

// ── Tests ──────────────────────────────────────────────────────────
