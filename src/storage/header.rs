//! Segment header — fixed layout, crash-evident.
//!
//! ```text
//! Offset   Size  Field
//! 0        4     version: u32 = 1
//! 4        4     reserved: u32 = 0
//! 8        8     timestamp_ms: i64
//! 16       4     record_count: u32
//! 20       8     last_offset: u64
//! 28       4|8   checksum over [header_size, last_offset)
//! 32|36    1     commit_flag: 0 or 1
//! 33|37    2     pad
//! ```
//!
//! Total 35 bytes with a 4-byte checksum, 39 with an 8-byte one. The
//! checksum width is fixed per segment once written; on read it is
//! inferred by parsing at each candidate width and keeping the parse
//! whose checksum validates against the payload.

use crate::error::{Result, StoreError};
use crate::storage::layout::{read_i64_at, read_u32_at, read_u64_at};

// ── Format constants ───────────────────────────────────────────────

/// Segment format version.
pub const SEGMENT_VERSION: u32 = 1;

/// Header size with a 4-byte checksum.
pub const HEADER_SIZE_32: usize = 35;

/// Header size with an 8-byte checksum.
pub const HEADER_SIZE_64: usize = 39;

/// Largest header any segment can carry.
pub const MAX_HEADER_SIZE: usize = HEADER_SIZE_64;

// ── Checksum ───────────────────────────────────────────────────────

/// Per-segment checksum function. The width is part of the on-disk
/// format; the function is deterministic across reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumKind {
    /// CRC32 (4 bytes on disk).
    Crc32,
    /// xxHash64, seed 0 (8 bytes on disk).
    Xx64,
}

impl ChecksumKind {
    /// On-disk checksum width in bytes.
    pub fn width(&self) -> usize {
        match self {
            ChecksumKind::Crc32 => 4,
            ChecksumKind::Xx64 => 8,
        }
    }

    /// Header size for this checksum width.
    pub fn header_size(&self) -> usize {
        match self {
            ChecksumKind::Crc32 => HEADER_SIZE_32,
            ChecksumKind::Xx64 => HEADER_SIZE_64,
        }
    }

    /// Checksum the given payload.
    pub fn compute(&self, payload: &[u8]) -> u64 {
        match self {
            ChecksumKind::Crc32 => crc32fast::hash(payload) as u64,
            ChecksumKind::Xx64 => xxhash_rust::xxh64::xxh64(payload, 0),
        }
    }
}

// ── BinaryHeader ───────────────────────────────────────────────────

/// Parsed segment header.
#[derive(Debug, Clone, Copy)]
pub struct BinaryHeader {
    pub version: u32,
    pub reserved: u32,
    pub timestamp_ms: i64,
    pub record_count: u32,
    pub last_offset: u64,
    pub checksum: u64,
    pub checksum_kind: ChecksumKind,
    pub commit_flag: u8,
}

impl BinaryHeader {
    /// Fresh header for a new, empty segment.
    pub fn new(checksum_kind: ChecksumKind) -> Self {
        let header_size = checksum_kind.header_size() as u64;
        Self {
            version: SEGMENT_VERSION,
            reserved: 0,
            timestamp_ms: now_ms(),
            record_count: 0,
            last_offset: header_size,
            checksum: checksum_kind.compute(&[]),
            checksum_kind,
            commit_flag: 1,
        }
    }

    /// Header size for this header's checksum width.
    pub fn header_size(&self) -> usize {
        self.checksum_kind.header_size()
    }

    /// Serialize into `out`, which must hold at least `header_size()`
    /// bytes. Pad bytes are zeroed.
    pub fn write_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= self.header_size());
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..8].copy_from_slice(&self.reserved.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        out[16..20].copy_from_slice(&self.record_count.to_le_bytes());
        out[20..28].copy_from_slice(&self.last_offset.to_le_bytes());
        match self.checksum_kind {
            ChecksumKind::Crc32 => {
                out[28..32].copy_from_slice(&(self.checksum as u32).to_le_bytes());
                out[32] = self.commit_flag;
                out[33] = 0;
                out[34] = 0;
            }
            ChecksumKind::Xx64 => {
                out[28..36].copy_from_slice(&self.checksum.to_le_bytes());
                out[36] = self.commit_flag;
                out[37] = 0;
                out[38] = 0;
            }
        }
    }

    /// Parse a header at a known checksum width. Validates structural
    /// fields only; commit flag and checksum agreement are enforced by
    /// the caller (readers reject, writers repair).
    pub fn from_bytes(bytes: &[u8], kind: ChecksumKind) -> Result<Self> {
        let size = kind.header_size();
        if bytes.len() < size {
            return Err(StoreError::IncompleteWrite(format!(
                "file too small for header: {} < {}",
                bytes.len(),
                size
            )));
        }
        let version = read_u32_at(bytes, 0);
        if version != SEGMENT_VERSION {
            return Err(StoreError::IncompleteWrite(format!(
                "unsupported segment version: {}",
                version
            )));
        }
        let reserved = read_u32_at(bytes, 4);
        let timestamp_ms = read_i64_at(bytes, 8);
        let record_count = read_u32_at(bytes, 16);
        let last_offset = read_u64_at(bytes, 20);
        let (checksum, commit_flag) = match kind {
            ChecksumKind::Crc32 => (read_u32_at(bytes, 28) as u64, bytes[32]),
            ChecksumKind::Xx64 => (read_u64_at(bytes, 28), bytes[36]),
        };
        if commit_flag > 1 {
            return Err(StoreError::IncompleteWrite(format!(
                "torn header: commit flag {}",
                commit_flag
            )));
        }
        if last_offset < size as u64 {
            return Err(StoreError::IncompleteWrite(format!(
                "last_offset {} precedes header end {}",
                last_offset, size
            )));
        }
        Ok(Self {
            version,
            reserved,
            timestamp_ms,
            record_count,
            last_offset,
            checksum,
            checksum_kind: kind,
            commit_flag,
        })
    }

    /// Infer the checksum width of a segment file and return the parsed
    /// header. A parse wins when its stored checksum matches the payload
    /// `[header_size, last_offset)`; 8-byte (the default width) is tried
    /// first. Fails `IncompleteWrite` when no width validates — a torn
    /// header cannot tell us where records end.
    pub fn infer_from_file(data: &[u8]) -> Result<Self> {
        let mut first_err = None;
        for kind in [ChecksumKind::Xx64, ChecksumKind::Crc32] {
            if data.len() < kind.header_size() {
                continue;
            }
            match Self::from_bytes(data, kind) {
                Ok(header) => {
                    let end = header.last_offset as usize;
                    if end > data.len() {
                        first_err.get_or_insert(StoreError::IncompleteWrite(format!(
                            "last_offset {} beyond file size {}",
                            end,
                            data.len()
                        )));
                        continue;
                    }
                    let payload = &data[header.header_size()..end];
                    if header.checksum_kind.compute(payload) == header.checksum {
                        return Ok(header);
                    }
                    first_err.get_or_insert(StoreError::IncompleteWrite(
                        "checksum mismatch".into(),
                    ));
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.unwrap_or_else(|| {
            StoreError::IncompleteWrite(format!(
                "file too small for header: {} < {}",
                data.len(),
                HEADER_SIZE_32
            ))
        }))
    }
}

/// Milliseconds since the Unix epoch. Informational only — recovery
/// never consults the timestamp.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ── Tests ──────────────────────────────────────────────────────────
