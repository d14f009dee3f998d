//! Read-only segment view.
//!
//! Opens a segment with a read-only mmap, validating the header before
//! anything else: checksum width is inferred, the payload checksum must
//! match, and `commit_flag` must be 1 — otherwise the segment is
//! rejected with `IncompleteWrite` and the caller isolates it.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::codec::decode_samples;
use crate::error::{Result, StoreError};
use crate::pattern::{hex_lower, WavePattern, MAX_PATTERN_LEN, MIN_PATTERN_LEN};
use crate::storage::header::BinaryHeader;
use crate::storage::layout::{
    read_u32_at, record_size, FLAG_LIVE, RECORD_HEADER_SIZE, RECORD_LENGTH_OFFSET,
};

// ── StoredPattern ──────────────────────────────────────────────────

/// A live record read back from a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPattern {
    pub id: String,
    pub pattern: WavePattern,
    pub offset: u64,
}

// ── SegmentReader ──────────────────────────────────────────────────

/// Immutable mmap view over one committed segment.
pub struct SegmentReader {
    name: String,
    path: PathBuf,
    mmap: Mmap,
    header: BinaryHeader,
    file_size: u64,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("header", &self.header)
            .field("file_size", &self.file_size)
            .finish()
    }
}

impl SegmentReader {
    /// Open and validate a segment for reading.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mmap = unsafe { Mmap::map(&file)? };

        let header = BinaryHeader::infer_from_file(&mmap)?;
        if header.commit_flag != 1 {
            return Err(StoreError::IncompleteWrite(format!(
                "segment {} has uncommitted header",
                path.display()
            )));
        }

        Ok(Self {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            mmap,
            header,
            file_size,
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

    /// Committed data end — the reader's version.
    pub fn last_offset(&self) -> u64 {
        self.header.last_offset
    }

    /// Records appended over the segment's lifetime.
    pub fn record_count(&self) -> u32 {
        self.header.record_count
    }

    /// On-disk size, used as the cache weight.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Read the record starting at `offset`. A tombstone reads as
    /// `PatternNotFound`.
    pub fn read_with_id(&self, offset: u64) -> Result<StoredPattern> {
        let end = self.header.last_offset as usize;
        let off = offset as usize;
        if off < self.header.header_size() || off + RECORD_HEADER_SIZE > end {
            return Err(StoreError::PatternNotFound(format!(
                "no record at offset {} in segment {}",
                offset, self.name
            )));
        }

        let flag = self.mmap[off];
        let len = read_u32_at(&self.mmap, off + RECORD_LENGTH_OFFSET) as usize;
        if !(MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&len) || off + record_size(len) > end {
            return Err(StoreError::IncompleteWrite(format!(
                "corrupt record framing at offset {} in segment {}",
                offset, self.name
            )));
        }
        if flag != FLAG_LIVE {
            return Err(StoreError::PatternNotFound(format!(
                "record at offset {} in segment {} is tombstoned",
                offset, self.name
            )));
        }

        let id = hex_lower(&self.mmap[off + 1..off + 17]);
        let payload = &self.mmap[off + RECORD_HEADER_SIZE..off + RECORD_HEADER_SIZE + 16 * len];
        let (amplitude, phase) = decode_samples(payload, len);
        Ok(StoredPattern {
            id,
            pattern: WavePattern::new(amplitude, phase)?,
            offset,
        })
    }

    /// Linear scan of all live records, oldest first. Tombstones are
    /// skipped by framing; a later record with the same ID overrides an
    /// earlier one in place (last-write-wins).
    pub fn read_all_with_id(&self) -> Result<Vec<StoredPattern>> {
        use std::collections::HashMap;

        let mut out: Vec<StoredPattern> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        let end = self.header.last_offset as usize;
        let mut off = self.header.header_size();
        while off < end {
            if off + RECORD_HEADER_SIZE > end {
                return Err(StoreError::IncompleteWrite(format!(
                    "record header overruns segment end at offset {}",
                    off
                )));
            }
            let len = read_u32_at(&self.mmap, off + RECORD_LENGTH_OFFSET) as usize;
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

            if self.mmap[off] == FLAG_LIVE {
                let record = self.read_with_id(off as u64)?;
                match by_id.get(&record.id) {
                    Some(&i) => out[i] = record,
                    None => {
                        by_id.insert(record.id.clone(), out.len());
                        out.push(record);
                    }
                }
            }
            off += rsize;
        }
        Ok(out)
    }

    /// Drop the mapping explicitly.
    pub fn close(self) {}
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::header::ChecksumKind;
    use crate::storage::writer::SegmentWriter;
    use tempfile::TempDir;

    fn make_pattern(amp: &[f64], phase: &[f64]) -> WavePattern {
        WavePattern::new(amp.to_vec(), phase.to_vec()).unwrap()
    }

    fn written_segment(dir: &TempDir, patterns: &[WavePattern]) -> std::path::PathBuf {
        let path = dir.path().join("s.segment");
        let writer = SegmentWriter::open(&path, ChecksumKind::Xx64).unwrap();
        for p in patterns {
            writer.write(&p.content_id(), p).unwrap();
        }
        writer.close().unwrap();
        path
    }

    #[test]
    fn test_open_committed_segment() {
        let dir = TempDir::new().unwrap();
        let p = make_pattern(&[1.0, 2.0], &[0.0, 0.1]);
        let path = written_segment(&dir, std::slice::from_ref(&p));

        let reader = SegmentReader::open(&path).unwrap();
        assert_eq!(reader.name(), "s");
        assert_eq!(reader.record_count(), 1);
        assert!(reader.last_offset() > 39);
    }

    #[test]
    fn test_read_with_id_roundtrip() {
        let dir = TempDir::new().unwrap();
        let p = make_pattern(&[0.37454012, 0.9507143], &[0.0, 0.1]);
        let path = written_segment(&dir, std::slice::from_ref(&p));

        let reader = SegmentReader::open(&path).unwrap();
        let stored = reader.read_with_id(39).unwrap();
        assert_eq!(stored.id, p.content_id());
        assert_eq!(stored.pattern, p);
        assert_eq!(stored.offset, 39);
    }

    #[test]
    fn test_read_tombstone_is_not_found() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.segment");
        let p = make_pattern(&[1.0], &[0.0]);
        let writer = SegmentWriter::open(&path, ChecksumKind::Xx64).unwrap();
        let off = writer.write(&p.content_id(), &p).unwrap();
        writer.mark_deleted(off).unwrap();
        writer.close().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let err = reader.read_with_id(off).unwrap_err();
        assert!(matches!(err, StoreError::PatternNotFound(_)));
    }

    #[test]
    fn test_read_all_skips_tombstones() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.segment");
        let writer = SegmentWriter::open(&path, ChecksumKind::Xx64).unwrap();
        let patterns: Vec<WavePattern> = (0..5)
            .map(|i| make_pattern(&[i as f64 + 1.0], &[0.1 * i as f64]))
            .collect();
        let offsets: Vec<u64> = patterns
            .iter()
            .map(|p| writer.write(&p.content_id(), p).unwrap())
            .collect();
        writer.mark_deleted(offsets[1]).unwrap();
        writer.mark_deleted(offsets[3]).unwrap();
        writer.close().unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        let all = reader.read_all_with_id().unwrap();
        assert_eq!(all.len(), 3);
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                patterns[0].content_id().as_str(),
                patterns[2].content_id().as_str(),
                patterns[4].content_id().as_str()
            ]
        );
    }

    #[test]
    fn test_read_all_last_write_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s.segment");
        let p = make_pattern(&[1.0, 2.0], &[0.0, 0.5]);
        let writer = SegmentWriter::open(&path, ChecksumKind::Xx64).unwrap();
        let off1 = writer.write(&p.content_id(), &p).unwrap();
        let off2 = writer.write(&p.content_id(), &p).unwrap();
        writer.close().unwrap();
        assert_ne!(off1, off2);

        let reader = SegmentReader::open(&path).unwrap();
        let all = reader.read_all_with_id().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].offset, off2, "later offset must win");
    }

    #[test]
    fn test_open_rejects_uncommitted_flag() {
        let dir = TempDir::new().unwrap();
        let p = make_pattern(&[1.0], &[0.0]);
        let path = written_segment(&dir, std::slice::from_ref(&p));

        // Flip commit_flag to 0 (offset 36 for the 8-byte width).
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[36] = 0;
        std::fs::write(&path, &bytes).unwrap();

        let err = SegmentReader::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::IncompleteWrite(_)));
    }

    #[test]
    fn test_open_rejects_checksum_mismatch() {
        let dir = TempDir::new().unwrap();
        let p = make_pattern(&[1.0], &[0.0]);
        let path = written_segment(&dir, std::slice::from_ref(&p));

        // Corrupt one payload byte past the header.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[64] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let err = SegmentReader::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::IncompleteWrite(_)));
    }

    #[test]
    fn test_read_beyond_end_is_not_found() {
        let dir = TempDir::new().unwrap();
        let p = make_pattern(&[1.0], &[0.0]);
        let path = written_segment(&dir, std::slice::from_ref(&p));

        let reader = SegmentReader::open(&path).unwrap();
        let err = reader.read_with_id(1 << 20).unwrap_err();
        assert!(matches!(err, StoreError::PatternNotFound(_)));
    }
}
