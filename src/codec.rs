//! Wave codec — little-endian byte layout for `WavePattern`.
//!
//! ```text
//! Offset  Size   Field
//! [0      4      magic: 0x57565750 (self-describing mode only)]
//! +0      4      length: u32
//! +4      8*L    amplitude: f64 × L
//! +4+8L   8*L    phase: f64 × L
//! ```
//!
//! The bare form (no magic) is what segment records embed; the
//! self-describing form is the standalone serialize/deserialize utility
//! for tooling interchange.

use crate::error::{Result, StoreError};
use crate::pattern::{WavePattern, MAX_PATTERN_LEN, MIN_PATTERN_LEN};

// ── Constants ──────────────────────────────────────────────────────

/// Magic prefix for self-describing blobs ("PWVW" little-endian).
pub const WAVE_MAGIC: u32 = 0x5756_5750;

/// Encoded size of a pattern of length `len`.
pub fn encoded_size(len: usize, with_magic: bool) -> usize {
    let base = 4 + 16 * len;
    if with_magic {
        base + 4
    } else {
        base
    }
}

// ── Encode ─────────────────────────────────────────────────────────

/// Encode a pattern to bytes. With `with_magic`, prepends `WAVE_MAGIC`.
pub fn encode(pattern: &WavePattern, with_magic: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_size(pattern.len(), with_magic));
    if with_magic {
        out.extend_from_slice(&WAVE_MAGIC.to_le_bytes());
    }
    out.extend_from_slice(&(pattern.len() as u32).to_le_bytes());
    for &a in pattern.amplitude() {
        out.extend_from_slice(&a.to_le_bytes());
    }
    for &p in pattern.phase() {
        out.extend_from_slice(&p.to_le_bytes());
    }
    out
}

/// Encode the sample payload only (no length prefix): amplitudes then
/// phases. Segment records carry the length in their own header.
pub fn encode_samples_into(pattern: &WavePattern, out: &mut [u8]) {
    debug_assert_eq!(out.len(), 16 * pattern.len());
    let mut off = 0;
    for &a in pattern.amplitude() {
        out[off..off + 8].copy_from_slice(&a.to_le_bytes());
        off += 8;
    }
    for &p in pattern.phase() {
        out[off..off + 8].copy_from_slice(&p.to_le_bytes());
        off += 8;
    }
}

// ── Decode ─────────────────────────────────────────────────────────

/// Decode a pattern from bytes. Fails with `InvalidPattern` on a wrong
/// magic (self-describing mode), an out-of-range length, or a truncated
/// buffer. Trailing bytes beyond the encoded pattern are ignored.
pub fn decode(bytes: &[u8], with_magic: bool) -> Result<WavePattern> {
    let mut off = 0;

    if with_magic {
        if bytes.len() < 4 {
            return Err(StoreError::InvalidPattern(
                "buffer too small for magic".into(),
            ));
        }
        let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if magic != WAVE_MAGIC {
            return Err(StoreError::InvalidPattern(format!(
                "bad magic: expected {:#010x}, got {:#010x}",
                WAVE_MAGIC, magic
            )));
        }
        off = 4;
    }

    if bytes.len() < off + 4 {
        return Err(StoreError::InvalidPattern(
            "buffer too small for length".into(),
        ));
    }
    let len = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
    off += 4;

    if !(MIN_PATTERN_LEN..=MAX_PATTERN_LEN).contains(&len) {
        return Err(StoreError::InvalidPattern(format!(
            "pattern length {} outside [{}, {}]",
            len, MIN_PATTERN_LEN, MAX_PATTERN_LEN
        )));
    }
    if bytes.len() < off + 16 * len {
        return Err(StoreError::InvalidPattern(format!(
            "buffer underflow: need {} bytes, have {}",
            off + 16 * len,
            bytes.len()
        )));
    }

    let (amplitude, phase) = decode_samples(&bytes[off..off + 16 * len], len);
    WavePattern::new(amplitude, phase)
}

/// Decode `len` amplitudes then `len` phases from a raw sample payload.
pub fn decode_samples(bytes: &[u8], len: usize) -> (Vec<f64>, Vec<f64>) {
    debug_assert!(bytes.len() >= 16 * len);
    let mut amplitude = Vec::with_capacity(len);
    let mut phase = Vec::with_capacity(len);
    let mut off = 0;
    for _ in 0..len {
        amplitude.push(f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
        off += 8;
    }
    for _ in 0..len {
        phase.push(f64::from_le_bytes(bytes[off..off + 8].try_into().unwrap()));
        off += 8;
    }
    (amplitude, phase)
}

// ── Tests ──────────────────────────────────────────────────────────
