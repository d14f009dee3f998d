//! Store configuration.
//!
//! Runtime knobs live in `StoreConfig`; the deployment-stable subset
//! (checksum width, shard layout, routing epsilon) is persisted to
//! `store-config.json` at store creation and read back on every open,
//! so a store keeps its on-disk format even when the caller's defaults
//! change.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::kernel::DEFAULT_BATCH_SIZE;
use crate::storage::header::ChecksumKind;

// ── StoreConfig ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Segment rolling threshold.
    pub segment_max_bytes: u64,
    /// Candidate chunk size in the batch kernel path.
    pub batch_size: usize,
    /// Router half-width for query windows.
    pub phase_epsilon: f64,
    /// Checksum width for new segments (4 or 8 bytes).
    pub checksum_width: u8,
    /// Flush dispatcher period.
    pub flush_interval_ms: u64,
    /// Reader cache budget; `None` probes system memory.
    pub reader_cache_max_bytes: Option<u64>,
    /// Shard count for hash routing.
    pub shard_count: usize,
    /// Explicit router centers `(phase center, shard name)`; hash
    /// routing when absent.
    pub explicit_centers: Option<Vec<(f64, String)>>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: 64 * 1024 * 1024,
            batch_size: DEFAULT_BATCH_SIZE,
            phase_epsilon: 0.1,
            checksum_width: 8,
            flush_interval_ms: 500,
            reader_cache_max_bytes: None,
            shard_count: 16,
            explicit_centers: None,
        }
    }
}

impl StoreConfig {
    /// Checksum function implied by `checksum_width`.
    pub fn checksum_kind(&self) -> Result<ChecksumKind> {
        match self.checksum_width {
            4 => Ok(ChecksumKind::Crc32),
            8 => Ok(ChecksumKind::Xx64),
            w => Err(StoreError::InvalidPattern(format!(
                "unsupported checksum width {} (expected 4 or 8)",
                w
            ))),
        }
    }
}

// ── Persisted subset ───────────────────────────────────────────────

/// The deployment-stable configuration written once at store creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PersistedConfig {
    pub checksum_width: u8,
    pub shard_count: usize,
    pub phase_epsilon: f64,
    #[serde(default)]
    pub explicit_centers: Option<Vec<(f64, String)>>,
}

impl PersistedConfig {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            checksum_width: config.checksum_width,
            shard_count: config.shard_count,
            phase_epsilon: config.phase_epsilon,
            explicit_centers: config.explicit_centers.clone(),
        }
    }

    /// Read from the store root. Returns `None` when the file does not
    /// exist (first open).
    pub fn read_from(root: &Path) -> Result<Option<Self>> {
        let path = root.join("store-config.json");
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Write to the store root.
    pub fn write_to(&self, root: &Path) -> Result<()> {
        let path = root.join("store-config.json");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    /// Fold the persisted values back into a runtime config.
    pub fn apply_to(&self, config: &mut StoreConfig) {
        config.checksum_width = self.checksum_width;
        config.shard_count = self.shard_count;
        config.phase_epsilon = self.phase_epsilon;
        config.explicit_centers = self.explicit_centers.clone();
    }
}

// ── Tests ──────────────────────────────────────────────────────────
