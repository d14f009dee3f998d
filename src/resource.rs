//! System resource detection for adaptive defaults.
//!
//! Probes available RAM to size the reader cache: mapped segment views
//! are cheap until the working set outgrows memory, so the default
//! budget is whatever is available minus a safety floor. Stateless —
//! each call re-probes.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

// ── Constants ──────────────────────────────────────────────────────

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Headroom subtracted from available memory.
const CACHE_HEADROOM: u64 = 64 * MB;

/// Reader cache floor.
const CACHE_MIN: u64 = 64 * MB;

/// Reader cache ceiling.
const CACHE_MAX: u64 = 4 * GB;

// ── SystemResources ────────────────────────────────────────────────

/// Snapshot of detected memory resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
}

impl SystemResources {
    /// Probe the current system.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();
        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
        }
    }

    /// Reader-cache byte budget:
    /// `clamp(available − 64 MiB, 64 MiB, 4 GiB)`.
    pub fn reader_cache_budget(&self) -> u64 {
        self.available_memory_bytes
            .saturating_sub(CACHE_HEADROOM)
            .clamp(CACHE_MIN, CACHE_MAX)
    }
}

/// Probe the system and return the default reader-cache budget.
pub fn default_reader_cache_budget() -> u64 {
    SystemResources::detect().reader_cache_budget()
}

// ── Tests ──────────────────────────────────────────────────────────
