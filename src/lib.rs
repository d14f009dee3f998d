//! ResonanceDB — a phase-sharded, memory-mapped, append-only store for
//! complex-valued waveforms.
//!
//! Patterns are pairs of equal-length f64 sequences (amplitude, phase),
//! content-addressed by a 16-byte hash and retrieved by resonance
//! energy — a normalized interference-plus-amplitude-balance score in
//! [0, 1].
//!
//! ```no_run
//! use resonancedb::{ResonanceStore, WavePattern};
//!
//! # fn main() -> resonancedb::Result<()> {
//! let store = ResonanceStore::open(std::path::Path::new("/tmp/resonance"))?;
//! let psi = WavePattern::new(vec![1.0, 0.5], vec![0.0, 0.1])?;
//! let id = store.insert(&psi, None)?;
//! let matches = store.query(&psi, 5)?;
//! assert_eq!(matches[0].id, id);
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod kernel;
pub mod pattern;
pub mod resource;
pub mod storage;
pub mod store;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use kernel::{CompareOptions, ResonanceKernel, ScalarKernel, Zone};
pub use pattern::{PhaseRange, WavePattern};
pub use store::{
    InterferenceEntry, InterferenceMap, ResonanceMatch, ResonanceMatchDetailed, ResonanceStore,
    StoreStats,
};
