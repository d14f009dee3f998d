//! Resonance kernel — similarity scoring over waveforms.
//!
//! The score is a normalized interference-plus-amplitude-balance energy
//! in [0, 1]:
//!
//! ```text
//! E_A   = Σ a1[i]²            E_B = Σ a2[i]²
//! IF    = Σ (a1[i]² + a2[i]² + 2·a1[i]·a2[i]·cos(φ2[i] − φ1[i]))
//! base  = 0.5 · IF / (E_A + E_B)
//! ampF  = 2·√(E_A·E_B) / (E_A + E_B)
//! score = base · ampF
//! ```
//!
//! The kernel is an injected capability: the store holds a
//! `Arc<dyn ResonanceKernel>` so an accelerated back-end can replace
//! `ScalarKernel` without any global state.

use rayon::prelude::*;

use crate::pattern::WavePattern;

// ── Constants ──────────────────────────────────────────────────────

/// Below this total energy the score is defined as zero.
const ENERGY_FLOOR: f64 = 1e-20;

/// Default candidate chunk size for batch scoring.
pub const DEFAULT_BATCH_SIZE: usize = 8192;

// ── Options ────────────────────────────────────────────────────────

/// Per-comparison options.
///
/// `ignore_phase` assumes perfect constructive interference (cos = 1).
/// The remaining flags are accepted for interface compatibility and are
/// currently no-ops; setting them does not change the score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompareOptions {
    pub ignore_phase: bool,
    pub normalize_amplitude: bool,
    pub allow_global_phase_shift: bool,
    pub enable_phase_alignment_bonus: bool,
}

impl CompareOptions {
    pub fn ignoring_phase() -> Self {
        Self {
            ignore_phase: true,
            ..Self::default()
        }
    }
}

// ── Zone ───────────────────────────────────────────────────────────

/// Interference zone of a match, derived from raw energy and phase
/// delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Zone {
    Core,
    Fringe,
    Shadow,
}

impl Zone {
    /// Classify from raw energy and mean phase delta.
    pub fn classify(energy: f32, phase_delta: f64) -> Self {
        if energy >= 0.9 && phase_delta.abs() < 0.1 {
            Zone::Core
        } else if energy < 0.1 {
            Zone::Shadow
        } else {
            Zone::Fringe
        }
    }
}

/// Single monotone ranking function over (energy, |phase_delta|):
/// equals `energy` at Δ = 0 and falls linearly to 0 at |Δ| = π.
pub fn zone_score(energy: f32, phase_delta: f64) -> f32 {
    let damp = 1.0 - phase_delta.abs() / std::f64::consts::PI;
    (energy as f64 * damp.clamp(0.0, 1.0)) as f32
}

// ── Kernel trait ───────────────────────────────────────────────────

/// Similarity kernel capability.
///
/// Implementations must be deterministic, symmetric in their arguments
/// up to floating rounding, and allocation-free in the scalar hot path.
/// When the two patterns differ in length, the comparison runs over the
/// common prefix of `min(L1, L2)` samples so the kernel stays total.
pub trait ResonanceKernel: Send + Sync {
    /// Resonance energy of two patterns, in [0, 1].
    fn compare(&self, a: &WavePattern, b: &WavePattern, opts: &CompareOptions) -> f32;

    /// Element-wise `compare(query, candidate)` over a candidate batch.
    fn compare_many(
        &self,
        query: &WavePattern,
        candidates: &[WavePattern],
        opts: &CompareOptions,
    ) -> Vec<f32>;

    /// Raw interference energy (without the amplitude-balance factor)
    /// plus the mean wrapped phase delta, for zone classification.
    fn compare_with_phase_delta(
        &self,
        a: &WavePattern,
        b: &WavePattern,
        opts: &CompareOptions,
    ) -> (f32, f64);
}

// ── ScalarKernel ───────────────────────────────────────────────────

/// Portable scalar reference kernel.
#[derive(Debug, Clone)]
pub struct ScalarKernel {
    batch_size: usize,
}

impl ScalarKernel {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for ScalarKernel {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}

/// Accumulated energies of one comparison.
struct Energies {
    e_a: f64,
    e_b: f64,
    interference: f64,
}

fn accumulate(a: &WavePattern, b: &WavePattern, ignore_phase: bool) -> Energies {
    let n = a.len().min(b.len());
    let (amp_a, phase_a) = (a.amplitude(), a.phase());
    let (amp_b, phase_b) = (b.amplitude(), b.phase());

    let mut e_a = 0.0;
    let mut e_b = 0.0;
    let mut interference = 0.0;
    for i in 0..n {
        let a1 = amp_a[i];
        let a2 = amp_b[i];
        e_a += a1 * a1;
        e_b += a2 * a2;
        if ignore_phase {
            let s = a1 + a2;
            interference += s * s;
        } else {
            let cos = (phase_b[i] - phase_a[i]).cos();
            interference += a1 * a1 + a2 * a2 + 2.0 * a1 * a2 * cos;
        }
    }
    Energies {
        e_a,
        e_b,
        interference,
    }
}

/// Normalized interference term, before amplitude balance.
fn base_energy(e: &Energies) -> f64 {
    let denom = e.e_a + e.e_b;
    if denom <= ENERGY_FLOOR {
        return 0.0;
    }
    0.5 * e.interference / denom
}

/// Amplitude-balance factor: 1.0 for equal energies, → 0 as they
/// diverge or either side vanishes.
fn amplitude_factor(e: &Energies) -> f64 {
    let denom = e.e_a + e.e_b;
    if denom <= ENERGY_FLOOR || e.e_a <= ENERGY_FLOOR || e.e_b <= ENERGY_FLOOR {
        return 0.0;
    }
    2.0 * (e.e_a * e.e_b).sqrt() / denom
}

/// Wrap a phase difference into (−π, π].
fn wrap_phase(d: f64) -> f64 {
    let tau = std::f64::consts::TAU;
    let mut w = d % tau;
    if w > std::f64::consts::PI {
        w -= tau;
    } else if w <= -std::f64::consts::PI {
        w += tau;
    }
    w
}

impl ResonanceKernel for ScalarKernel {
    fn compare(&self, a: &WavePattern, b: &WavePattern, opts: &CompareOptions) -> f32 {
        let e = accumulate(a, b, opts.ignore_phase);
        let score = base_energy(&e) * amplitude_factor(&e);
        score.clamp(0.0, 1.0) as f32
    }

    fn compare_many(
        &self,
        query: &WavePattern,
        candidates: &[WavePattern],
        opts: &CompareOptions,
    ) -> Vec<f32> {
        if candidates.len() <= self.batch_size {
            return candidates
                .iter()
                .map(|c| self.compare(query, c, opts))
                .collect();
        }
        candidates
            .par_chunks(self.batch_size)
            .flat_map_iter(|chunk| {
                chunk
                    .iter()
                    .map(|c| self.compare(query, c, opts))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    fn compare_with_phase_delta(
        &self,
        a: &WavePattern,
        b: &WavePattern,
        opts: &CompareOptions,
    ) -> (f32, f64) {
        let e = accumulate(a, b, opts.ignore_phase);
        let energy = base_energy(&e).clamp(0.0, 1.0) as f32;

        let n = a.len().min(b.len());
        let mut delta_sum = 0.0;
        for i in 0..n {
            delta_sum += wrap_phase(b.phase()[i] - a.phase()[i]);
        }
        let phase_delta = delta_sum / n as f64;

        (energy, phase_delta)
    }
}

// ── Tests ──────────────────────────────────────────────────────────
