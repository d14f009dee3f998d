//! Phase router — shard selection for inserts and queries.
//!
//! Routing is advisory: it narrows the candidate shards for a query,
//! and the store falls back to a full scan whenever the candidate set
//! comes back empty. Two modes, mutually exclusive by construction:
//!
//! - **Explicit**: a sorted list of phase centers, one per shard, plus
//!   an epsilon half-width for query windows.
//! - **Hashed**: `N` uniform shards `phase-0 … phase-(N-1)`, routed by
//!   hashing the quantized mean phase.

use crate::pattern::WavePattern;
use crate::storage::group::split_segment_name;
use crate::storage::manifest::Location;

// ── PhaseRouter ────────────────────────────────────────────────────

pub struct PhaseRouter {
    mode: Mode,
}

enum Mode {
    Explicit {
        /// (center, shard base), sorted by center.
        centers: Vec<(f64, String)>,
        epsilon: f64,
    },
    Hashed {
        shard_count: usize,
    },
}

impl PhaseRouter {
    /// Explicit-range router over `(center, shard)` pairs.
    pub fn explicit(mut centers: Vec<(f64, String)>, epsilon: f64) -> Self {
        centers.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        Self {
            mode: Mode::Explicit { centers, epsilon },
        }
    }

    /// Uniform hash router over `shard_count` shards.
    pub fn hashed(shard_count: usize) -> Self {
        Self {
            mode: Mode::Hashed {
                shard_count: shard_count.max(1),
            },
        }
    }

    /// Rebuild an explicit router from manifest entries: group the
    /// locations by shard base and average each shard's phase centers.
    pub fn from_manifest(locations: &[(String, Location)], epsilon: f64) -> Self {
        use std::collections::HashMap;

        let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
        for (_, loc) in locations {
            let base = split_segment_name(&loc.segment).0.to_string();
            let entry = sums.entry(base).or_insert((0.0, 0));
            entry.0 += loc.phase_center;
            entry.1 += 1;
        }
        let centers = sums
            .into_iter()
            .map(|(base, (sum, n))| (sum / n as f64, base))
            .collect();
        Self::explicit(centers, epsilon)
    }

    /// Every shard this router knows about.
    pub fn shards(&self) -> Vec<String> {
        match &self.mode {
            Mode::Explicit { centers, .. } => {
                centers.iter().map(|(_, name)| name.clone()).collect()
            }
            Mode::Hashed { shard_count } => {
                (0..*shard_count).map(|i| format!("phase-{}", i)).collect()
            }
        }
    }

    pub fn shard_count(&self) -> usize {
        match &self.mode {
            Mode::Explicit { centers, .. } => centers.len(),
            Mode::Hashed { shard_count } => *shard_count,
        }
    }

    /// The shard an insert of `pattern` lands in. Total on any pattern:
    /// explicit mode takes the greatest center at or below the mean
    /// phase, wrapping to the first shard below all centers; hash mode
    /// buckets the quantized mean.
    pub fn select_shard(&self, pattern: &WavePattern) -> String {
        let mean = pattern.mean_phase();
        match &self.mode {
            Mode::Explicit { centers, .. } => {
                let floor = centers
                    .iter()
                    .rev()
                    .find(|(center, _)| *center <= mean)
                    .or_else(|| centers.first());
                floor
                    .map(|(_, name)| name.clone())
                    .unwrap_or_else(|| "phase-0".to_string())
            }
            Mode::Hashed { shard_count } => {
                format!("phase-{}", hash_bucket(mean, *shard_count))
            }
        }
    }

    /// Candidate shards for a query. Explicit mode returns the shards
    /// whose centers fall inside `[mean − ε, mean + ε]`, widening to
    /// every shard when the window is empty; hash mode pinpoints one.
    pub fn relevant_shards(&self, pattern: &WavePattern) -> Vec<String> {
        let mean = pattern.mean_phase();
        match &self.mode {
            Mode::Explicit { centers, epsilon } => {
                let lo = mean - epsilon;
                let hi = mean + epsilon;
                let hits: Vec<String> = centers
                    .iter()
                    .filter(|(center, _)| *center >= lo && *center <= hi)
                    .map(|(_, name)| name.clone())
                    .collect();
                if hits.is_empty() {
                    self.shards()
                } else {
                    hits
                }
            }
            Mode::Hashed { .. } => vec![self.select_shard(pattern)],
        }
    }

    /// The phase window a query over `pattern` covers.
    pub fn phase_range(&self, pattern: &WavePattern) -> (f64, f64) {
        let mean = pattern.mean_phase();
        match &self.mode {
            Mode::Explicit { epsilon, .. } => (mean - epsilon, mean + epsilon),
            Mode::Hashed { .. } => (mean, mean),
        }
    }
}

/// Quantize a mean phase to milliradians and hash it into a bucket.
fn hash_bucket(mean: f64, shard_count: usize) -> usize {
    let key = (mean * 1000.0).round() as i64;
    let hash = xxhash_rust::xxh64::xxh64(&key.to_le_bytes(), 0);
    (hash % shard_count as u64) as usize
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn pattern_with_mean(mean: f64) -> WavePattern {
        WavePattern::new(vec![1.0, 1.0], vec![mean, mean]).unwrap()
    }

    fn explicit_router() -> PhaseRouter {
        PhaseRouter::explicit(
            vec![
                (0.25, "phase-0".to_string()),
                (0.75, "phase-1".to_string()),
                (1.25, "phase-2".to_string()),
            ],
            0.1,
        )
    }

    #[test]
    fn test_explicit_floor_selection() {
        let router = explicit_router();
        assert_eq!(router.select_shard(&pattern_with_mean(0.3)), "phase-0");
        assert_eq!(router.select_shard(&pattern_with_mean(0.75)), "phase-1");
        assert_eq!(router.select_shard(&pattern_with_mean(2.0)), "phase-2");
    }

    #[test]
    fn test_explicit_wraps_below_first_center() {
        let router = explicit_router();
        assert_eq!(router.select_shard(&pattern_with_mean(0.1)), "phase-0");
    }

    #[test]
    fn test_explicit_relevant_window() {
        let router = explicit_router();
        let shards = router.relevant_shards(&pattern_with_mean(0.7));
        assert_eq!(shards, vec!["phase-1".to_string()]);
    }

    #[test]
    fn test_explicit_empty_window_falls_back_to_all() {
        let router = explicit_router();
        // 0.5 is more than ε from every center.
        let shards = router.relevant_shards(&pattern_with_mean(0.5));
        assert_eq!(shards.len(), 3);
    }

    #[test]
    fn test_explicit_phase_range() {
        let router = explicit_router();
        let (lo, hi) = router.phase_range(&pattern_with_mean(0.7));
        assert!((lo - 0.6).abs() < 1e-12);
        assert!((hi - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_hashed_is_deterministic_and_in_range() {
        let router = PhaseRouter::hashed(16);
        for i in 0..100 {
            let mean = i as f64 * PI / 100.0;
            let p = pattern_with_mean(mean);
            let a = router.select_shard(&p);
            let b = router.select_shard(&p);
            assert_eq!(a, b);
            let idx: usize = a.strip_prefix("phase-").unwrap().parse().unwrap();
            assert!(idx < 16);
        }
    }

    #[test]
    fn test_hashed_relevant_is_single() {
        let router = PhaseRouter::hashed(8);
        let p = pattern_with_mean(1.0);
        let shards = router.relevant_shards(&p);
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0], router.select_shard(&p));
    }

    #[test]
    fn test_hashed_phase_range_degenerate() {
        let router = PhaseRouter::hashed(8);
        let (lo, hi) = router.phase_range(&pattern_with_mean(1.0));
        assert_eq!(lo, hi);
    }

    #[test]
    fn test_hashed_spreads_across_shards() {
        let router = PhaseRouter::hashed(16);
        let mut seen = std::collections::HashSet::new();
        for i in 0..1000 {
            let mean = i as f64 * PI / 1000.0;
            seen.insert(router.select_shard(&pattern_with_mean(mean)));
        }
        assert!(seen.len() > 8, "only {} shards hit", seen.len());
    }

    #[test]
    fn test_from_manifest_averages_centers() {
        let locations = vec![
            (
                "id1".to_string(),
                Location {
                    segment: "phase-0-0".to_string(),
                    offset: 39,
                    phase_center: 0.2,
                },
            ),
            (
                "id2".to_string(),
                Location {
                    segment: "phase-0-1".to_string(),
                    offset: 39,
                    phase_center: 0.4,
                },
            ),
            (
                "id3".to_string(),
                Location {
                    segment: "phase-1-0".to_string(),
                    offset: 39,
                    phase_center: 1.0,
                },
            ),
        ];
        let router = PhaseRouter::from_manifest(&locations, 0.15);
        let shards = router.shards();
        assert_eq!(shards, vec!["phase-0".to_string(), "phase-1".to_string()]);
        // Mean 0.3 sits on phase-0's averaged center.
        assert_eq!(
            router.relevant_shards(&pattern_with_mean(0.3)),
            vec!["phase-0".to_string()]
        );
    }

    #[test]
    fn test_selection_total_on_odd_input() {
        // NaN mean must still route somewhere (I4).
        let p = WavePattern::new(vec![1.0], vec![f64::NAN]).unwrap();
        let explicit = explicit_router();
        assert!(!explicit.select_shard(&p).is_empty());
        let hashed = PhaseRouter::hashed(4);
        assert!(!hashed.select_shard(&p).is_empty());
    }
}
