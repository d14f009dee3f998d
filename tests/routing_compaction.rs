//! Integration test: phase routing, segment rollover, compaction.

use std::collections::HashMap;

use resonancedb::storage::{Manifest, PhaseRouter};
use resonancedb::{CompareOptions, ResonanceKernel, ResonanceStore, ScalarKernel, StoreConfig, WavePattern};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Pattern whose mean phase is exactly `mean` (constant phase).
fn pattern_with_mean(mean: f64, seed: usize) -> WavePattern {
    let amp: Vec<f64> = (0..8)
        .map(|i| 0.2 + ((seed + i) % 13) as f64 * 0.06)
        .collect();
    WavePattern::new(amp, vec![mean; 8]).unwrap()
}

fn uniform_centers(n: usize) -> Vec<(f64, String)> {
    let step = std::f64::consts::PI / n as f64;
    (0..n)
        .map(|i| (step * (i as f64 + 0.5), format!("phase-{}", i)))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests: Routing
// ---------------------------------------------------------------------------

#[test]
fn routed_query_matches_full_scan_over_relevant_shards() {
    let dir = TempDir::new().unwrap();
    let centers = uniform_centers(16);
    let epsilon = 0.1;
    let mut config = StoreConfig::default();
    config.explicit_centers = Some(centers.clone());
    config.phase_epsilon = epsilon;

    let store = ResonanceStore::open_with_config(&dir.path().join("db"), config).unwrap();

    // 1000 patterns with mean phases spread uniformly over [0, PI).
    let patterns: Vec<WavePattern> = (0..1000)
        .map(|i| pattern_with_mean(i as f64 * std::f64::consts::PI / 1000.0, i))
        .collect();
    for p in &patterns {
        store.insert(p, None).unwrap();
    }

    let query = pattern_with_mean(std::f64::consts::PI / 3.0, 7777);

    // The same router the store built from its config.
    let router = PhaseRouter::explicit(centers, epsilon);
    let relevant = router.relevant_shards(&query);
    assert!(!relevant.is_empty());

    // Brute-force reference: score every pattern routed into a
    // relevant shard, sort by (energy desc, id asc).
    let kernel = ScalarKernel::default();
    let mut reference: Vec<(String, f32)> = patterns
        .iter()
        .filter(|p| relevant.contains(&router.select_shard(p)))
        .map(|p| {
            (
                p.content_id(),
                kernel.compare(&query, p, &CompareOptions::default()),
            )
        })
        .collect();
    reference.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    reference.truncate(10);

    let matches = store.query(&query, 10).unwrap();
    assert_eq!(matches.len(), reference.len());
    for (m, (ref_id, ref_energy)) in matches.iter().zip(&reference) {
        assert_eq!(&m.id, ref_id);
        assert_eq!(m.energy, *ref_energy, "bit-identical to the full scan");
    }
}

#[test]
fn zero_phase_probe_scans_all_shards() {
    let dir = TempDir::new().unwrap();
    let mut config = StoreConfig::default();
    config.explicit_centers = Some(uniform_centers(8));

    let store = ResonanceStore::open_with_config(&dir.path().join("db"), config).unwrap();
    let patterns: Vec<WavePattern> = (0..50)
        .map(|i| pattern_with_mean(0.2 + i as f64 * 0.05, i))
        .collect();
    for p in &patterns {
        store.insert(p, None).unwrap();
    }

    // A phase-0 probe falls below every center; routing comes back
    // empty and the store scans everything.
    let probe = pattern_with_mean(0.0, 1);
    let matches = store.query(&probe, 50).unwrap();
    assert_eq!(matches.len(), 50);
}

// ---------------------------------------------------------------------------
// Tests: Rollover
// ---------------------------------------------------------------------------

#[test]
fn rollover_produces_multiple_committed_segments() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    let mut config = StoreConfig::default();
    config.segment_max_bytes = 4096;
    config.shard_count = 1;

    let store = ResonanceStore::open_with_config(&root, config).unwrap();
    let patterns: Vec<WavePattern> = (0..50)
        .map(|i| pattern_with_mean(0.5 + i as f64 * 0.001, i))
        .map(|p| {
            // Widen to make records chunky enough to roll quickly.
            WavePattern::new(
                p.amplitude().repeat(8),
                p.phase().repeat(8),
            )
            .unwrap()
        })
        .collect();
    for p in &patterns {
        store.insert(p, None).unwrap();
    }
    store.flush().unwrap();

    let stats = store.stats();
    assert!(stats.segments >= 3, "expected >=3 segments, got {:?}", stats);

    // Every inserted pattern stays queryable.
    for p in &patterns {
        assert_eq!(store.query(p, 1).unwrap()[0].id, p.content_id());
    }

    // Every segment on disk reopens cleanly: commit flag set, checksum
    // valid.
    let segments_dir = root.join("segments");
    let mut seen = 0;
    for entry in std::fs::read_dir(&segments_dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().map(|e| e == "segment").unwrap_or(false) {
            resonancedb::storage::SegmentReader::open(&path).unwrap();
            seen += 1;
        }
    }
    assert!(seen >= 3);
}

// ---------------------------------------------------------------------------
// Tests: Compaction
// ---------------------------------------------------------------------------

#[test]
fn compaction_merges_survivors_and_deletes_old_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    let mut config = StoreConfig::default();
    config.segment_max_bytes = 4096;
    config.shard_count = 1;

    let store = ResonanceStore::open_with_config(&root, config).unwrap();

    let patterns: Vec<WavePattern> = (0..200)
        .map(|i| pattern_with_mean(0.3 + (i % 50) as f64 * 0.01, i))
        .collect();
    let ids: Vec<String> = patterns
        .iter()
        .map(|p| store.insert(p, None).unwrap())
        .collect();

    // Keep every fifth pattern; drop the rest.
    let survivors: Vec<usize> = (0..200).step_by(5).collect();
    let scores: HashMap<usize, f32> = survivors
        .iter()
        .map(|&i| (i, store.query(&patterns[i], 1).unwrap()[0].energy))
        .collect();

    for i in 0..200 {
        if i % 5 != 0 {
            store.delete(&ids[i]).unwrap();
        }
    }
    store.maybe_compact();
    store.flush().unwrap();

    // (a) survivors queryable with unchanged scores
    for &i in &survivors {
        let matches = store.query(&patterns[i], 1).unwrap();
        assert_eq!(matches[0].id, ids[i]);
        assert_eq!(matches[0].energy, scores[&i]);
    }

    // (b) old segment files deleted; (c) manifest points into the
    // merged segment
    let manifest = Manifest::load(&root.join("index").join("manifest.idx")).unwrap();
    assert_eq!(manifest.len(), survivors.len());
    let mut merged_entries = 0;
    for (_, loc) in manifest.locations() {
        if loc.segment.contains("-merged-") {
            merged_entries += 1;
        }
    }
    assert!(
        merged_entries > 0,
        "expected manifest entries relocated into the merged segment"
    );

    let on_disk: Vec<String> = std::fs::read_dir(root.join("segments"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().map(|e| e == "segment").unwrap_or(false))
        .map(|p| p.file_stem().unwrap().to_string_lossy().into_owned())
        .collect();
    assert!(
        on_disk.len() <= 2,
        "old segments must be deleted, found {:?}",
        on_disk
    );

    // (d) queries resolve through the merged view
    let stats = store.stats();
    assert!(stats.segments <= 2);
}

#[test]
fn compacted_store_reopens_cleanly() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    let mut config = StoreConfig::default();
    config.segment_max_bytes = 4096;
    config.shard_count = 1;

    let (survivor_patterns, survivor_ids) = {
        let store = ResonanceStore::open_with_config(&root, config.clone()).unwrap();
        let patterns: Vec<WavePattern> = (0..100)
            .map(|i| pattern_with_mean(0.4 + (i % 40) as f64 * 0.01, i))
            .collect();
        let ids: Vec<String> = patterns
            .iter()
            .map(|p| store.insert(p, None).unwrap())
            .collect();
        for i in 0..100 {
            if i % 4 != 0 {
                store.delete(&ids[i]).unwrap();
            }
        }
        store.maybe_compact();
        let survivors: Vec<WavePattern> = (0..100)
            .step_by(4)
            .map(|i| patterns[i].clone())
            .collect();
        let survivor_ids: Vec<String> =
            (0..100).step_by(4).map(|i| ids[i].clone()).collect();
        store.close().unwrap();
        (survivors, survivor_ids)
    };

    let store = ResonanceStore::open_with_config(&root, config).unwrap();
    assert_eq!(store.len(), survivor_ids.len());
    for (p, id) in survivor_patterns.iter().zip(&survivor_ids) {
        assert_eq!(&store.query(p, 1).unwrap()[0].id, id);
    }
}
