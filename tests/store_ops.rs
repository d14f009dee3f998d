//! Integration test: store operation contracts.
//!
//! Round-trip identity, duplicate rejection, delete/replace semantics,
//! top-k ordering, reopen fidelity, and manifest/segment agreement.

use std::collections::HashMap;

use resonancedb::storage::{Manifest, SegmentReader};
use resonancedb::{ResonanceStore, StoreError, WavePattern};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn make_pattern(seed: usize) -> WavePattern {
    let amp: Vec<f64> = (0..16)
        .map(|i| 0.05 + ((seed * 7 + i) % 23) as f64 * 0.04)
        .collect();
    let phase: Vec<f64> = (0..16)
        .map(|i| ((seed * 11 + i * 3) % 29) as f64 * 0.1)
        .collect();
    WavePattern::new(amp, phase).unwrap()
}

fn constant(amp: f64, phase: f64, len: usize) -> WavePattern {
    WavePattern::new(vec![amp; len], vec![phase; len]).unwrap()
}

// ---------------------------------------------------------------------------
// Tests: Round-Trip
// ---------------------------------------------------------------------------

#[test]
fn exact_round_trip_scores_unit_energy() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    let amp = vec![0.37454012, 0.9507143, 0.7319939, 0.5986584];
    let phase = vec![0.0, 0.1, 0.2, 0.3];
    let p = WavePattern::new(amp.clone(), phase.clone()).unwrap();

    let id = store.insert(&p, None).unwrap();
    assert_eq!(id, p.content_id());
    assert_eq!(id.len(), 32);

    let matches = store.query(&p, 1).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, id);
    assert_eq!(matches[0].energy, 1.0);
    assert_eq!(matches[0].pattern.amplitude(), amp.as_slice());
    assert_eq!(matches[0].pattern.phase(), phase.as_slice());
}

#[test]
fn duplicate_insert_rejected_without_mutation() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    let p = make_pattern(5);
    store.insert(&p, None).unwrap();

    let before = store.stats();
    let err = store.insert(&p, None).unwrap_err();
    assert!(matches!(err, StoreError::DuplicatePattern(_)));

    let after = store.stats();
    assert_eq!(before.patterns, after.patterns);
    assert_eq!(store.query(&p, 10).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Tests: Delete / Replace
// ---------------------------------------------------------------------------

#[test]
fn delete_hides_pattern_and_double_delete_fails() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    let p = make_pattern(7);
    let id = store.insert(&p, None).unwrap();

    store.delete(&id).unwrap();
    assert!(store
        .query(&p, 10)
        .unwrap()
        .iter()
        .all(|m| m.id != id));

    let err = store.delete(&id).unwrap_err();
    assert!(matches!(err, StoreError::PatternNotFound(_)));
}

#[test]
fn replace_installs_new_identity() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    let old = constant(1.0, 0.30, 16);
    let new = constant(1.0, 0.32, 16);
    let old_id = store.insert(&old, None).unwrap();

    let new_id = store.replace(&old_id, &new, None).unwrap();
    assert_ne!(old_id, new_id);

    let matches = store.query(&new, 1).unwrap();
    assert_eq!(matches[0].id, new_id);
    assert!(matches[0].energy >= 0.95);

    for m in store.query(&old, 10).unwrap() {
        assert_ne!(m.id, old_id, "old id must be absent after replace");
    }
}

// ---------------------------------------------------------------------------
// Tests: Ordering
// ---------------------------------------------------------------------------

#[test]
fn top_k_is_bounded_and_non_increasing() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    for i in 0..30 {
        store.insert(&constant(1.0, 0.03 * i as f64, 8), None).unwrap();
    }

    let q = constant(1.0, 0.0, 8);
    for k in [1, 5, 10, 30, 100] {
        let matches = store.query(&q, k).unwrap();
        assert!(matches.len() <= k);
        for w in matches.windows(2) {
            assert!(w[0].energy >= w[1].energy, "non-increasing energies");
        }
    }
}

#[test]
fn query_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let store = ResonanceStore::open(&dir.path().join("db")).unwrap();
    for i in 0..25 {
        store.insert(&make_pattern(i), None).unwrap();
    }

    let q = make_pattern(3);
    let a = store.query(&q, 10).unwrap();
    let b = store.query(&q, 10).unwrap();
    let ids_a: Vec<&str> = a.iter().map(|m| m.id.as_str()).collect();
    let ids_b: Vec<&str> = b.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids_a, ids_b);
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.energy, y.energy);
    }
}

// ---------------------------------------------------------------------------
// Tests: Reopen / Agreement
// ---------------------------------------------------------------------------

#[test]
fn reopen_reconstructs_full_index() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    let patterns: Vec<WavePattern> = (0..25).map(make_pattern).collect();

    {
        let store = ResonanceStore::open(&root).unwrap();
        for p in &patterns {
            store.insert(p, None).unwrap();
        }
        store.close().unwrap();
    }

    let store = ResonanceStore::open(&root).unwrap();
    assert_eq!(store.len(), patterns.len());
    for p in &patterns {
        let matches = store.query(p, 1).unwrap();
        assert_eq!(matches[0].id, p.content_id());
        assert_eq!(matches[0].pattern.amplitude(), p.amplitude());
        assert_eq!(matches[0].pattern.phase(), p.phase());
    }
}

#[test]
fn manifest_entries_agree_with_segments() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    {
        let store = ResonanceStore::open(&root).unwrap();
        for i in 0..20 {
            store.insert(&make_pattern(i), None).unwrap();
        }
        store.close().unwrap();
    }

    // Inspect the on-disk state directly: every manifest entry must
    // point at a live record whose content hashes back to its id.
    let manifest = Manifest::load(&root.join("index").join("manifest.idx")).unwrap();
    assert_eq!(manifest.len(), 20);

    let mut readers: HashMap<String, SegmentReader> = HashMap::new();
    for (id, loc) in manifest.locations() {
        let reader = readers.entry(loc.segment.clone()).or_insert_with(|| {
            let path = root
                .join("segments")
                .join(format!("{}.segment", loc.segment));
            SegmentReader::open(&path).unwrap()
        });
        let stored = reader.read_with_id(loc.offset).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.pattern.content_id(), id);
    }
}

// ---------------------------------------------------------------------------
// Tests: Metadata
// ---------------------------------------------------------------------------

#[test]
fn metadata_round_trips_through_reopen() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("db");
    let p = make_pattern(9);
    let id = {
        let store = ResonanceStore::open(&root).unwrap();
        let mut meta = HashMap::new();
        meta.insert("source".to_string(), "sensor-4".to_string());
        meta.insert("window".to_string(), "2048".to_string());
        let id = store.insert(&p, Some(meta)).unwrap();
        store.close().unwrap();
        id
    };

    let store = ResonanceStore::open(&root).unwrap();
    let meta = store.metadata(&id).unwrap();
    assert_eq!(meta["source"], "sensor-4");
    assert_eq!(meta["window"], "2048");
}
