//! Store facade — orchestration of segments, manifest, router, cache,
//! kernel, and the flush worker.
//!
//! Locking discipline: the global lock is taken in read mode by every
//! ordinary operation (inserts and queries further serialize through
//! group and writer locks) and in write mode only by compaction and
//! shutdown. Queries never block behind each other.
//!
//! Visibility: a successful insert publishes a fresh reader version for
//! its segment, so the same thread sees the record in its next query;
//! other threads see it once the flush dispatcher republishes.
//! Tombstones are visible immediately — reader and writer map the same
//! file, so the flag flip lands in every open view.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::{PersistedConfig, StoreConfig};
use crate::error::{Result, StoreError};
use crate::kernel::{zone_score, CompareOptions, ResonanceKernel, ScalarKernel, Zone};
use crate::pattern::{PhaseRange, WavePattern};
use crate::resource::default_reader_cache_budget;
use crate::storage::compaction::{maybe_compact_group, CompactionResult};
use crate::storage::flush::FlushDispatcher;
use crate::storage::group::{segment_path, split_segment_name, PhaseSegmentGroup};
use crate::storage::header::ChecksumKind;
use crate::storage::manifest::Manifest;
use crate::storage::metadata::{MetadataMap, MetadataStore};
use crate::storage::reader::StoredPattern;
use crate::storage::reader_cache::ReaderCache;
use crate::storage::router::PhaseRouter;
use crate::storage::writer::SegmentWriter;

// ── Result types ───────────────────────────────────────────────────

/// A query hit.
#[derive(Debug, Clone)]
pub struct ResonanceMatch {
    pub id: String,
    pub energy: f32,
    pub pattern: WavePattern,
}

/// A query hit with interference detail.
#[derive(Debug, Clone)]
pub struct ResonanceMatchDetailed {
    pub id: String,
    pub energy: f32,
    pub pattern: WavePattern,
    pub phase_delta: f64,
    pub zone: Zone,
    pub zone_score: f32,
}

/// Detail row without the pattern payload.
#[derive(Debug, Clone)]
pub struct InterferenceEntry {
    pub id: String,
    pub energy: f32,
    pub phase_delta: f64,
    pub zone: Zone,
    pub zone_score: f32,
}

/// A query pattern with its detailed matches.
#[derive(Debug, Clone)]
pub struct InterferenceMap {
    pub query: WavePattern,
    pub entries: Vec<ResonanceMatchDetailed>,
}

/// Store-level counters.
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub patterns: usize,
    pub segments: usize,
    pub groups: usize,
    pub bytes: u64,
}

// ── ResonanceStore ─────────────────────────────────────────────────

pub struct ResonanceStore {
    root: PathBuf,
    config: StoreConfig,
    checksum_kind: ChecksumKind,
    kernel: Arc<dyn ResonanceKernel>,
    manifest: Arc<Manifest>,
    metadata: Arc<MetadataStore>,
    router: PhaseRouter,
    groups: HashMap<String, Arc<PhaseSegmentGroup>>,
    cache: Arc<ReaderCache>,
    dispatcher: FlushDispatcher,
    lock: RwLock<()>,
    closed: AtomicBool,
}

impl ResonanceStore {
    /// Open (or create) a store rooted at `root` with defaults.
    pub fn open(root: &Path) -> Result<Self> {
        Self::open_with_config(root, StoreConfig::default())
    }

    /// Open (or create) a store with an explicit configuration. The
    /// scalar kernel is injected by default; `open_with_kernel`
    /// substitutes another back-end.
    pub fn open_with_config(root: &Path, config: StoreConfig) -> Result<Self> {
        let kernel = Arc::new(ScalarKernel::new(config.batch_size));
        Self::open_with_kernel(root, config, kernel)
    }

    pub fn open_with_kernel(
        root: &Path,
        mut config: StoreConfig,
        kernel: Arc<dyn ResonanceKernel>,
    ) -> Result<Self> {
        std::fs::create_dir_all(root.join("segments"))?;
        std::fs::create_dir_all(root.join("index"))?;
        std::fs::create_dir_all(root.join("metadata"))?;

        // Deployment-stable settings live with the data.
        match PersistedConfig::read_from(root)? {
            Some(persisted) => persisted.apply_to(&mut config),
            None => PersistedConfig::from_config(&config).write_to(root)?,
        }
        let checksum_kind = config.checksum_kind()?;

        let manifest = Arc::new(Manifest::load(&root.join("index").join("manifest.idx"))?);
        let metadata = Arc::new(MetadataStore::load(
            &root.join("metadata").join("pattern-meta.json"),
        )?);

        let segments_dir = root.join("segments");
        let healthy = recovery_sweep(&segments_dir, &manifest);

        let router = build_router(&config, &manifest);
        let groups = build_groups(
            &segments_dir,
            &router,
            &healthy,
            checksum_kind,
            config.segment_max_bytes,
        )?;

        let cache_budget = config
            .reader_cache_max_bytes
            .unwrap_or_else(default_reader_cache_budget);
        let cache = Arc::new(ReaderCache::new(cache_budget));
        let dispatcher =
            FlushDispatcher::start(&cache, Duration::from_millis(config.flush_interval_ms));
        for group in groups.values() {
            for writer in group.writers() {
                dispatcher.register(&writer);
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            config,
            checksum_kind,
            kernel,
            manifest,
            metadata,
            router,
            groups,
            cache,
            dispatcher,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
        })
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Insert a pattern with optional metadata. Returns its content ID.
    pub fn insert(&self, pattern: &WavePattern, meta: Option<MetadataMap>) -> Result<String> {
        let id = {
            let _guard = self.lock.read().unwrap();
            self.insert_inner(pattern, meta)?
        };
        self.maybe_compact();
        Ok(id)
    }

    fn insert_inner(&self, pattern: &WavePattern, meta: Option<MetadataMap>) -> Result<String> {
        let id = pattern.content_id();
        if self.manifest.contains(&id) {
            return Err(StoreError::DuplicatePattern(id));
        }

        let group = self.group_for(pattern);
        let mut writer = group.get_writable()?;
        if writer.will_overflow(pattern) {
            writer = group.create_and_register_new_segment()?;
        }
        self.dispatcher.register(&writer);

        let offset = writer.write(&id, pattern)?;

        // Everything past the append rolls back through one path.
        if let Err(e) = self
            .manifest
            .try_add(&id, writer.name(), offset, pattern.mean_phase())
        {
            self.rollback_insert(&writer, offset, &id, false, false);
            return Err(e);
        }
        group.record_phase(pattern);

        self.metadata.put(&id, meta.unwrap_or_default());
        if let Err(e) = self.metadata.flush() {
            self.rollback_insert(&writer, offset, &id, true, true);
            return Err(e);
        }

        // Same-thread read-your-write: bump the reader version now.
        if let Err(e) = self
            .cache
            .publish(writer.name(), writer.version(), writer.path())
        {
            tracing::warn!("publishing reader for {} failed: {}", writer.name(), e);
        }
        Ok(id)
    }

    /// Best-effort undo of a partially applied insert. The manifest
    /// must never keep an entry for the tombstoned offset.
    fn rollback_insert(
        &self,
        writer: &Arc<SegmentWriter>,
        offset: u64,
        id: &str,
        manifest_added: bool,
        metadata_added: bool,
    ) {
        if manifest_added {
            if let Err(e) = self.manifest.remove(id) {
                tracing::warn!("insert rollback: manifest remove of {} failed: {}", id, e);
            }
        }
        if metadata_added {
            self.metadata.remove(id);
            if let Err(e) = self.metadata.flush() {
                tracing::warn!("insert rollback: metadata flush failed: {}", e);
            }
        }
        if let Err(e) = writer.mark_deleted(offset) {
            tracing::warn!("insert rollback: tombstone at {} failed: {}", offset, e);
        }
    }

    /// Delete a pattern by ID.
    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let _guard = self.lock.read().unwrap();
            self.delete_inner(id)?;
        }
        self.maybe_compact();
        Ok(())
    }

    fn delete_inner(&self, id: &str) -> Result<()> {
        let loc = self
            .manifest
            .get(id)
            .ok_or_else(|| StoreError::PatternNotFound(id.to_string()))?;
        let writer = self.writer_named(&loc.segment).ok_or_else(|| {
            StoreError::PatternNotFound(format!("{} (segment {} is gone)", id, loc.segment))
        })?;

        writer.mark_deleted(loc.offset)?;
        if let Err(e) = self.manifest.remove(id) {
            // Lost a race with another delete; revive the record.
            let _ = writer.unmark_deleted(loc.offset);
            return Err(e);
        }
        self.metadata.remove(id);
        if let Err(e) = self.metadata.flush() {
            tracing::warn!("metadata flush after delete of {} failed: {}", id, e);
        }
        Ok(())
    }

    /// Replace a pattern: insert the new content under its own ID and
    /// tombstone the old record. Rolls back to the pre-call state on
    /// any failure.
    pub fn replace(
        &self,
        id: &str,
        pattern: &WavePattern,
        meta: Option<MetadataMap>,
    ) -> Result<String> {
        let new_id = {
            let _guard = self.lock.read().unwrap();
            self.replace_inner(id, pattern, meta)?
        };
        self.maybe_compact();
        Ok(new_id)
    }

    fn replace_inner(
        &self,
        old_id: &str,
        pattern: &WavePattern,
        meta: Option<MetadataMap>,
    ) -> Result<String> {
        let old_loc = self
            .manifest
            .get(old_id)
            .ok_or_else(|| StoreError::PatternNotFound(old_id.to_string()))?;
        let old_writer = self.writer_named(&old_loc.segment).ok_or_else(|| {
            StoreError::PatternNotFound(format!(
                "{} (segment {} is gone)",
                old_id, old_loc.segment
            ))
        })?;

        let new_id = pattern.content_id();
        if self.manifest.contains(&new_id) {
            // Covers both replace-with-identical-content and collision
            // with an unrelated live pattern.
            return Err(StoreError::DuplicatePattern(new_id));
        }

        // Append the new content first; nothing observable changes
        // until the manifest swap.
        let group = self.group_for(pattern);
        let mut writer = group.get_writable()?;
        if writer.will_overflow(pattern) {
            writer = group.create_and_register_new_segment()?;
        }
        self.dispatcher.register(&writer);
        let new_offset = writer.write(&new_id, pattern)?;

        if let Err(e) = old_writer.mark_deleted(old_loc.offset) {
            let _ = writer.mark_deleted(new_offset);
            return Err(e);
        }

        if let Err(e) = self.manifest.replace_id(
            old_id,
            &new_id,
            writer.name(),
            new_offset,
            pattern.mean_phase(),
        ) {
            let _ = old_writer.unmark_deleted(old_loc.offset);
            let _ = writer.mark_deleted(new_offset);
            return Err(e);
        }
        group.record_phase(pattern);

        self.metadata.rename(old_id, &new_id);
        if let Some(meta) = meta {
            self.metadata.put(&new_id, meta);
        }
        if let Err(e) = self.metadata.flush() {
            tracing::warn!("metadata flush after replace of {} failed: {}", old_id, e);
        }

        if let Err(e) = self
            .cache
            .publish(writer.name(), writer.version(), writer.path())
        {
            tracing::warn!("publishing reader for {} failed: {}", writer.name(), e);
        }
        Ok(new_id)
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Resonance energy of two patterns (kernel pass-through).
    pub fn compare(&self, a: &WavePattern, b: &WavePattern) -> f32 {
        self.kernel.compare(a, b, &CompareOptions::default())
    }

    /// Top-k matches by resonance energy, descending; ties break on ID
    /// so results are deterministic.
    pub fn query(&self, pattern: &WavePattern, k: usize) -> Result<Vec<ResonanceMatch>> {
        let _guard = self.lock.read().unwrap();
        let candidates = self.gather_candidates(pattern)?;
        let patterns: Vec<WavePattern> =
            candidates.iter().map(|c| c.pattern.clone()).collect();
        let scores =
            self.kernel
                .compare_many(pattern, &patterns, &CompareOptions::default());

        let top = top_k(
            candidates.iter().zip(scores.iter()).map(|(c, &energy)| Scored {
                energy,
                candidate: c,
            }),
            k,
        );
        Ok(top
            .into_iter()
            .map(|s| ResonanceMatch {
                id: s.candidate.id.clone(),
                energy: s.energy,
                pattern: s.candidate.pattern.clone(),
            })
            .collect())
    }

    /// Top-k matches with phase-delta detail and zone classification.
    pub fn query_detailed(
        &self,
        pattern: &WavePattern,
        k: usize,
    ) -> Result<Vec<ResonanceMatchDetailed>> {
        let _guard = self.lock.read().unwrap();
        let candidates = self.gather_candidates(pattern)?;
        let opts = CompareOptions::default();

        let scored: Vec<(f32, &StoredPattern, f32, f64)> = candidates
            .iter()
            .map(|c| {
                let energy = self.kernel.compare(pattern, &c.pattern, &opts);
                let (raw, delta) =
                    self.kernel.compare_with_phase_delta(pattern, &c.pattern, &opts);
                (energy, c, raw, delta)
            })
            .collect();

        let top = top_k(
            scored.iter().map(|(energy, c, raw, delta)| Scored {
                energy: *energy,
                candidate: DetailSeed {
                    stored: *c,
                    raw: *raw,
                    delta: *delta,
                },
            }),
            k,
        );
        Ok(top
            .into_iter()
            .map(|s| {
                let seed = s.candidate;
                ResonanceMatchDetailed {
                    id: seed.stored.id.clone(),
                    energy: s.energy,
                    pattern: seed.stored.pattern.clone(),
                    phase_delta: seed.delta,
                    zone: Zone::classify(seed.raw, seed.delta),
                    zone_score: zone_score(s.energy, seed.delta),
                }
            })
            .collect())
    }

    /// The query pattern together with its detailed matches.
    pub fn query_interference(
        &self,
        pattern: &WavePattern,
        k: usize,
    ) -> Result<InterferenceMap> {
        Ok(InterferenceMap {
            query: pattern.clone(),
            entries: self.query_detailed(pattern, k)?,
        })
    }

    /// Flat interference rows (no pattern payloads).
    pub fn query_interference_map(
        &self,
        pattern: &WavePattern,
        k: usize,
    ) -> Result<Vec<InterferenceEntry>> {
        Ok(self
            .query_detailed(pattern, k)?
            .into_iter()
            .map(|m| InterferenceEntry {
                id: m.id,
                energy: m.energy,
                phase_delta: m.phase_delta,
                zone: m.zone,
                zone_score: m.zone_score,
            })
            .collect())
    }

    /// Query with a probe synthesized from several patterns by weighted
    /// complex superposition. Uniform weights when `weights` is `None`.
    pub fn query_composite(
        &self,
        patterns: &[WavePattern],
        weights: Option<&[f64]>,
        k: usize,
    ) -> Result<Vec<ResonanceMatch>> {
        let probe = superpose(patterns, weights)?;
        self.query(&probe, k)
    }

    pub fn query_composite_detailed(
        &self,
        patterns: &[WavePattern],
        weights: Option<&[f64]>,
        k: usize,
    ) -> Result<Vec<ResonanceMatchDetailed>> {
        let probe = superpose(patterns, weights)?;
        self.query_detailed(&probe, k)
    }

    // ── Introspection ──────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.manifest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifest.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.manifest.contains(id)
    }

    pub fn metadata(&self, id: &str) -> Option<MetadataMap> {
        self.metadata.get(id)
    }

    /// Effective configuration (deployment-persisted values applied).
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn stats(&self) -> StoreStats {
        let segments = self.groups.values().map(|g| g.writer_count()).sum();
        let bytes = self.groups.values().map(|g| g.approx_size()).sum();
        StoreStats {
            patterns: self.manifest.len(),
            segments,
            groups: self.groups.len(),
            bytes,
        }
    }

    // ── Maintenance ────────────────────────────────────────────────

    /// Run the compaction check over every group, merging the ones
    /// whose trigger fires. Takes the global write lock.
    pub fn maybe_compact(&self) -> Vec<CompactionResult> {
        let needs_work = self.groups.values().any(|g| g.should_compact());
        if !needs_work {
            return Vec::new();
        }

        let _guard = self.lock.write().unwrap();
        let mut results = Vec::new();
        for group in self.groups.values() {
            match maybe_compact_group(
                group,
                &self.manifest,
                &self.cache,
                &self.dispatcher,
                &self.root.join("segments"),
                self.checksum_kind,
            ) {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => tracing::warn!("compaction of group {} failed: {}", group.base(), e),
            }
        }
        results
    }

    /// Flush everything durable: segments, manifest, metadata.
    pub fn flush(&self) -> Result<()> {
        self.dispatcher.flush_now();
        self.manifest.flush()?;
        self.metadata.flush()?;
        Ok(())
    }

    /// Flush and close every segment. The store is unusable afterwards.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.lock.write().unwrap();
        self.dispatcher.flush_now();
        self.manifest.flush()?;
        self.metadata.flush()?;
        for group in self.groups.values() {
            for writer in group.writers() {
                writer.close()?;
            }
        }
        Ok(())
    }

    // ── Internals ──────────────────────────────────────────────────

    fn group_for(&self, pattern: &WavePattern) -> Arc<PhaseSegmentGroup> {
        let shard = self.router.select_shard(pattern);
        match self.groups.get(&shard) {
            Some(group) => Arc::clone(group),
            // The router is advisory; an unknown shard name falls back
            // to the first group rather than failing the insert.
            None => Arc::clone(
                self.groups
                    .values()
                    .next()
                    .expect("store has at least one group"),
            ),
        }
    }

    fn writer_named(&self, segment: &str) -> Option<Arc<SegmentWriter>> {
        let base = split_segment_name(segment).0;
        if let Some(group) = self.groups.get(base) {
            if let Some(writer) = group.writer_named(segment) {
                return Some(writer);
            }
        }
        // Base lookup can miss when routing changed; scan all groups.
        self.groups.values().find_map(|g| g.writer_named(segment))
    }

    /// Collect the live candidate records for a query: the relevant
    /// shards' segments (all of them when routing yields nothing),
    /// filtered through the manifest so only current records score.
    fn gather_candidates(&self, pattern: &WavePattern) -> Result<Vec<StoredPattern>> {
        let shard_names = self.router.relevant_shards(pattern);
        let mut selected: Vec<&Arc<PhaseSegmentGroup>> = shard_names
            .iter()
            .filter_map(|name| self.groups.get(name))
            .collect();
        if selected.is_empty() {
            selected = self.groups.values().collect();
        }

        let mut out = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for group in selected {
            for writer in group.writers() {
                let reader = match self.cache.get_or_open(writer.name(), writer.path()) {
                    Ok(reader) => reader,
                    Err(e) => {
                        tracing::warn!(
                            "skipping unreadable segment {} in query: {}",
                            writer.name(),
                            e
                        );
                        continue;
                    }
                };
                for record in reader.read_all_with_id()? {
                    let Some(loc) = self.manifest.get(&record.id) else {
                        continue;
                    };
                    if loc.segment != writer.name() || loc.offset != record.offset {
                        continue;
                    }
                    if seen.insert(record.id.clone()) {
                        out.push(record);
                    }
                }
            }
        }
        Ok(out)
    }
}

impl Drop for ResonanceStore {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("store shutdown failed: {}", e);
        }
    }
}

// ── Top-k selection ────────────────────────────────────────────────

struct Scored<C> {
    energy: f32,
    candidate: C,
}

struct DetailSeed<'a> {
    stored: &'a StoredPattern,
    raw: f32,
    delta: f64,
}

/// Bounded selection: keep the k best by (energy desc, id asc) using a
/// min-heap of size k, then return them best-first.
fn top_k<C, I>(items: I, k: usize) -> Vec<Scored<C>>
where
    C: HasId,
    I: Iterator<Item = Scored<C>>,
{
    if k == 0 {
        return Vec::new();
    }
    // The heap keeps the *worst* kept item on top: lowest energy, then
    // greatest id.
    let mut heap: BinaryHeap<HeapEntry<C>> = BinaryHeap::with_capacity(k + 1);
    for item in items {
        heap.push(HeapEntry(item));
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut out: Vec<Scored<C>> = heap.into_iter().map(|e| e.0).collect();
    out.sort_by(|a, b| {
        b.energy
            .total_cmp(&a.energy)
            .then_with(|| a.candidate.id().cmp(b.candidate.id()))
    });
    out
}

trait HasId {
    fn id(&self) -> &str;
}

impl HasId for &StoredPattern {
    fn id(&self) -> &str {
        &self.id
    }
}

impl<'a> HasId for DetailSeed<'a> {
    fn id(&self) -> &str {
        &self.stored.id
    }
}

struct HeapEntry<C>(Scored<C>);

impl<C: HasId> PartialEq for HeapEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl<C: HasId> Eq for HeapEntry<C> {}

impl<C: HasId> PartialOrd for HeapEntry<C> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<C: HasId> Ord for HeapEntry<C> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: the entry that should be evicted first compares
        // greatest — lower energy wins, ties broken by greater id.
        other
            .0
            .energy
            .total_cmp(&self.0.energy)
            .then_with(|| self.0.candidate.id().cmp(other.0.candidate.id()))
    }
}

// ── Composite probes ───────────────────────────────────────────────

/// Synthesize a probe by weighted complex superposition:
/// `ψ*[i] = Σ w_j · A_j[i] · e^(i·φ_j[i])`, recovering amplitude and
/// phase from magnitude and argument. Patterns are combined over their
/// common prefix length.
fn superpose(patterns: &[WavePattern], weights: Option<&[f64]>) -> Result<WavePattern> {
    if patterns.is_empty() {
        return Err(StoreError::InvalidPattern(
            "composite query needs at least one pattern".into(),
        ));
    }
    if let Some(w) = weights {
        if w.len() != patterns.len() {
            return Err(StoreError::InvalidPattern(format!(
                "{} weights for {} patterns",
                w.len(),
                patterns.len()
            )));
        }
    }
    let uniform = 1.0 / patterns.len() as f64;
    let len = patterns.iter().map(|p| p.len()).min().unwrap();

    let mut amplitude = Vec::with_capacity(len);
    let mut phase = Vec::with_capacity(len);
    for i in 0..len {
        let mut re = 0.0;
        let mut im = 0.0;
        for (j, p) in patterns.iter().enumerate() {
            let w = weights.map(|w| w[j]).unwrap_or(uniform);
            let a = w * p.amplitude()[i];
            re += a * p.phase()[i].cos();
            im += a * p.phase()[i].sin();
        }
        amplitude.push((re * re + im * im).sqrt());
        phase.push(im.atan2(re));
    }
    WavePattern::new(amplitude, phase)
}

// ── Recovery / bootstrap ───────────────────────────────────────────

/// Walk the manifest's known segments: drop entries whose files are
/// missing, isolate segments that no longer open, and return the
/// healthy names. Unreadable files stay on disk for repair; only the
/// in-memory view forgets them.
fn recovery_sweep(segments_dir: &Path, manifest: &Manifest) -> Vec<String> {
    let mut healthy = Vec::new();
    for name in manifest.known_segments() {
        let path = segment_path(segments_dir, &name);
        if !path.exists() {
            tracing::warn!("segment {} is missing; dropping its manifest entries", name);
            drop_segment_entries(manifest, &name);
            manifest.forget_segment(&name);
            continue;
        }
        match SegmentWriter::open(&path, ChecksumKind::Xx64) {
            Ok(probe) => {
                if let Err(e) = probe.close() {
                    tracing::warn!("closing probe of segment {} failed: {}", name, e);
                }
                healthy.push(name);
            }
            Err(e) => {
                tracing::warn!("segment {} is unreadable ({}); isolating it", name, e);
                drop_segment_entries(manifest, &name);
            }
        }
    }
    healthy
}

fn drop_segment_entries(manifest: &Manifest, segment: &str) {
    for id in manifest.ids_in_segment(segment) {
        let _ = manifest.remove(&id);
    }
}

fn build_router(config: &StoreConfig, manifest: &Manifest) -> PhaseRouter {
    match &config.explicit_centers {
        Some(centers) => {
            let locations = manifest.locations();
            if locations.is_empty() {
                PhaseRouter::explicit(centers.clone(), config.phase_epsilon)
            } else {
                // Observed per-shard phase averages beat the static map.
                PhaseRouter::from_manifest(&locations, config.phase_epsilon)
            }
        }
        None => PhaseRouter::hashed(config.shard_count),
    }
}

/// One group per shard, fed with the healthy segments that belong to
/// it. Segments whose base matches no shard get their own group so
/// their data stays queryable.
fn build_groups(
    segments_dir: &Path,
    router: &PhaseRouter,
    healthy_segments: &[String],
    checksum_kind: ChecksumKind,
    max_bytes: u64,
) -> Result<HashMap<String, Arc<PhaseSegmentGroup>>> {
    let mut by_base: HashMap<String, Vec<String>> = HashMap::new();
    for name in healthy_segments {
        let base = split_segment_name(name).0.to_string();
        by_base.entry(base).or_default().push(name.clone());
    }

    let mut bases: Vec<String> = router.shards();
    for base in by_base.keys() {
        if !bases.contains(base) {
            bases.push(base.clone());
        }
    }
    if bases.is_empty() {
        bases.push("phase-0".to_string());
    }

    let shard_count = bases.len();
    let mut groups = HashMap::with_capacity(shard_count);
    for (i, base) in bases.into_iter().enumerate() {
        let range = shard_phase_range(i, shard_count);
        let existing = by_base.remove(&base).unwrap_or_default();
        let group = PhaseSegmentGroup::open(
            segments_dir,
            &base,
            range,
            checksum_kind,
            max_bytes,
            &existing,
        )?;
        groups.insert(base, Arc::new(group));
    }
    Ok(groups)
}

/// Uniform slice of `[0, π]` for shard `i` of `n`.
fn shard_phase_range(i: usize, n: usize) -> PhaseRange {
    let step = std::f64::consts::PI / n as f64;
    let start = i as f64 * step;
    PhaseRange::new(start, (start + step).min(std::f64::consts::PI))
        .unwrap_or(PhaseRange {
            start: 0.0,
            end: std::f64::consts::PI,
        })
}

// ── Tests ──────────────────────────────────────────────────────────
