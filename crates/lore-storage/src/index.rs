//! In-memory approximate nearest-neighbour index (IVF).
//!
//! Small collections are scanned exhaustively. Once the collection reaches
//! `ivf_min_vectors`, vectors are partitioned with k-means into inverted
//! lists and a query scans only the `ivf_probes` lists whose centroids are
//! closest. `ivf_probes` is the recall/speed knob: scanning every list is
//! exact, scanning one is fastest.
//!
//! Training never runs inside an insert. Callers ask for it with
//! [`VectorIndex::retrain`] (or its background form) and k-means runs over a
//! copy of the vectors, so searches keep using the previous lists until the
//! new ones are swapped in.
//!
//! Vectors are stored unit-normalized so cosine similarity is a dot product.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lore_core::config::StorageConfig;
use lore_core::error::{LoreError, Result};

/// Seed for k-means initialization, fixed so rebuilds are reproducible.
const KMEANS_SEED: u64 = 0x5eed_1ea7;

/// Filterable attributes carried next to each vector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VectorMeta {
    /// Owning character (facts) or source character (relations).
    pub owner: Option<Uuid>,
    /// Normalized label: fact type key or relation type.
    pub label: String,
}

/// A single hit returned from a vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: Uuid,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
}

/// Which search strategy the index currently uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexMode {
    BruteForce,
    Ivf { lists: usize },
}

impl IndexMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMode::BruteForce => "brute_force",
            IndexMode::Ivf { .. } => "ivf",
        }
    }
}

/// Tuning knobs, taken from [`StorageConfig`].
#[derive(Debug, Clone)]
pub struct IvfParams {
    pub min_vectors: usize,
    pub lists: usize,
    pub probes: usize,
    pub train_iterations: usize,
}

impl From<&StorageConfig> for IvfParams {
    fn from(config: &StorageConfig) -> Self {
        Self {
            min_vectors: config.ivf_min_vectors,
            lists: config.ivf_lists,
            probes: config.ivf_probes.max(1),
            train_iterations: config.ivf_train_iterations.max(1),
        }
    }
}

#[derive(Debug, Clone)]
struct VectorEntry {
    vector: Vec<f32>,
    meta: VectorMeta,
    list: Option<usize>,
    /// Bumped on every overwrite so training can tell stale snapshots apart.
    revision: u64,
}

#[derive(Debug, Default)]
struct IvfState {
    entries: HashMap<Uuid, VectorEntry>,
    centroids: Vec<Vec<f32>>,
    lists: Vec<Vec<Uuid>>,
    trained_size: usize,
    next_revision: u64,
    /// Highest write version applied per id, deletes included.
    versions: HashMap<Uuid, u64>,
}

impl IvfState {
    fn training_due(&self, params: &IvfParams) -> bool {
        let len = self.entries.len();
        len >= params.min_vectors
            && (self.centroids.is_empty() || len >= self.trained_size.saturating_mul(2))
    }

    /// Record `version` for `id`, or report that a newer write already landed.
    fn accept(&mut self, id: Uuid, version: Option<u64>) -> bool {
        let Some(version) = version else {
            return true;
        };
        if let Some(applied) = self.versions.get(&id).copied() {
            if applied >= version {
                debug!(%id, version, applied, "Skipping stale index update");
                return false;
            }
        }
        self.versions.insert(id, version);
        true
    }
}

/// Vectors copied out of the index for training without holding its lock.
struct TrainingSnapshot {
    ids: Vec<Uuid>,
    revisions: Vec<u64>,
    vectors: Vec<Vec<f32>>,
}

/// Result of k-means over a snapshot, ready to install.
struct TrainedLists {
    centroids: Vec<Vec<f32>>,
    assigned: HashMap<Uuid, (u64, usize)>,
    trained_size: usize,
}

/// Thread-safe IVF vector index of fixed dimension.
///
/// Inserts and deletes take the write lock only for the mutation itself.
/// Training is separate: [`VectorIndex::retrain`] clusters a snapshot while
/// searches and writes continue, then installs the new lists in one short
/// write.
#[derive(Debug, Clone)]
pub struct VectorIndex {
    dimension: usize,
    params: IvfParams,
    state: Arc<RwLock<IvfState>>,
    training: Arc<AtomicBool>,
}

impl VectorIndex {
    pub fn new(dimension: usize, params: IvfParams) -> Self {
        Self {
            dimension,
            params,
            state: Arc::new(RwLock::new(IvfState::default())),
            training: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or replace a vector.
    ///
    /// Rejects vectors whose length differs from the index dimension.
    pub fn insert(&self, id: Uuid, vector: &[f32], meta: VectorMeta) -> Result<()> {
        self.put(id, vector, meta, None)
    }

    /// Insert or replace a vector written at `version`.
    ///
    /// Ignored when a write with an equal or higher version already reached
    /// this id, so updates applied out of commit order cannot resurrect an
    /// older vector.
    pub fn insert_versioned(
        &self,
        id: Uuid,
        vector: &[f32],
        meta: VectorMeta,
        version: u64,
    ) -> Result<()> {
        self.put(id, vector, meta, Some(version))
    }

    fn put(&self, id: Uuid, vector: &[f32], meta: VectorMeta, version: Option<u64>) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(LoreError::DimensionMismatch {
                entity: id.to_string(),
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let unit = normalized(vector);

        let mut state = self.write()?;
        if !state.accept(id, version) {
            return Ok(());
        }
        remove_from_list(&mut state, id);
        let list = if state.centroids.is_empty() {
            None
        } else {
            let l = nearest_centroid(&state.centroids, &unit);
            state.lists[l].push(id);
            Some(l)
        };
        state.next_revision += 1;
        let revision = state.next_revision;
        state.entries.insert(
            id,
            VectorEntry {
                vector: unit,
                meta,
                list,
                revision,
            },
        );
        Ok(())
    }

    /// Remove a vector. Returns Ok(()) regardless of whether it existed.
    pub fn delete(&self, id: Uuid) -> Result<()> {
        self.remove(id, None)
    }

    /// Remove a vector deleted at `version`; the same ordering rule as
    /// [`VectorIndex::insert_versioned`] applies.
    pub fn delete_versioned(&self, id: Uuid, version: u64) -> Result<()> {
        self.remove(id, Some(version))
    }

    fn remove(&self, id: Uuid, version: Option<u64>) -> Result<()> {
        let mut state = self.write()?;
        if !state.accept(id, version) {
            return Ok(());
        }
        remove_from_list(&mut state, id);
        state.entries.remove(&id);

        if !state.centroids.is_empty() && state.entries.len() < self.params.min_vectors / 2 {
            debug!(len = state.entries.len(), "Index shrank, reverting to brute force");
            state.centroids.clear();
            state.lists.clear();
            state.trained_size = 0;
            for entry in state.entries.values_mut() {
                entry.list = None;
            }
        }
        Ok(())
    }

    /// Remove every vector.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.write()?;
        *state = IvfState::default();
        Ok(())
    }

    /// The `k` most similar vectors whose metadata passes `filter`.
    ///
    /// Ordered by descending similarity, then ascending id. In IVF mode the
    /// probe count widens until `k` admissible hits are found or every list
    /// has been scanned.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &dyn Fn(&VectorMeta) -> bool,
    ) -> Result<Vec<IndexHit>> {
        if query.len() != self.dimension {
            return Err(LoreError::DimensionMismatch {
                entity: "query".to_string(),
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let unit = normalized(query);
        let state = self.read()?;

        let mut hits: Vec<IndexHit> = if state.centroids.is_empty() {
            state
                .entries
                .iter()
                .filter(|(_, e)| filter(&e.meta))
                .map(|(id, e)| IndexHit {
                    id: *id,
                    similarity: dot(&unit, &e.vector),
                })
                .collect()
        } else {
            let mut ranked: Vec<(usize, f64)> = state
                .centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, dot(&unit, c)))
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));

            let mut probes = self.params.probes.min(ranked.len());
            let mut scanned = 0;
            let mut found = Vec::new();
            loop {
                for (list, _) in &ranked[scanned..probes] {
                    for id in &state.lists[*list] {
                        if let Some(e) = state.entries.get(id) {
                            if filter(&e.meta) {
                                found.push(IndexHit {
                                    id: *id,
                                    similarity: dot(&unit, &e.vector),
                                });
                            }
                        }
                    }
                }
                scanned = probes;
                if found.len() >= k || probes == ranked.len() {
                    break;
                }
                probes = (probes * 2).min(ranked.len());
            }
            found
        };

        hits.sort_by(compare_hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Stored (normalized) vector for `id`.
    pub fn get(&self, id: Uuid) -> Option<Vec<f32>> {
        self.read().ok()?.entries.get(&id).map(|e| e.vector.clone())
    }

    pub fn len(&self) -> usize {
        self.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mode(&self) -> IndexMode {
        match self.read() {
            Ok(s) if !s.centroids.is_empty() => IndexMode::Ivf {
                lists: s.centroids.len(),
            },
            _ => IndexMode::BruteForce,
        }
    }

    /// Whether the collection has grown enough to (re)partition.
    pub fn needs_training(&self) -> bool {
        self.read()
            .map(|s| s.training_due(&self.params))
            .unwrap_or(false)
    }

    /// Partition the current vectors with k-means if training is due.
    ///
    /// Returns `Ok(false)` when training was not due or another thread is
    /// already training. CPU heavy; async callers should use
    /// [`VectorIndex::retrain_in_background`].
    pub fn retrain(&self) -> Result<bool> {
        if self.training.swap(true, AtomicOrdering::AcqRel) {
            return Ok(false);
        }
        let _training = TrainingFlag(&self.training);

        let Some(snapshot) = self.snapshot()? else {
            return Ok(false);
        };
        let trained = train_lists(snapshot, &self.params, self.dimension);
        self.install(trained)
    }

    /// Schedule [`VectorIndex::retrain`] on the blocking pool when due.
    ///
    /// Trains inline when called outside a Tokio runtime.
    pub fn retrain_in_background(&self) {
        if !self.needs_training() || self.training.load(AtomicOrdering::Acquire) {
            return;
        }
        let index = self.clone();
        let run = move || {
            if let Err(e) = index.retrain() {
                warn!(error = %e, "IVF training failed");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let _ = handle.spawn_blocking(run);
            }
            Err(_) => run(),
        }
    }

    fn snapshot(&self) -> Result<Option<TrainingSnapshot>> {
        let state = self.read()?;
        if !state.training_due(&self.params) {
            return Ok(None);
        }
        let mut ids: Vec<Uuid> = state.entries.keys().copied().collect();
        ids.sort();
        let mut revisions = Vec::with_capacity(ids.len());
        let mut vectors = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(e) = state.entries.get(id) {
                revisions.push(e.revision);
                vectors.push(e.vector.clone());
            }
        }
        Ok(Some(TrainingSnapshot {
            ids,
            revisions,
            vectors,
        }))
    }

    /// Swap in trained lists. Entries written since the snapshot are placed
    /// by their nearest new centroid.
    fn install(&self, trained: TrainedLists) -> Result<bool> {
        let mut state = self.write()?;
        if state.entries.len() < self.params.min_vectors || trained.centroids.is_empty() {
            debug!(len = state.entries.len(), "Index shrank during training, discarding");
            return Ok(false);
        }

        let mut lists = vec![Vec::new(); trained.centroids.len()];
        let mut reassigned = 0usize;
        for (id, entry) in state.entries.iter_mut() {
            let list = match trained.assigned.get(id) {
                Some((revision, list)) if *revision == entry.revision => *list,
                _ => {
                    reassigned += 1;
                    nearest_centroid(&trained.centroids, &entry.vector)
                }
            };
            lists[list].push(*id);
            entry.list = Some(list);
        }

        info!(
            vectors = trained.trained_size,
            lists = trained.centroids.len(),
            written_during_training = reassigned,
            "Trained IVF index"
        );
        state.centroids = trained.centroids;
        state.lists = lists;
        state.trained_size = trained.trained_size;
        Ok(true)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, IvfState>> {
        self.state
            .read()
            .map_err(|e| LoreError::Storage(format!("Index lock poisoned: {}", e)))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, IvfState>> {
        self.state
            .write()
            .map_err(|e| LoreError::Storage(format!("Index lock poisoned: {}", e)))
    }
}

struct TrainingFlag<'a>(&'a AtomicBool);

impl Drop for TrainingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, AtomicOrdering::Release);
    }
}

/// K-means over a snapshot. Runs without touching the index.
fn train_lists(snapshot: TrainingSnapshot, params: &IvfParams, dimension: usize) -> TrainedLists {
    let TrainingSnapshot {
        ids,
        revisions,
        vectors,
    } = snapshot;
    let n = vectors.len();
    let k = if params.lists > 0 {
        params.lists
    } else {
        (n as f64).sqrt().round() as usize
    }
    .clamp(1, n.max(1));

    let mut rng = StdRng::seed_from_u64(KMEANS_SEED);
    let mut seeds: Vec<usize> = (0..n).collect();
    seeds.shuffle(&mut rng);

    let mut centroids: Vec<Vec<f32>> = seeds.iter().take(k).map(|i| vectors[*i].clone()).collect();
    let mut assignment = vec![0usize; n];

    for _ in 0..params.train_iterations {
        let mut changed = false;
        for (i, v) in vectors.iter().enumerate() {
            let c = nearest_centroid(&centroids, v);
            if c != assignment[i] {
                assignment[i] = c;
                changed = true;
            }
        }

        let mut sums = vec![vec![0f32; dimension]; centroids.len()];
        let mut counts = vec![0usize; centroids.len()];
        for (i, v) in vectors.iter().enumerate() {
            let c = assignment[i];
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v) {
                *s += *x;
            }
        }
        for (c, sum) in sums.into_iter().enumerate() {
            // An empty cluster keeps its previous centroid.
            if counts[c] > 0 {
                centroids[c] = normalized(&sum);
            }
        }
        if !changed {
            break;
        }
    }

    let assigned = ids
        .into_iter()
        .zip(revisions)
        .zip(&vectors)
        .map(|((id, revision), v)| (id, (revision, nearest_centroid(&centroids, v))))
        .collect();

    TrainedLists {
        centroids,
        assigned,
        trained_size: n,
    }
}

fn remove_from_list(state: &mut IvfState, id: Uuid) {
    if let Some(list) = state.entries.get(&id).and_then(|e| e.list) {
        if let Some(members) = state.lists.get_mut(list) {
            members.retain(|m| *m != id);
        }
    }
}

fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.similarity
        .partial_cmp(&a.similarity)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.id.cmp(&b.id))
}

fn nearest_centroid(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_sim = f64::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let sim = dot(c, v);
        if sim > best_sim {
            best = i;
            best_sim = sim;
        }
    }
    best
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (*x as f64) * (*y as f64))
        .sum()
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let mag = v.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if mag == 0.0 {
        return v.to_vec();
    }
    v.iter().map(|x| (*x as f64 / mag) as f32).collect()
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mag_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    (dot(a, b) / (mag_a * mag_b)).clamp(-1.0, 1.0)
}
