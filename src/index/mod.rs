// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-layer nearest-neighbor indices.
//!
//! - [`NeighborIndex`] — the build/query contract both index kinds share.
//! - [`ExactIndex`](exact::ExactIndex) — exhaustive Euclidean scan.
//! - [`LshIndex`](lsh::LshIndex) — random-hyperplane hashing, approximate.
//! - [`LayerIndex`] — one index per designated layer over a frozen
//!   training set.

pub mod exact;
pub mod lsh;

pub use exact::ExactIndex;
pub use lsh::LshIndex;

use crate::config::{IndexKind, LshParams};
use crate::data::ExampleId;
use crate::error::{DkError, Result};
use crate::store::TrainingActivationSet;

// ---------------------------------------------------------------------------
// NeighborIndex trait
// ---------------------------------------------------------------------------

/// Searchable structure over one layer's training activations.
///
/// Implementations return neighbor *identifiers* drawn from the id space
/// of the training set they were built over, ordered by non-decreasing
/// distance.  Exact implementations return the true `k` nearest with
/// distance ties broken by ascending id; approximate implementations may
/// return fewer than `k` and may omit true nearest neighbors — the
/// scorer tolerates both.
pub trait NeighborIndex: Send + Sync {
    /// Number of indexed vectors.
    fn len(&self) -> usize;

    /// Whether the index holds no vectors.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dimensionality of the indexed vectors.
    fn dim(&self) -> usize;

    /// Up to `k` neighbor ids for `vector`, nearest first.
    ///
    /// `vector` must have [`dim`](Self::dim) components; callers validate
    /// before dispatching.
    fn query(&self, vector: &[f32], k: usize) -> Vec<ExampleId>;
}

// ---------------------------------------------------------------------------
// Distance helper
// ---------------------------------------------------------------------------

/// Squared Euclidean distance between two equal-length vectors.
///
/// Squared form preserves ordering and skips the square root.
#[must_use]
pub(crate) fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Sort (distance, id) candidates by non-decreasing distance, ties by
/// ascending id, and keep the first `k` ids.
#[must_use]
pub(crate) fn take_k_nearest(mut candidates: Vec<(f32, ExampleId)>, k: usize) -> Vec<ExampleId> {
    candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    candidates.truncate(k);
    candidates.into_iter().map(|(_, id)| id).collect()
}

// ---------------------------------------------------------------------------
// LayerIndex
// ---------------------------------------------------------------------------

/// One nearest-neighbor index per designated layer.
///
/// Built once over a frozen [`TrainingActivationSet`]; read-only
/// afterwards, so concurrent queries need no locking.  Build-before-query
/// is enforced by construction — [`build`](Self::build) is the only way
/// to obtain a `LayerIndex`.
pub struct LayerIndex {
    /// Per-layer indices, designated-layer order.
    // TRAIT_OBJECT: per-layer index kinds share one query contract
    indices: Vec<Box<dyn NeighborIndex>>,
    /// Neighbors fetched per query; fixed for this instance.
    k: usize,
}

impl std::fmt::Debug for LayerIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerIndex")
            .field("num_layers", &self.indices.len())
            .field("k", &self.k)
            .finish()
    }
}

impl LayerIndex {
    /// Build one index per layer of the training set, each layer using
    /// its own kind.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if `kinds` does not list one kind per
    /// layer and [`DkError::IndexBuild`] if any layer's vectors disagree
    /// on dimensionality.
    pub fn build(
        set: &TrainingActivationSet,
        kinds: &[IndexKind],
        k: usize,
        lsh: &LshParams,
    ) -> Result<Self> {
        if kinds.len() != set.num_layers() {
            return Err(DkError::Config(format!(
                "{} index kinds for {} layers",
                kinds.len(),
                set.num_layers()
            )));
        }
        let mut indices: Vec<Box<dyn NeighborIndex>> = Vec::with_capacity(set.num_layers());
        for (layer, &kind) in kinds.iter().enumerate() {
            let rows = set
                .layer_rows(layer)
                .ok_or_else(|| DkError::IndexBuild(format!("layer {layer} missing")))?;
            let dim = validate_dims(layer, rows)?;
            let index: Box<dyn NeighborIndex> = match kind {
                IndexKind::Exact => Box::new(ExactIndex::build(set.ids(), rows, dim)),
                IndexKind::Lsh => Box::new(LshIndex::build(set.ids(), rows, dim, layer, lsh)),
            };
            indices.push(index);
        }
        Ok(Self { indices, k })
    }

    /// Number of designated layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.indices.len()
    }

    /// Neighbors fetched per query.
    #[must_use]
    pub const fn k(&self) -> usize {
        self.k
    }

    /// Query one layer, returning up to `k` neighbor ids, nearest first.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::EmptyIndex`] for an out-of-range layer or a
    /// layer holding no vectors, and [`DkError::Config`] on query-vector
    /// dimensionality mismatch.
    pub fn query(&self, layer: usize, vector: &[f32]) -> Result<Vec<ExampleId>> {
        let index = self.indices.get(layer).ok_or_else(|| {
            DkError::EmptyIndex(format!(
                "layer {layer} out of range (built {})",
                self.indices.len()
            ))
        })?;
        if index.is_empty() {
            return Err(DkError::EmptyIndex(format!("layer {layer} holds no vectors")));
        }
        if vector.len() != index.dim() {
            return Err(DkError::Config(format!(
                "query vector has {} components, layer {layer} expects {}",
                vector.len(),
                index.dim()
            )));
        }
        Ok(index.query(vector, self.k))
    }

    /// Query every layer for one example's per-layer activation vectors.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if the vector count does not match the
    /// layer count, otherwise propagates [`query`](Self::query) errors.
    pub fn query_all(&self, per_layer: &[Vec<f32>]) -> Result<Vec<Vec<ExampleId>>> {
        if per_layer.len() != self.indices.len() {
            return Err(DkError::Config(format!(
                "{} query vectors for {} layers",
                per_layer.len(),
                self.indices.len()
            )));
        }
        per_layer
            .iter()
            .enumerate()
            .map(|(layer, vector)| self.query(layer, vector))
            .collect()
    }
}

/// Check all rows of one layer agree on dimensionality.
fn validate_dims(layer: usize, rows: &[Vec<f32>]) -> Result<usize> {
    let dim = rows.first().map_or(0, Vec::len);
    for (row_idx, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(DkError::IndexBuild(format!(
                "layer {layer}: row {row_idx} has {} components, expected {dim}",
                row.len()
            )));
        }
    }
    Ok(dim)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
