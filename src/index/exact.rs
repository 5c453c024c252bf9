// SPDX-License-Identifier: MIT OR Apache-2.0

//! Exact nearest-neighbor index: exhaustive Euclidean scan.
//!
//! Exact by construction — every query compares against every stored
//! vector.  For `k` at or below the training-set size a query returns
//! exactly `k` ids, sorted by non-decreasing distance with ties broken by
//! ascending identifier.

use crate::data::ExampleId;
use crate::error::Result;
use crate::index::{squared_distance, take_k_nearest, NeighborIndex};

/// Exhaustive-scan index over one layer's activation rows.
#[derive(Debug)]
pub struct ExactIndex {
    /// Stored ids, aligned with `rows`.
    ids: Vec<ExampleId>,
    /// Stored activation vectors.
    rows: Vec<Vec<f32>>,
    /// Vector dimensionality.
    dim: usize,
}

impl ExactIndex {
    /// Build from id-aligned activation rows.
    ///
    /// Rows are assumed dimension-validated by the caller
    /// ([`LayerIndex::build`](crate::LayerIndex::build) does this).
    #[must_use]
    pub fn build(ids: &[ExampleId], rows: &[Vec<f32>], dim: usize) -> Self {
        Self {
            ids: ids.to_vec(),
            rows: rows.to_vec(),
            dim,
        }
    }

    /// Neighbors with their squared distances, nearest first.
    ///
    /// # Errors
    ///
    /// Currently infallible but returns `Result` for forward
    /// compatibility with the query contract.
    pub fn query_with_distances(&self, vector: &[f32], k: usize) -> Result<Vec<(f32, ExampleId)>> {
        let mut candidates: Vec<(f32, ExampleId)> = self
            .rows
            .iter()
            .zip(&self.ids)
            .map(|(row, &id)| (squared_distance(row, vector), id))
            .collect();
        candidates.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        candidates.truncate(k);
        Ok(candidates)
    }
}

impl NeighborIndex for ExactIndex {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn query(&self, vector: &[f32], k: usize) -> Vec<ExampleId> {
        let candidates: Vec<(f32, ExampleId)> = self
            .rows
            .iter()
            .zip(&self.ids)
            .map(|(row, &id)| (squared_distance(row, vector), id))
            .collect();
        take_k_nearest(candidates, k)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
