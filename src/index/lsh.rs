// SPDX-License-Identifier: MIT OR Apache-2.0

//! Approximate nearest-neighbor index: random-hyperplane hashing.
//!
//! Vectors are reduced to sign-bit signatures against random hyperplanes,
//! one signature per hash table.  A query gathers the members of its
//! matching bucket in every table, then ranks the candidate pool by true
//! Euclidean distance.  Sub-linear candidate lookup, no recall guarantee:
//! a query may return fewer than `k` ids and may omit true nearest
//! neighbors.  That loss is silent and expected — the price of choosing
//! this index kind.

use std::collections::{BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::LshParams;
use crate::data::ExampleId;
use crate::index::{squared_distance, take_k_nearest, NeighborIndex};

/// One hash table: hyperplanes plus signature-keyed buckets.
#[derive(Debug)]
struct HashTable {
    /// Hyperplane normals, `bits` rows of `dim` components.
    hyperplanes: Vec<Vec<f32>>,
    /// Signature → row indices of vectors hashed there.
    buckets: HashMap<u64, Vec<usize>>,
}

impl HashTable {
    /// Sign-bit signature of a vector against this table's hyperplanes.
    fn signature(&self, vector: &[f32]) -> u64 {
        let mut signature = 0u64;
        for (bit, plane) in self.hyperplanes.iter().enumerate() {
            let dot: f32 = plane.iter().zip(vector).map(|(&p, &v)| p * v).sum();
            if dot >= 0.0 {
                signature |= 1 << bit;
            }
        }
        signature
    }
}

/// Multi-table random-hyperplane index over one layer's activation rows.
#[derive(Debug)]
pub struct LshIndex {
    /// Stored ids, aligned with `rows`.
    ids: Vec<ExampleId>,
    /// Stored activation vectors (candidates are re-ranked by true
    /// distance).
    rows: Vec<Vec<f32>>,
    /// Vector dimensionality.
    dim: usize,
    /// Independent hash tables.
    tables: Vec<HashTable>,
}

impl LshIndex {
    /// Build from id-aligned activation rows.
    ///
    /// Hyperplanes are drawn from a `StdRng` seeded with
    /// `params.seed + layer`, so each layer gets its own deterministic
    /// tables and rebuilding reproduces identical buckets.
    #[must_use]
    pub fn build(
        ids: &[ExampleId],
        rows: &[Vec<f32>],
        dim: usize,
        layer: usize,
        params: &LshParams,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(layer as u64));
        let bits = params.bits.min(64);
        let mut tables = Vec::with_capacity(params.tables);
        for _ in 0..params.tables {
            let hyperplanes: Vec<Vec<f32>> = (0..bits)
                .map(|_| (0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
                .collect();
            let mut table = HashTable {
                hyperplanes,
                buckets: HashMap::new(),
            };
            for (row_idx, row) in rows.iter().enumerate() {
                let signature = table.signature(row);
                table.buckets.entry(signature).or_default().push(row_idx);
            }
            tables.push(table);
        }
        Self {
            ids: ids.to_vec(),
            rows: rows.to_vec(),
            dim,
            tables,
        }
    }

    /// Row indices sharing a bucket with `vector` in any table,
    /// deduplicated in ascending row order.
    fn candidates(&self, vector: &[f32]) -> BTreeSet<usize> {
        let mut pool = BTreeSet::new();
        for table in &self.tables {
            let signature = table.signature(vector);
            if let Some(bucket) = table.buckets.get(&signature) {
                pool.extend(bucket.iter().copied());
            }
        }
        pool
    }
}

impl NeighborIndex for LshIndex {
    fn len(&self) -> usize {
        self.ids.len()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn query(&self, vector: &[f32], k: usize) -> Vec<ExampleId> {
        let candidates: Vec<(f32, ExampleId)> = self
            .candidates(vector)
            .into_iter()
            .filter_map(|row_idx| {
                let row = self.rows.get(row_idx)?;
                let id = self.ids.get(row_idx)?;
                Some((squared_distance(row, vector), *id))
            })
            .collect();
        take_k_nearest(candidates, k)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn clustered_index() -> LshIndex {
        // Two well-separated clusters; generous table count so the probe's
        // bucket is very unlikely to be empty in every table.
        let mut rows = Vec::new();
        let mut ids = Vec::new();
        for i in 0..8usize {
            let offset = if i < 4 { 0.0 } else { 100.0 };
            rows.push(vec![offset + i as f32 * 0.1, offset]);
            ids.push(i);
        }
        let params = LshParams {
            tables: 16,
            bits: 4,
            seed: 42,
        };
        LshIndex::build(&ids, &rows, 2, 0, &params)
    }

    #[test]
    fn query_is_deterministic_across_rebuilds() {
        let a = clustered_index();
        let b = clustered_index();
        let probe = [0.05f32, 0.0];
        assert_eq!(a.query(&probe, 3), b.query(&probe, 3));
    }

    #[test]
    fn returns_at_most_k_from_id_space() {
        let index = clustered_index();
        let neighbors = index.query(&[100.2, 100.0], 3);
        assert!(neighbors.len() <= 3);
        for id in &neighbors {
            assert!(*id < 8);
        }
    }

    #[test]
    fn candidates_ranked_by_true_distance() {
        let index = clustered_index();
        let neighbors = index.query(&[0.0, 0.0], 8);
        // Whatever subset hashing recalled, near-cluster members must
        // precede far-cluster members.
        let first_far = neighbors.iter().position(|&id| id >= 4);
        if let Some(pos) = first_far {
            assert!(neighbors.iter().skip(pos).all(|&id| id >= 4));
        }
    }

    #[test]
    fn per_layer_seeds_differ() {
        let rows: Vec<Vec<f32>> = (0..4).map(|i| vec![i as f32, 0.0]).collect();
        let ids: Vec<usize> = (0..4).collect();
        let params = LshParams::default();
        let layer0 = LshIndex::build(&ids, &rows, 2, 0, &params);
        let layer1 = LshIndex::build(&ids, &rows, 2, 1, &params);
        let planes0 = &layer0.tables.first().unwrap().hyperplanes;
        let planes1 = &layer1.tables.first().unwrap().hyperplanes;
        assert_ne!(planes0, planes1);
    }
}
