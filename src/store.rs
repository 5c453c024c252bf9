// SPDX-License-Identifier: MIT OR Apache-2.0

//! Training activation storage.
//!
//! [`ActivationCollector`] accumulates per-example activations keyed by
//! identifier during the build phase, so batch arrival order can never
//! corrupt label attribution.  Freezing it yields the immutable
//! [`TrainingActivationSet`] the layer indices are built over, plus the
//! [`NeighborLabelStore`] consumed at query time.

use std::collections::{BTreeMap, HashMap};

use crate::data::ExampleId;
use crate::error::{DkError, Result};

// ---------------------------------------------------------------------------
// ActivationCollector
// ---------------------------------------------------------------------------

/// Identifier-keyed accumulator for the build phase.
///
/// Append-only: every example is inserted exactly once, under its own id.
/// The collector is consumed by [`freeze`](Self::freeze); after that the
/// data is read-only.
#[derive(Debug)]
pub struct ActivationCollector {
    /// Designated layer count every insertion must match.
    n_layers: usize,
    /// id → (label, one activation vector per designated layer).
    entries: BTreeMap<ExampleId, (usize, Vec<Vec<f32>>)>,
}

impl ActivationCollector {
    /// Create a collector expecting `n_layers` activation vectors per
    /// example.
    #[must_use]
    pub const fn new(n_layers: usize) -> Self {
        Self {
            n_layers,
            entries: BTreeMap::new(),
        }
    }

    /// Insert one example's label and per-layer activations.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] for a duplicate id and
    /// [`DkError::IndexBuild`] if the layer count does not match the
    /// collector's.
    pub fn insert(&mut self, id: ExampleId, label: usize, layers: Vec<Vec<f32>>) -> Result<()> {
        if layers.len() != self.n_layers {
            return Err(DkError::IndexBuild(format!(
                "example {id} carries {} activation layers, expected {}",
                layers.len(),
                self.n_layers
            )));
        }
        if self.entries.insert(id, (label, layers)).is_some() {
            return Err(DkError::Config(format!("duplicate example id {id}")));
        }
        Ok(())
    }

    /// Number of collected examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been collected yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Freeze into an immutable [`TrainingActivationSet`], rows ordered by
    /// ascending identifier.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::EmptyTrainingSet`] if nothing was collected.
    pub fn freeze(self) -> Result<TrainingActivationSet> {
        if self.entries.is_empty() {
            return Err(DkError::EmptyTrainingSet);
        }
        let n = self.entries.len();
        let mut ids = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);
        let mut layers: Vec<Vec<Vec<f32>>> = (0..self.n_layers)
            .map(|_| Vec::with_capacity(n))
            .collect();
        for (id, (label, example_layers)) in self.entries {
            ids.push(id);
            labels.push(label);
            for (layer_rows, row) in layers.iter_mut().zip(example_layers) {
                layer_rows.push(row);
            }
        }
        Ok(TrainingActivationSet { ids, labels, layers })
    }
}

// ---------------------------------------------------------------------------
// TrainingActivationSet
// ---------------------------------------------------------------------------

/// Immutable per-layer activation rows, index-aligned with identifiers
/// and labels.
///
/// Built once, read arbitrarily often.  `layers[l][i]` is the layer-`l`
/// activation of the example with id `ids[i]` and label `labels[i]`.
#[derive(Debug)]
pub struct TrainingActivationSet {
    /// Example ids, ascending.
    ids: Vec<ExampleId>,
    /// Labels aligned with `ids`.
    labels: Vec<usize>,
    /// Activation rows per designated layer, aligned with `ids`.
    layers: Vec<Vec<Vec<f32>>>,
}

impl TrainingActivationSet {
    /// Number of examples.
    #[must_use]
    pub fn num_examples(&self) -> usize {
        self.ids.len()
    }

    /// Number of designated layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Example ids, ascending.
    #[must_use]
    pub fn ids(&self) -> &[ExampleId] {
        &self.ids
    }

    /// Labels aligned with [`ids`](Self::ids).
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// One layer's activation rows, aligned with [`ids`](Self::ids).
    #[must_use]
    pub fn layer_rows(&self, layer: usize) -> Option<&[Vec<f32>]> {
        self.layers.get(layer).map(Vec::as_slice)
    }
}

// ---------------------------------------------------------------------------
// NeighborLabelStore
// ---------------------------------------------------------------------------

/// Example id → label, consumed during query-time vote aggregation.
#[derive(Debug, Clone)]
pub struct NeighborLabelStore {
    /// id → label.
    labels: HashMap<ExampleId, usize>,
    /// Number of distinct classes observed (max label + 1).
    num_classes: usize,
}

impl NeighborLabelStore {
    /// Build from a frozen training set.
    #[must_use]
    pub fn from_training_set(set: &TrainingActivationSet) -> Self {
        let labels: HashMap<ExampleId, usize> = set
            .ids()
            .iter()
            .copied()
            .zip(set.labels().iter().copied())
            .collect();
        let num_classes = set.labels().iter().max().map_or(0, |&m| m + 1);
        Self { labels, num_classes }
    }

    /// Label of a training example.
    #[must_use]
    pub fn label(&self, id: ExampleId) -> Option<usize> {
        self.labels.get(&id).copied()
    }

    /// Number of stored labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Number of classes spanned by the stored labels.
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn two_layer_collector() -> ActivationCollector {
        let mut collector = ActivationCollector::new(2);
        // Inserted out of id order on purpose.
        collector
            .insert(7, 1, vec![vec![7.0, 7.0], vec![70.0]])
            .unwrap();
        collector
            .insert(3, 0, vec![vec![3.0, 3.0], vec![30.0]])
            .unwrap();
        collector
            .insert(5, 1, vec![vec![5.0, 5.0], vec![50.0]])
            .unwrap();
        collector
    }

    #[test]
    fn freeze_orders_by_id_not_arrival() {
        let set = two_layer_collector().freeze().unwrap();
        assert_eq!(set.num_examples(), 3);
        assert_eq!(set.num_layers(), 2);
        assert_eq!(set.ids(), &[3, 5, 7]);
        assert_eq!(set.labels(), &[0, 1, 1]);
        assert_eq!(set.layer_rows(0).unwrap()[0], vec![3.0, 3.0]);
        assert_eq!(set.layer_rows(1).unwrap()[2], vec![70.0]);
        assert!(set.layer_rows(2).is_none());
    }

    #[test]
    fn duplicate_id_rejected() {
        let mut collector = two_layer_collector();
        let err = collector
            .insert(3, 0, vec![vec![0.0, 0.0], vec![0.0]])
            .unwrap_err();
        assert!(matches!(err, DkError::Config(_)));
    }

    #[test]
    fn layer_count_mismatch_rejected() {
        let mut collector = ActivationCollector::new(2);
        let err = collector.insert(0, 0, vec![vec![1.0]]).unwrap_err();
        assert!(matches!(err, DkError::IndexBuild(_)));
    }

    #[test]
    fn empty_freeze_fails() {
        let collector = ActivationCollector::new(2);
        let err = collector.freeze().unwrap_err();
        assert!(matches!(err, DkError::EmptyTrainingSet));
    }

    #[test]
    fn label_store_lookup() {
        let set = two_layer_collector().freeze().unwrap();
        let store = NeighborLabelStore::from_training_set(&set);
        assert_eq!(store.len(), 3);
        assert_eq!(store.label(5), Some(1));
        assert_eq!(store.label(4), None);
        assert_eq!(store.num_classes(), 2);
    }
}
