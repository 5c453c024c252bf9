// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deep k-nearest-neighbor scorer.
//!
//! [`DkNNScorer`] orchestrates the classifier backend, the per-layer
//! indices, and the neighbor label store: built once over the training
//! data, optionally calibrated on a held-out subset, then queried
//! arbitrarily often.  All post-build state is read-only, so concurrent
//! queries need no locking.

use crate::backend::{argmax_row, ClassifierModel};
use crate::config::{DkNNConfig, LabelSource};
use crate::data::{Example, ExampleId};
use crate::error::{DkError, Result};
use crate::index::LayerIndex;
use crate::store::{ActivationCollector, NeighborLabelStore, TrainingActivationSet};

// ---------------------------------------------------------------------------
// Prediction
// ---------------------------------------------------------------------------

/// Result of scoring one probe input.
///
/// Ephemeral: recomputed per query, never persisted.
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Predicted label — majority over pooled neighbors, or the output
    /// distribution's argmax when no neighbors were recalled.
    pub label: usize,
    /// Fraction of pooled neighbors voting for `label`, in `[0, 1]`.
    pub credibility: f32,
    /// Empirical-CDF position of `credibility` against the calibration
    /// distribution.  `None` until `calibrate` has run.
    pub calibrated_credibility: Option<f32>,
    /// The classifier's own output probability for `label`.
    pub confidence: f32,
    /// Pooled vote count per class.
    pub label_votes: Vec<usize>,
    /// Neighbor ids per designated layer, nearest first.
    pub layer_neighbors: Vec<Vec<ExampleId>>,
}

// ---------------------------------------------------------------------------
// CalibrationStats
// ---------------------------------------------------------------------------

/// Score-normalization statistics from a held-out calibration pass.
///
/// Holds the empirical distribution of pooled neighbor agreement with the
/// true label, overall and per class.  Derived without mutating the
/// indices; an approximation of conformal credibility, not the full
/// calibrated construction.
#[derive(Debug, Clone)]
pub struct CalibrationStats {
    /// Pooled agreement fraction per calibration example, sorted
    /// ascending.
    agreements: Vec<f32>,
    /// Mean agreement per class (`None` encoded as 0-count classes).
    per_class_mean: Vec<Option<f32>>,
    /// Number of calibration examples consumed.
    n_samples: usize,
}

impl CalibrationStats {
    /// Number of calibration examples consumed.
    #[must_use]
    pub const fn n_samples(&self) -> usize {
        self.n_samples
    }

    /// Baseline neighbor-agreement rate for one class, if any
    /// calibration example carried it.
    #[must_use]
    pub fn per_class_baseline(&self, class: usize) -> Option<f32> {
        self.per_class_mean.get(class).copied().flatten()
    }

    /// Empirical-CDF position of an agreement fraction: the share of
    /// calibration examples whose agreement was at or below it.
    #[must_use]
    pub fn calibrated_credibility(&self, agreement: f32) -> f32 {
        if self.agreements.is_empty() {
            return 0.0;
        }
        let at_or_below = self.agreements.partition_point(|&a| a <= agreement);
        fraction(at_or_below, self.agreements.len())
    }
}

// ---------------------------------------------------------------------------
// DkNNScorer
// ---------------------------------------------------------------------------

/// Layer-wise nearest-neighbor scorer over a trained classifier.
///
/// # Lifecycle
///
/// [`build`](Self::build) → optional [`calibrate`](Self::calibrate) →
/// any number of [`predict`](Self::predict) /
/// [`credibility`](Self::credibility) / [`neighbor_change`](Self::neighbor_change)
/// calls.  Calibration takes `&mut self`, so it necessarily completes
/// before queries that read its statistics.
pub struct DkNNScorer {
    /// The wrapped classifier; owned so queries always run against the
    /// parameters the indices were built from.
    model: ClassifierModel,
    /// Pipeline configuration, validated at build time.
    config: DkNNConfig,
    /// id → label for vote aggregation.
    labels: NeighborLabelStore,
    /// One nearest-neighbor index per designated layer.
    index: LayerIndex,
    /// Held-out agreement statistics; `None` until calibrated.
    calibration: Option<CalibrationStats>,
}

impl std::fmt::Debug for DkNNScorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DkNNScorer")
            .field("config", &self.config)
            .field("labels", &self.labels)
            .field("index", &self.index)
            .field("calibration", &self.calibration)
            .finish()
    }
}

impl DkNNScorer {
    /// Run the classifier over all training examples in batches, collect
    /// per-layer activations keyed by example id, and build one index per
    /// layer.
    ///
    /// The label stored per neighbor follows `config.label_source`: the
    /// classifier's own argmax prediction, or the dataset label.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::EmptyTrainingSet`] for zero training examples,
    /// [`DkError::IndexBuild`] on activation dimensionality mismatch, and
    /// [`DkError::Config`] for invalid configuration or duplicate ids.
    pub fn build(model: ClassifierModel, train: &[Example], config: DkNNConfig) -> Result<Self> {
        config.validate()?;
        if train.is_empty() {
            return Err(DkError::EmptyTrainingSet);
        }
        let n_layers = model.num_activation_layers();
        if n_layers == 0 {
            return Err(DkError::Config(
                "backend designates no activation layers".into(),
            ));
        }

        let sequences: Vec<Vec<u32>> = train.iter().map(|e| e.tokens.clone()).collect();
        let (probs, layer_rows) = forward_rows(&model, config.batch_size, &sequences)?;

        let mut collector = ActivationCollector::new(n_layers);
        for ((example, prob_row), per_layer) in train.iter().zip(&probs).zip(layer_rows) {
            let label = match config.label_source {
                LabelSource::Predicted => argmax_row(prob_row)
                    .ok_or_else(|| DkError::Config("empty output distribution".into()))?,
                LabelSource::True => example.label,
            };
            collector.insert(example.id, label, per_layer)?;
        }

        let set: TrainingActivationSet = collector.freeze()?;
        let labels = NeighborLabelStore::from_training_set(&set);
        let kinds = config.layer_index_kinds(set.num_layers())?;
        let index = LayerIndex::build(&set, &kinds, config.k, &config.lsh)?;
        tracing::info!(
            examples = set.num_examples(),
            layers = set.num_layers(),
            k = config.k,
            index = %config.index,
            "built layer indices"
        );

        Ok(Self {
            model,
            config,
            labels,
            index,
            calibration: None,
        })
    }

    /// The wrapped classifier model.
    #[must_use]
    pub const fn model(&self) -> &ClassifierModel {
        &self.model
    }

    /// The pipeline configuration.
    #[must_use]
    pub const fn config(&self) -> &DkNNConfig {
        &self.config
    }

    /// The per-layer index collection.
    #[must_use]
    pub const fn index(&self) -> &LayerIndex {
        &self.index
    }

    /// The neighbor label store.
    #[must_use]
    pub const fn label_store(&self) -> &NeighborLabelStore {
        &self.labels
    }

    /// Calibration statistics, once [`calibrate`](Self::calibrate) has run.
    #[must_use]
    pub const fn calibration(&self) -> Option<&CalibrationStats> {
        self.calibration.as_ref()
    }

    /// Run the same forward pass over held-out examples and derive the
    /// agreement distribution used to normalize credibility scores.
    ///
    /// Consumes at most `config.calibration_size` examples.  Indices are
    /// not mutated; re-calibrating replaces the previous statistics.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] for an empty held-out set, otherwise
    /// propagates forward-pass and query errors.
    pub fn calibrate(&mut self, held_out: &[Example]) -> Result<&CalibrationStats> {
        if held_out.is_empty() {
            return Err(DkError::Config("calibration set is empty".into()));
        }
        let take = held_out.len().min(self.config.calibration_size);
        let subset = held_out.get(..take).unwrap_or(held_out);
        let sequences: Vec<Vec<u32>> = subset.iter().map(|e| e.tokens.clone()).collect();
        let (_probs, layer_rows) = forward_rows(&self.model, self.config.batch_size, &sequences)?;

        let n_classes = self.model.num_classes();
        let mut agreements = Vec::with_capacity(subset.len());
        let mut class_sum = vec![0.0f32; n_classes];
        let mut class_count = vec![0usize; n_classes];
        for (example, per_layer) in subset.iter().zip(layer_rows) {
            let layer_neighbors = self.index.query_all(&per_layer)?;
            let (votes, total, _) = self.pooled_votes(&layer_neighbors)?;
            let agreement = votes
                .get(example.label)
                .map_or(0.0, |&v| fraction(v, total));
            agreements.push(agreement);
            if let (Some(sum), Some(count)) = (
                class_sum.get_mut(example.label),
                class_count.get_mut(example.label),
            ) {
                *sum += agreement;
                *count += 1;
            }
        }
        agreements.sort_by(f32::total_cmp);
        let per_class_mean = class_sum
            .iter()
            .zip(&class_count)
            .map(|(&sum, &count)| (count > 0).then(|| sum / fraction(count, 1)))
            .collect();
        let stats = CalibrationStats {
            agreements,
            per_class_mean,
            n_samples: subset.len(),
        };
        tracing::info!(samples = stats.n_samples, "calibrated agreement baseline");
        let stats_ref: &CalibrationStats = self.calibration.insert(stats);
        Ok(stats_ref)
    }

    /// Score a batch of probe inputs.
    ///
    /// Per input: pool per-layer neighbor lists in fixed traversal order
    /// (layer ascending, then distance rank ascending), take the majority
    /// label with ties broken by first occurrence in that traversal, and
    /// report the vote share as credibility.  An input recalling zero
    /// neighbors (possible under approximate indexing) falls back to the
    /// output distribution's argmax with credibility 0.0.
    ///
    /// # Errors
    ///
    /// Propagates forward-pass and index-query errors.
    pub fn predict(&self, inputs: &[Vec<u32>]) -> Result<Vec<Prediction>> {
        let (probs, layer_rows) = forward_rows(&self.model, self.config.batch_size, inputs)?;
        let mut out = Vec::with_capacity(inputs.len());
        for (prob_row, per_layer) in probs.into_iter().zip(layer_rows) {
            let layer_neighbors = self.index.query_all(&per_layer)?;
            let (votes, total, majority) = self.pooled_votes(&layer_neighbors)?;
            let (label, credibility) = match majority {
                Some(label) => {
                    let share = votes.get(label).map_or(0.0, |&v| fraction(v, total));
                    (label, share)
                }
                None => {
                    let label = argmax_row(&prob_row)
                        .ok_or_else(|| DkError::Config("empty output distribution".into()))?;
                    (label, 0.0)
                }
            };
            let confidence = prob_row.get(label).copied().unwrap_or(0.0);
            let calibrated_credibility = self
                .calibration
                .as_ref()
                .map(|stats| stats.calibrated_credibility(credibility));
            out.push(Prediction {
                label,
                credibility,
                calibrated_credibility,
                confidence,
                label_votes: votes,
                layer_neighbors,
            });
        }
        Ok(out)
    }

    /// Pooled neighbor-vote fraction for each (input, candidate label)
    /// pair, in `[0, 1]`.
    ///
    /// For a fixed input, summing over the full label set yields 1 —
    /// every pooled neighbor votes for exactly one label.  An input with
    /// zero same-label neighbors scores 0.0 rather than failing.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if `inputs` and `labels` differ in
    /// length, otherwise propagates forward-pass and query errors.
    pub fn credibility(&self, inputs: &[Vec<u32>], labels: &[usize]) -> Result<Vec<f32>> {
        if inputs.len() != labels.len() {
            return Err(DkError::Config(format!(
                "{} inputs for {} candidate labels",
                inputs.len(),
                labels.len()
            )));
        }
        let (_probs, layer_rows) = forward_rows(&self.model, self.config.batch_size, inputs)?;
        let mut out = Vec::with_capacity(inputs.len());
        for (per_layer, &label) in layer_rows.iter().zip(labels) {
            let layer_neighbors = self.index.query_all(per_layer)?;
            let (votes, total, _) = self.pooled_votes(&layer_neighbors)?;
            out.push(votes.get(label).map_or(0.0, |&v| fraction(v, total)));
        }
        Ok(out)
    }

    /// Plain output-distribution confidence for each (input, label) pair,
    /// bypassing neighbor lookup entirely.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] on length mismatch or a label outside
    /// the output distribution, otherwise propagates forward-pass errors.
    pub fn regular_confidence(&self, inputs: &[Vec<u32>], labels: &[usize]) -> Result<Vec<f32>> {
        if inputs.len() != labels.len() {
            return Err(DkError::Config(format!(
                "{} inputs for {} labels",
                inputs.len(),
                labels.len()
            )));
        }
        let (probs, _layer_rows) = forward_rows(&self.model, self.config.batch_size, inputs)?;
        probs
            .iter()
            .zip(labels)
            .map(|(row, &label)| {
                row.get(label).copied().ok_or_else(|| {
                    DkError::Config(format!(
                        "label {label} outside output distribution of {} classes",
                        row.len()
                    ))
                })
            })
            .collect()
    }

    /// How much the nearest-neighbor set shifts between each variant and
    /// its reference input.
    ///
    /// Per pair: for every layer, the fraction of the reference's
    /// neighbor ids the variant retains; averaged across layers.  1.0
    /// means identical neighbor sets, 0.0 a complete shift.  Layers where
    /// the reference recalled no neighbors carry no signal and are
    /// skipped; if every layer is skipped the pair scores 1.0.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if `variants` and `references` differ
    /// in length, otherwise propagates forward-pass and query errors.
    pub fn neighbor_change(
        &self,
        variants: &[Vec<u32>],
        references: &[Vec<u32>],
    ) -> Result<Vec<f32>> {
        if variants.len() != references.len() {
            return Err(DkError::Config(format!(
                "{} variants for {} references",
                variants.len(),
                references.len()
            )));
        }
        let (_vp, variant_rows) = forward_rows(&self.model, self.config.batch_size, variants)?;
        let (_rp, reference_rows) =
            forward_rows(&self.model, self.config.batch_size, references)?;
        let mut out = Vec::with_capacity(variants.len());
        for (variant_layers, reference_layers) in variant_rows.iter().zip(&reference_rows) {
            let variant_neighbors = self.index.query_all(variant_layers)?;
            let reference_neighbors = self.index.query_all(reference_layers)?;
            out.push(retention(&variant_neighbors, &reference_neighbors));
        }
        Ok(out)
    }

    /// Neighbor ids per designated layer for one probe input, nearest
    /// first.
    ///
    /// # Errors
    ///
    /// Propagates forward-pass and index-query errors.
    pub fn layer_neighbors(&self, input: &[u32]) -> Result<Vec<Vec<ExampleId>>> {
        let (_probs, layer_rows) =
            forward_rows(&self.model, self.config.batch_size, &[input.to_vec()])?;
        let per_layer = layer_rows
            .into_iter()
            .next()
            .ok_or_else(|| DkError::Config("forward pass returned no examples".into()))?;
        self.index.query_all(&per_layer)
    }

    /// Pool per-layer neighbor labels in fixed traversal order.
    ///
    /// Returns (votes per class, pooled total, majority label).  The
    /// majority tie-break is first occurrence in the (layer ascending,
    /// rank ascending) traversal — deterministic, never random.
    fn pooled_votes(
        &self,
        layer_neighbors: &[Vec<ExampleId>],
    ) -> Result<(Vec<usize>, usize, Option<usize>)> {
        let n_classes = self.model.num_classes().max(self.labels.num_classes());
        let mut votes = vec![0usize; n_classes];
        let mut first_seen: Vec<usize> = Vec::new();
        let mut total = 0usize;
        for neighbors in layer_neighbors {
            for &id in neighbors {
                let label = self.labels.label(id).ok_or_else(|| {
                    DkError::Config(format!("neighbor id {id} has no stored label"))
                })?;
                let slot = votes.get_mut(label).ok_or_else(|| {
                    DkError::Config(format!("stored label {label} outside {n_classes} classes"))
                })?;
                if *slot == 0 {
                    first_seen.push(label);
                }
                *slot += 1;
                total += 1;
            }
        }
        let mut majority: Option<usize> = None;
        let mut best = 0usize;
        for &class in &first_seen {
            let count = votes.get(class).copied().unwrap_or(0);
            if count > best {
                best = count;
                majority = Some(class);
            }
        }
        Ok((votes, total, majority))
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Batched forward passes, de-batched back into input order.
///
/// Returns (probability rows, per-example per-layer activation vectors).
/// Outputs are re-associated positionally *within* each submitted batch
/// and concatenated in submission order; callers attribute results by
/// zipping against their own input collection, keyed by id where labels
/// are involved.
fn forward_rows(
    model: &ClassifierModel,
    batch_size: usize,
    inputs: &[Vec<u32>],
) -> Result<(Vec<Vec<f32>>, Vec<Vec<Vec<f32>>>)> {
    let n_layers = model.num_activation_layers();
    let mut probs = Vec::with_capacity(inputs.len());
    let mut per_example: Vec<Vec<Vec<f32>>> = Vec::with_capacity(inputs.len());
    for batch in inputs.chunks(batch_size.max(1)) {
        let pass = model.forward(batch)?;
        let batch_probs = pass.probability_rows()?;
        if batch_probs.len() != batch.len() {
            return Err(DkError::Model(candle_core::Error::Msg(format!(
                "backend returned {} probability rows for a batch of {}",
                batch_probs.len(),
                batch.len()
            ))));
        }
        let mut batch_examples: Vec<Vec<Vec<f32>>> = batch
            .iter()
            .map(|_| Vec::with_capacity(n_layers))
            .collect();
        for layer in 0..n_layers {
            let rows = pass.activation_rows(layer)?;
            if rows.len() != batch.len() {
                return Err(DkError::Model(candle_core::Error::Msg(format!(
                    "backend returned {} rows for layer {layer} in a batch of {}",
                    rows.len(),
                    batch.len()
                ))));
            }
            for (slot, row) in batch_examples.iter_mut().zip(rows) {
                slot.push(row);
            }
        }
        probs.extend(batch_probs);
        per_example.extend(batch_examples);
    }
    Ok((probs, per_example))
}

/// Neighbor-set retention between a variant and its reference, averaged
/// over layers that carry signal.
fn retention(variant: &[Vec<ExampleId>], reference: &[Vec<ExampleId>]) -> f32 {
    let mut sum = 0.0f32;
    let mut layers = 0usize;
    for (variant_ids, reference_ids) in variant.iter().zip(reference) {
        if reference_ids.is_empty() {
            continue;
        }
        let retained = reference_ids
            .iter()
            .filter(|id| variant_ids.contains(id))
            .count();
        sum += fraction(retained, reference_ids.len());
        layers += 1;
    }
    if layers == 0 {
        1.0
    } else {
        sum / fraction(layers, 1)
    }
}

/// `part / whole` as `f32`, 0.0 when `whole` is zero.
#[allow(clippy::cast_precision_loss)] // counts stay far below 2^24
fn fraction(part: usize, whole: usize) -> f32 {
    if whole == 0 {
        0.0
    } else {
        part as f32 / whole as f32
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
