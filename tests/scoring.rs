// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end pipeline scenarios: build, calibrate, predict, rank.
//!
//! Drives the full scorer/ranker stack through a deterministic stub
//! backend whose activations are hand-placed, so every neighbor set —
//! and therefore every credibility value — is known in advance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashMap;

use candle_core::{Device, Tensor};

use candle_dknn::{
    ClassifierBackend, ClassifierModel, DkError, DkNNConfig, DkNNScorer, Example, ForwardPass,
    IndexKind, PerturbationMode, PerturbationRanker, Result, ScoringMode,
};

// ---------------------------------------------------------------------------
// Stub backend
// ---------------------------------------------------------------------------

/// Lookup-table classifier: every known sequence maps to a fixed output
/// distribution and one scalar activation per layer.
struct StubBackend {
    n_classes: usize,
    n_layers: usize,
    /// sequence → (probabilities, one activation scalar per layer).
    table: HashMap<Vec<u32>, (Vec<f32>, Vec<f32>)>,
    /// sequence → per-position one-hot gradient values.
    gradients: HashMap<Vec<u32>, Vec<f32>>,
    device: Device,
}

impl StubBackend {
    fn new(n_classes: usize, n_layers: usize) -> Self {
        Self {
            n_classes,
            n_layers,
            table: HashMap::new(),
            gradients: HashMap::new(),
            device: Device::Cpu,
        }
    }

    fn register(&mut self, sequence: &[u32], probs: &[f32], layers: &[f32]) {
        assert_eq!(probs.len(), self.n_classes);
        assert_eq!(layers.len(), self.n_layers);
        self.table
            .insert(sequence.to_vec(), (probs.to_vec(), layers.to_vec()));
    }

    fn register_gradient(&mut self, sequence: &[u32], grads: &[f32]) {
        self.gradients.insert(sequence.to_vec(), grads.to_vec());
    }

    fn into_model(self) -> ClassifierModel {
        let device = self.device.clone();
        ClassifierModel::new(Box::new(self), device)
    }
}

impl ClassifierBackend for StubBackend {
    fn num_classes(&self) -> usize {
        self.n_classes
    }

    fn num_activation_layers(&self) -> usize {
        self.n_layers
    }

    fn forward(&self, batch: &[Vec<u32>]) -> Result<ForwardPass> {
        let mut prob_data = Vec::with_capacity(batch.len() * self.n_classes);
        let mut layer_data: Vec<Vec<f32>> = vec![Vec::with_capacity(batch.len()); self.n_layers];
        for sequence in batch {
            let (probs, layers) = self.table.get(sequence).ok_or_else(|| {
                DkError::Config(format!("stub has no entry for {sequence:?}"))
            })?;
            prob_data.extend_from_slice(probs);
            for (slot, &value) in layer_data.iter_mut().zip(layers) {
                slot.push(value);
            }
        }
        let probabilities =
            Tensor::from_vec(prob_data, (batch.len(), self.n_classes), &self.device)?;
        let activations = layer_data
            .into_iter()
            .map(|values| Tensor::from_vec(values, (batch.len(), 1), &self.device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(ForwardPass::new(probabilities, activations))
    }

    fn onehot_gradient(&self, sequence: &[u32]) -> Result<Vec<f32>> {
        self.gradients.get(sequence).cloned().ok_or_else(|| {
            DkError::Config(format!("stub has no gradient for {sequence:?}"))
        })
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

const PROBE: [u32; 5] = [1, 2, 3, 4, 5];

/// 10 training examples, labels {0,0,0,0,0,1,1,1,1,1}, two designated
/// layers with identical 1-D geometry:
///
/// ```text
/// id     0   1   2   3   4   5   6    7    8    9
/// value  0  10  20  30  40  50  52  100  102  104
/// label  0   0   0   0   0   1   1    1    1    1
/// ```
///
/// The unmodified probe sits at 101 in both layers, so its 3 nearest
/// neighbors are {7, 8, 9} everywhere — all label 1.  The position-2
/// variant sits at 51 in layer 0 (neighbors {5, 6, 4}: two label-1) and
/// 20 in layer 1 (neighbors {2, 1, 3}: none), so its pooled credibility
/// for label 1 is 2/6.
fn fixture() -> (ClassifierModel, Vec<Example>) {
    let mut stub = StubBackend::new(2, 2);

    let values = [0.0f32, 10.0, 20.0, 30.0, 40.0, 50.0, 52.0, 100.0, 102.0, 104.0];
    let mut train = Vec::with_capacity(values.len());
    for (id, &value) in values.iter().enumerate() {
        let label = usize::from(id >= 5);
        let probs = if label == 0 { [0.9f32, 0.1] } else { [0.2, 0.8] };
        let tokens = vec![u32::try_from(id).unwrap()];
        stub.register(&tokens, &probs, &[value, value]);
        train.push(Example::new(id, tokens, label));
    }

    // Unmodified probe and its five single-token-removed variants.
    stub.register(&PROBE, &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[2, 3, 4, 5], &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[1, 3, 4, 5], &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[1, 2, 4, 5], &[0.6, 0.4], &[51.0, 20.0]);
    stub.register(&[1, 2, 3, 5], &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[1, 2, 3, 4], &[0.1, 0.9], &[101.0, 101.0]);

    stub.register_gradient(&PROBE, &[0.3, -0.2, -0.9, 0.1, 0.0]);

    // A single-token probe for degenerate-sequence handling: scoring it
    // never happens, but the baseline prediction does.
    stub.register(&[42], &[0.9, 0.1], &[0.0, 0.0]);

    // A length-2 probe whose variants have length 1 — permitted.
    stub.register(&[6, 7], &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[7], &[0.1, 0.9], &[101.0, 101.0]);
    stub.register(&[6], &[0.1, 0.9], &[103.0, 103.0]);

    (stub.into_model(), train)
}

fn config(scoring: ScoringMode) -> DkNNConfig {
    DkNNConfig {
        k: 3,
        batch_size: 3,
        scoring,
        positive_label: 0,
        ..DkNNConfig::default()
    }
}

fn built_scorer(scoring: ScoringMode) -> DkNNScorer {
    let (model, train) = fixture();
    DkNNScorer::build(model, &train, config(scoring)).unwrap()
}

// ---------------------------------------------------------------------------
// Build and predict
// ---------------------------------------------------------------------------

#[test]
fn probe_with_unanimous_neighbors_scores_credibility_one() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let predictions = scorer.predict(&[PROBE.to_vec()]).unwrap();
    let prediction = &predictions[0];

    assert_eq!(prediction.label, 1);
    assert!((prediction.credibility - 1.0).abs() < 1e-6);
    assert!((prediction.confidence - 0.9).abs() < 1e-6);
    assert!(prediction.calibrated_credibility.is_none());
    assert_eq!(prediction.layer_neighbors, vec![vec![7, 8, 9], vec![7, 8, 9]]);
    assert_eq!(prediction.label_votes, vec![0, 6]);
}

#[test]
fn neighbor_ids_stay_within_training_id_space() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    for sequence in [PROBE.to_vec(), vec![1, 2, 4, 5], vec![6, 7]] {
        for layer in scorer.layer_neighbors(&sequence).unwrap() {
            assert_eq!(layer.len(), 3);
            for id in layer {
                assert!(id < 10);
            }
        }
    }
}

#[test]
fn credibility_sums_to_one_over_the_label_set() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    for sequence in [PROBE.to_vec(), vec![1, 2, 4, 5]] {
        let per_label = scorer
            .credibility(&[sequence.clone(), sequence], &[0, 1])
            .unwrap();
        let sum: f32 = per_label.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        for value in per_label {
            assert!((0.0..=1.0).contains(&value));
        }
    }
}

#[test]
fn ablated_variant_drops_to_one_third_credibility() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let scores = scorer.credibility(&[vec![1, 2, 4, 5]], &[1]).unwrap();
    assert!((scores[0] - 1.0 / 3.0).abs() < 1e-6);
}

#[test]
fn empty_training_set_fails_build() {
    let stub = StubBackend::new(2, 2);
    let err = DkNNScorer::build(
        stub.into_model(),
        &[],
        config(ScoringMode::NeighborCredibility),
    )
    .unwrap_err();
    assert!(matches!(err, DkError::EmptyTrainingSet));
}

#[test]
fn duplicate_example_ids_fail_build() {
    let (model, mut train) = fixture();
    train[1].id = 0;
    let err =
        DkNNScorer::build(model, &train, config(ScoringMode::NeighborCredibility)).unwrap_err();
    assert!(matches!(err, DkError::Config(_)));
}

#[test]
fn out_of_range_layer_query_is_empty_index_error() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let err = scorer.index().query(5, &[0.0]).unwrap_err();
    assert!(matches!(err, DkError::EmptyIndex(_)));
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

#[test]
fn calibration_enables_calibrated_credibility() {
    let mut scorer = built_scorer(ScoringMode::NeighborCredibility);
    // Held-out points at the cluster cores and one straggler at 40,
    // whose neighbors {4, 3, 5} include a label-1 vote.
    let held_out = vec![
        Example::new(100, vec![0], 0),
        Example::new(101, vec![9], 1),
        Example::new(102, vec![4], 0),
    ];
    let stats = scorer.calibrate(&held_out).unwrap();
    assert_eq!(stats.n_samples(), 3);
    assert!((stats.per_class_baseline(1).unwrap() - 1.0).abs() < 1e-6);
    // Class 0 averages (6/6 + 4/6) / 2.
    assert!((stats.per_class_baseline(0).unwrap() - 5.0 / 6.0).abs() < 1e-6);

    let predictions = scorer.predict(&[PROBE.to_vec()]).unwrap();
    let calibrated = predictions[0].calibrated_credibility.unwrap();
    // Every calibration agreement is at or below 1.0.
    assert!((calibrated - 1.0).abs() < 1e-6);
}

// ---------------------------------------------------------------------------
// Ranking
// ---------------------------------------------------------------------------

#[test]
fn credibility_mode_ranks_the_ablated_position_first() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let ranking = ranker.rank(&scorer, &PROBE).unwrap();

    assert_eq!(ranking.predicted_label(), 1);
    assert!((ranking.baseline_score() - 1.0).abs() < 1e-6);
    assert_eq!(ranking.len(), PROBE.len());

    let top = ranking.most_important().unwrap();
    assert_eq!(top.position, 2);
    assert!((top.raw - (-2.0 / 3.0)).abs() < 1e-4);

    // Remaining positions left the neighbor sets untouched.
    for entry in &ranking.entries()[1..] {
        assert!(entry.raw.abs() < 1e-6);
    }

    // Normalized scores stay in [0, 1] and align by original position.
    let by_position = ranking.normalized_by_position();
    assert_eq!(by_position.len(), PROBE.len());
    for value in &by_position {
        assert!((0.0..=1.0).contains(value));
    }
    // positive_label is 0 here and the prediction is 1, so no flip: the
    // influential position renders below the neutral midpoint.
    assert!(by_position[2] < 0.5);
}

#[test]
fn neighbor_change_mode_detects_the_shifted_neighbor_sets() {
    let scorer = built_scorer(ScoringMode::NeighborChange);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let ranking = ranker.rank(&scorer, &PROBE).unwrap();

    // The position-2 variant shares no neighbors with the probe at
    // either layer: retention 0, raw 0 - 1 = -1.
    let top = ranking.most_important().unwrap();
    assert_eq!(top.position, 2);
    assert!((top.raw - (-1.0)).abs() < 1e-6);
}

#[test]
fn softmax_mode_uses_the_output_distribution_only() {
    let scorer = built_scorer(ScoringMode::RegularConfidence);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let ranking = ranker.rank(&scorer, &PROBE).unwrap();

    assert!((ranking.baseline_score() - 0.9).abs() < 1e-6);
    let top = ranking.most_important().unwrap();
    assert_eq!(top.position, 2);
    // Variant confidence for label 1 is 0.4.
    assert!((top.raw - (0.4 - 0.9)).abs() < 1e-6);
}

#[test]
fn gradient_mode_takes_backend_values_directly() {
    let scorer = built_scorer(ScoringMode::GradientSaliency);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let ranking = ranker.rank(&scorer, &PROBE).unwrap();

    let top = ranking.most_important().unwrap();
    assert_eq!(top.position, 2);
    assert!((top.raw - (-0.9)).abs() < 1e-6);
    // No baseline subtraction in gradient mode.
    assert!((ranking.baseline_score() - 0.9).abs() < 1e-6);
}

#[test]
fn positive_class_prediction_flips_visualization_polarity() {
    let (model, train) = fixture();
    let mut cfg = config(ScoringMode::NeighborCredibility);
    cfg.positive_label = 1;
    let scorer = DkNNScorer::build(model, &train, cfg).unwrap();
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let ranking = ranker.rank(&scorer, &PROBE).unwrap();

    // Ranking is unaffected by the flip...
    let top = ranking.most_important().unwrap();
    assert_eq!(top.position, 2);
    assert!(top.raw < 0.0);
    // ...but the rendered score lands above the midpoint.
    assert!(ranking.normalized_by_position()[2] > 0.5);
}

#[test]
fn reranking_an_unchanged_probe_is_idempotent() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let first = ranker.rank(&scorer, &PROBE).unwrap();
    let second = ranker.rank(&scorer, &PROBE).unwrap();

    assert_eq!(first.predicted_label(), second.predicted_label());
    assert_eq!(first.entries(), second.entries());
}

#[test]
fn degenerate_probe_fails_without_aborting_the_batch() {
    let scorer = built_scorer(ScoringMode::NeighborCredibility);
    let ranker = PerturbationRanker::from_config(scorer.config()).unwrap();
    let results = ranker.rank_many(&scorer, &[PROBE.to_vec(), vec![42], vec![6, 7]]);

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(
        results[1].as_ref().unwrap_err(),
        DkError::DegenerateSequence { len: 1, min: 2 }
    ));
    // Length 2 is permitted: both variants have length 1, not 0.
    let short = results[2].as_ref().unwrap();
    assert_eq!(short.len(), 2);
}

// ---------------------------------------------------------------------------
// Approximate indexing
// ---------------------------------------------------------------------------

#[test]
fn lsh_index_recalls_the_separated_clusters() {
    let (model, train) = fixture();
    let mut cfg = config(ScoringMode::NeighborCredibility);
    cfg.index = IndexKind::Lsh;
    let scorer = DkNNScorer::build(model, &train, cfg).unwrap();

    // All fixture activations are non-negative scalars, so every vector
    // shares its sign bits and hashing recalls the full candidate pool;
    // re-ranking by true distance then matches the exact index.
    let predictions = scorer.predict(&[PROBE.to_vec()]).unwrap();
    assert_eq!(predictions[0].label, 1);
    assert!((predictions[0].credibility - 1.0).abs() < 1e-6);

    let again = scorer.predict(&[PROBE.to_vec()]).unwrap();
    assert_eq!(predictions[0].layer_neighbors, again[0].layer_neighbors);
}

#[test]
fn per_layer_index_kinds_mix_exact_and_lsh() {
    let (model, train) = fixture();
    let mut cfg = config(ScoringMode::NeighborCredibility);
    cfg.index_per_layer = Some(vec![IndexKind::Exact, IndexKind::Lsh]);
    let scorer = DkNNScorer::build(model, &train, cfg).unwrap();

    let predictions = scorer.predict(&[PROBE.to_vec()]).unwrap();
    assert_eq!(predictions[0].label, 1);
    assert!((predictions[0].credibility - 1.0).abs() < 1e-6);
}

#[test]
fn per_layer_index_kind_count_must_match_layers() {
    let (model, train) = fixture();
    let mut cfg = config(ScoringMode::NeighborCredibility);
    cfg.index_per_layer = Some(vec![IndexKind::Exact]);
    let err = DkNNScorer::build(model, &train, cfg).unwrap_err();
    assert!(matches!(err, DkError::Config(_)));
}

// ---------------------------------------------------------------------------
// Mode configuration
// ---------------------------------------------------------------------------

#[test]
fn gradient_mode_with_bigram_generation_is_rejected_up_front() {
    let err = PerturbationRanker::new(
        ScoringMode::GradientSaliency,
        PerturbationMode::BigramRemoval,
        1,
    )
    .unwrap_err();
    assert!(matches!(err, DkError::UnsupportedMode(_)));
}
