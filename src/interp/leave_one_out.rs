// SPDX-License-Identifier: MIT OR Apache-2.0

//! Leave-one-out token importance ranking.
//!
//! Generates token-ablated variants of a probe sequence, scores each
//! variant against the probe's fixed predicted label, and turns the
//! per-variant scores into a per-position importance ranking plus a
//! normalized `[0, 1]` signal aligned to the original token order.

use crate::config::{DkNNConfig, PerturbationMode, ScoringMode};
use crate::data::{TokenAttribution, Vocab};
use crate::error::{DkError, Result};
use crate::scorer::DkNNScorer;

// ---------------------------------------------------------------------------
// ImportanceRanking
// ---------------------------------------------------------------------------

/// One ranked position: where, how much, and its visualization value.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RankedPosition {
    /// Original position in the probe (first token of the pair in
    /// bigram-removal mode).
    pub position: usize,
    /// Raw importance — variant score minus baseline (the gradient value
    /// as-is in gradient mode).  Lower means removing this token degrades
    /// the prediction more.
    pub raw: f32,
    /// Two-sided-normalized value in `[0, 1]`; `0.5` is neutral.
    pub normalized: f32,
}

/// Per-token importance ranking for one probe.
///
/// Ephemeral: created per probe, never cached across probes.
#[derive(Debug, Clone)]
pub struct ImportanceRanking {
    /// Label the variants were scored against.
    predicted_label: usize,
    /// Score of the unmodified probe under the configured mode.
    baseline_score: f32,
    /// Ranked positions, ascending by raw score (most important first),
    /// raw-score ties broken by ascending position.
    entries: Vec<RankedPosition>,
    /// Probe length, for position-aligned output.
    seq_len: usize,
}

impl ImportanceRanking {
    /// Label the variants were scored against.
    #[must_use]
    pub const fn predicted_label(&self) -> usize {
        self.predicted_label
    }

    /// Score of the unmodified probe.
    #[must_use]
    pub const fn baseline_score(&self) -> f32 {
        self.baseline_score
    }

    /// Ranked positions, most important (lowest raw score) first.
    #[must_use]
    pub fn entries(&self) -> &[RankedPosition] {
        &self.entries
    }

    /// Number of ranked positions — one per generated variant.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ranking is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most important position, if any.
    #[must_use]
    pub fn most_important(&self) -> Option<&RankedPosition> {
        self.entries.first()
    }

    /// Normalized scores re-aligned to original token positions.
    ///
    /// Positions no variant covered (premise tokens in hypothesis-only
    /// mode, the final token in bigram mode) sit at the neutral `0.5`.
    #[must_use]
    pub fn normalized_by_position(&self) -> Vec<f32> {
        let mut scores = vec![0.5f32; self.seq_len];
        for entry in &self.entries {
            if let Some(slot) = scores.get_mut(entry.position) {
                *slot = entry.normalized;
            }
        }
        scores
    }

    /// Pair each surface token with its normalized score, in original
    /// token order — the contract any renderer consumes.
    #[must_use]
    pub fn attributions(&self, tokens: &[u32], vocab: &Vocab) -> Vec<TokenAttribution> {
        tokens
            .iter()
            .zip(self.normalized_by_position())
            .map(|(&token, score)| TokenAttribution {
                token: vocab.decode(token).to_string(),
                score,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PerturbationRanker
// ---------------------------------------------------------------------------

/// Drives many scorer queries — one per ablated variant — and ranks the
/// probe's positions by how much their removal degrades the prediction.
#[derive(Debug, Clone, Copy)]
pub struct PerturbationRanker {
    /// How variants are scored.
    scoring: ScoringMode,
    /// How variants are generated.
    perturbation: PerturbationMode,
    /// Label index whose prediction flips the sign convention.
    positive_label: usize,
}

impl PerturbationRanker {
    /// Create a ranker, validating the mode combination once here rather
    /// than per call.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::UnsupportedMode`] when gradient saliency is
    /// combined with a generation mode other than token removal.
    pub fn new(
        scoring: ScoringMode,
        perturbation: PerturbationMode,
        positive_label: usize,
    ) -> Result<Self> {
        if scoring == ScoringMode::GradientSaliency
            && perturbation != PerturbationMode::TokenRemoval
        {
            return Err(DkError::UnsupportedMode(format!(
                "gradient saliency cannot be combined with {perturbation} generation"
            )));
        }
        Ok(Self {
            scoring,
            perturbation,
            positive_label,
        })
    }

    /// Create a ranker from the scorer configuration.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn from_config(config: &DkNNConfig) -> Result<Self> {
        Self::new(config.scoring, config.perturbation, config.positive_label)
    }

    /// Rank one probe's positions by leave-one-out importance.
    ///
    /// 1. Score the unmodified probe for its predicted label ŷ and
    ///    baseline score.
    /// 2. Generate the variant set for the configured mode.
    /// 3. Score every variant against the *same fixed* ŷ — measuring
    ///    degraded support for the original prediction, not a change of
    ///    argmax.
    /// 4. Raw importance = variant score − baseline (gradient values are
    ///    taken as-is); the ranking sorts these ascending.
    /// 5. For visualization, importances are negated when ŷ is the
    ///    positive label (label-invariant polarity) and two-sided
    ///    normalized into `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::DegenerateSequence`] for a probe too short to
    /// perturb, otherwise propagates scorer errors.
    pub fn rank(&self, scorer: &DkNNScorer, probe: &[u32]) -> Result<ImportanceRanking> {
        let probe_vec = probe.to_vec();
        let baseline = scorer
            .predict(std::slice::from_ref(&probe_vec))?
            .into_iter()
            .next()
            .ok_or_else(|| DkError::Config("prediction returned no results".into()))?;
        let label = baseline.label;
        let baseline_score = match self.scoring {
            ScoringMode::NeighborChange | ScoringMode::NeighborCredibility => {
                baseline.credibility
            }
            ScoringMode::RegularConfidence | ScoringMode::GradientSaliency => {
                baseline.confidence
            }
        };

        let variants = generate_variants(self.perturbation, probe)?;
        let positions: Vec<usize> = variants.iter().map(|(position, _)| *position).collect();
        let sequences: Vec<Vec<u32>> = variants.into_iter().map(|(_, seq)| seq).collect();

        let scores = match self.scoring {
            ScoringMode::NeighborChange => {
                let references = vec![probe_vec.clone(); sequences.len()];
                scorer.neighbor_change(&sequences, &references)?
            }
            ScoringMode::NeighborCredibility => {
                scorer.credibility(&sequences, &vec![label; sequences.len()])?
            }
            ScoringMode::RegularConfidence => {
                scorer.regular_confidence(&sequences, &vec![label; sequences.len()])?
            }
            ScoringMode::GradientSaliency => {
                let grads = scorer.model().onehot_gradient(probe)?;
                if grads.len() != probe.len() {
                    return Err(DkError::Config(format!(
                        "backend returned {} gradient values for {} positions",
                        grads.len(),
                        probe.len()
                    )));
                }
                grads
            }
        };

        // Raw importances rank ascending: the lower the variant scores,
        // the more its removed token supported the prediction.
        let raw: Vec<f32> = scores
            .iter()
            .map(|&score| {
                if self.scoring == ScoringMode::GradientSaliency {
                    score
                } else {
                    score - baseline_score
                }
            })
            .collect();

        // Visualization polarity is label-invariant: flip the sign for
        // the positive class before normalizing.  Ranking stays on the
        // unflipped raw values.
        let flip = label == self.positive_label;
        let oriented: Vec<f32> = raw
            .iter()
            .map(|&value| if flip { -value } else { value })
            .collect();
        let normalized = normalize_two_sided(&oriented);
        let mut entries: Vec<RankedPosition> = positions
            .into_iter()
            .zip(raw)
            .zip(normalized)
            .map(|((position, raw), normalized)| RankedPosition {
                position,
                raw,
                normalized,
            })
            .collect();
        entries.sort_by(|a, b| {
            a.raw
                .total_cmp(&b.raw)
                .then_with(|| a.position.cmp(&b.position))
        });

        tracing::debug!(
            variants = entries.len(),
            label,
            baseline = baseline_score,
            "ranked leave-one-out variants"
        );

        Ok(ImportanceRanking {
            predicted_label: label,
            baseline_score,
            entries,
            seq_len: probe.len(),
        })
    }

    /// Rank a batch of probes, reporting failures per probe.
    ///
    /// A degenerate sequence (or any other per-probe failure) yields an
    /// `Err` in its slot; the remaining probes still rank.
    #[must_use]
    pub fn rank_many(
        &self,
        scorer: &DkNNScorer,
        probes: &[Vec<u32>],
    ) -> Vec<Result<ImportanceRanking>> {
        probes.iter().map(|probe| self.rank(scorer, probe)).collect()
    }
}

// ---------------------------------------------------------------------------
// Variant generation
// ---------------------------------------------------------------------------

/// Generate (position, ablated sequence) pairs for one probe.
///
/// Token removal yields exactly `len` variants; bigram removal `len − 1`;
/// hypothesis-only one per hypothesis position.  Variants are rebuilt per
/// probe, never cached.
fn generate_variants(mode: PerturbationMode, probe: &[u32]) -> Result<Vec<(usize, Vec<u32>)>> {
    match mode {
        PerturbationMode::TokenRemoval => {
            // A variant may have length 1, but never 0.
            if probe.len() < 2 {
                return Err(DkError::DegenerateSequence {
                    len: probe.len(),
                    min: 2,
                });
            }
            Ok((0..probe.len())
                .map(|i| (i, splice_out(probe, i, 1)))
                .collect())
        }
        PerturbationMode::BigramRemoval => {
            if probe.len() < 3 {
                return Err(DkError::DegenerateSequence {
                    len: probe.len(),
                    min: 3,
                });
            }
            Ok((0..probe.len() - 1)
                .map(|i| (i, splice_out(probe, i, 2)))
                .collect())
        }
        PerturbationMode::HypothesisOnly { premise_len } => {
            let hypothesis_len = probe.len().saturating_sub(premise_len);
            if hypothesis_len < 2 {
                return Err(DkError::DegenerateSequence {
                    len: hypothesis_len,
                    min: 2,
                });
            }
            Ok((premise_len..probe.len())
                .map(|i| (i, splice_out(probe, i, 1)))
                .collect())
        }
    }
}

/// Copy of `probe` with `count` positions removed starting at `start`.
fn splice_out(probe: &[u32], start: usize, count: usize) -> Vec<u32> {
    let mut variant = Vec::with_capacity(probe.len().saturating_sub(count));
    variant.extend_from_slice(&probe[..start]);
    variant.extend_from_slice(&probe[(start + count).min(probe.len())..]);
    variant
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Two-sided normalization into `[0, 1]`.
///
/// Positions partition by sign; each partition's absolute values are
/// scaled by its own sum (with a `1e-6` additive floor so an empty
/// partition never divides by zero), halved, then shifted by `+0.5`.
/// Negative raw values land in `[0, 0.5]`, non-negative in `[0.5, 1]`.
/// Independent scaling keeps one dominant outlier in either partition
/// from washing out all signal in the other.
#[must_use]
pub fn normalize_two_sided(raw: &[f32]) -> Vec<f32> {
    let mut positive_total = 1e-6f32;
    let mut negative_total = 1e-6f32;
    for &value in raw {
        if value < 0.0 {
            negative_total += value.abs();
        } else {
            positive_total += value;
        }
    }
    raw.iter()
        .map(|&value| {
            let scaled = if value < 0.0 {
                (value / negative_total) / 2.0
            } else {
                (value / positive_total) / 2.0
            };
            0.5 + scaled
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
