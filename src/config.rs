// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scorer and ranker configuration.
//!
//! [`DkNNConfig`] captures the configuration axes of the scoring pipeline:
//! neighbor count, index type, batch and calibration sizes, scoring mode,
//! and perturbation-generation mode.  Mode strings are resolved into enums
//! here, at configuration time — an unrecognized mode never survives past
//! parsing.
//!
//! # Usage
//!
//! ```
//! use candle_dknn::DkNNConfig;
//!
//! let config_str = r#"{"k": 10, "index": "lsh", "scoring": "dknn",
//!     "perturbation": "token-removal", "batch_size": 32}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = DkNNConfig::from_json(&json).unwrap();
//! assert_eq!(config.k, 10);
//! ```

use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use crate::error::{DkError, Result};

// ---------------------------------------------------------------------------
// Mode enums
// ---------------------------------------------------------------------------

/// How a perturbation variant is scored against the unmodified probe.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    /// Neighbor-set retention between variant and reference, pooled over
    /// layers.  The historical deep-kNN interpretation path: pooled
    /// credibility saturates near 1.0 for confidently-classified inputs,
    /// so the shift in neighbor *identity* discriminates better.
    NeighborChange,
    /// Pooled neighbor-label credibility of the variant for the fixed
    /// predicted label.
    NeighborCredibility,
    /// Output-distribution (softmax) probability of the fixed predicted
    /// label.  Cheaper: bypasses the neighbor indices entirely.
    RegularConfidence,
    /// One-hot input gradient magnitudes from the backend.  Values are
    /// already locally normalized; no baseline is subtracted.
    GradientSaliency,
}

impl fmt::Display for ScoringMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeighborChange => write!(f, "dknn"),
            Self::NeighborCredibility => write!(f, "credibility"),
            Self::RegularConfidence => write!(f, "softmax"),
            Self::GradientSaliency => write!(f, "grad"),
        }
    }
}

/// Parse a scoring-mode string.
///
/// Recognizes the historical CLI spellings (`dknn`, `softmax`, `grad`)
/// plus explicit long forms.  Anything else is
/// [`DkError::UnsupportedMode`] — rejected here, never mid-run.
impl FromStr for ScoringMode {
    type Err = DkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dknn" | "neighbor-change" => Ok(Self::NeighborChange),
            "credibility" | "neighbor-credibility" => Ok(Self::NeighborCredibility),
            "softmax" | "confidence" | "regular-confidence" => Ok(Self::RegularConfidence),
            "grad" | "gradient" | "gradient-saliency" => Ok(Self::GradientSaliency),
            other => Err(DkError::UnsupportedMode(other.to_string())),
        }
    }
}

/// How perturbation variants are generated from a probe sequence.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerturbationMode {
    /// One variant per position, with that position spliced out.
    /// Requires sequence length > 1.
    TokenRemoval,
    /// One variant per adjacent pair, with both positions spliced out.
    /// Requires sequence length > 2.
    BigramRemoval,
    /// For paired-sequence inputs encoded as premise-prefix followed by
    /// hypothesis-suffix: one variant per hypothesis position, premise
    /// untouched.  Requires hypothesis length > 1.
    HypothesisOnly {
        /// Number of leading positions that belong to the premise.
        premise_len: usize,
    },
}

impl fmt::Display for PerturbationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenRemoval => write!(f, "token-removal"),
            Self::BigramRemoval => write!(f, "bigram-removal"),
            Self::HypothesisOnly { premise_len } => {
                write!(f, "hypothesis-only(premise_len={premise_len})")
            }
        }
    }
}

/// Which nearest-neighbor structure backs each layer index.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Exhaustive Euclidean scan.  Exact: returns the true k nearest,
    /// distance ties broken by ascending identifier.
    Exact,
    /// Locality-sensitive hashing over random hyperplane signatures.
    /// Approximate: sub-linear candidate lookup, no recall guarantee.
    Lsh,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Lsh => write!(f, "lsh"),
        }
    }
}

impl FromStr for IndexKind {
    type Err = DkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "exact" => Ok(Self::Exact),
            "lsh" => Ok(Self::Lsh),
            other => Err(DkError::Config(format!("unknown index kind: '{other}'"))),
        }
    }
}

/// Which label is stored for each training neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    /// The classifier's argmax prediction on the training example.
    Predicted,
    /// The dataset's ground-truth label.
    True,
}

impl fmt::Display for LabelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicted => write!(f, "predicted"),
            Self::True => write!(f, "true"),
        }
    }
}

impl FromStr for LabelSource {
    type Err = DkError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "predicted" => Ok(Self::Predicted),
            "true" => Ok(Self::True),
            other => Err(DkError::Config(format!("unknown label source: '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// LshParams
// ---------------------------------------------------------------------------

/// Shape and seed of the locality-sensitive hashing index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshParams {
    /// Number of independent hash tables.
    pub tables: usize,
    /// Signature width in bits per table.
    pub bits: usize,
    /// Seed for the hyperplane draws.  Fixed seed keeps approximate
    /// queries reproducible run to run.
    pub seed: u64,
}

impl Default for LshParams {
    fn default() -> Self {
        Self {
            tables: 8,
            bits: 16,
            seed: 0x00d1_5ea5_e5ee_d5ed,
        }
    }
}

// ---------------------------------------------------------------------------
// DkNNConfig
// ---------------------------------------------------------------------------

/// Configuration for the scoring and ranking pipeline.
#[derive(Debug, Clone)]
pub struct DkNNConfig {
    /// Neighbors fetched per layer query.  Fixed per index instance.
    pub k: usize,
    /// Index structure used for layers without an explicit override.
    pub index: IndexKind,
    /// Optional per-layer index kinds, designated-layer order.  Lets a
    /// low-dimensional layer stay exact while a high-dimensional one
    /// trades recall for sub-linear lookup.  Length must match the
    /// backend's designated layer count; checked at build time.
    pub index_per_layer: Option<Vec<IndexKind>>,
    /// Examples per forward-pass batch during build and calibration.
    pub batch_size: usize,
    /// Maximum number of held-out examples consumed by `calibrate`.
    pub calibration_size: usize,
    /// How perturbation variants are scored.
    pub scoring: ScoringMode,
    /// How perturbation variants are generated.
    pub perturbation: PerturbationMode,
    /// Label index treated as the "positive" class.  When the prediction
    /// equals it, visualization scores are sign-flipped before
    /// normalization so rendering polarity stays label-invariant.
    pub positive_label: usize,
    /// Which label is stored for training neighbors.
    pub label_source: LabelSource,
    /// Hashing shape for [`IndexKind::Lsh`].
    pub lsh: LshParams,
}

impl Default for DkNNConfig {
    fn default() -> Self {
        Self {
            k: 75,
            index: IndexKind::Exact,
            index_per_layer: None,
            batch_size: 64,
            calibration_size: 1000,
            scoring: ScoringMode::NeighborChange,
            perturbation: PerturbationMode::TokenRemoval,
            positive_label: 1,
            label_source: LabelSource::Predicted,
            lsh: LshParams::default(),
        }
    }
}

impl DkNNConfig {
    /// Parse a [`DkNNConfig`] from a JSON value.
    ///
    /// Absent fields fall back to their defaults.  Mode strings are
    /// resolved here; the hypothesis-only perturbation mode is spelled
    /// `"hypothesis-only"` with a sibling `"premise_len"` field.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::UnsupportedMode`] for an unrecognized scoring
    /// mode and [`DkError::Config`] for any other invalid field or
    /// combination.
    pub fn from_json(config: &Value) -> Result<Self> {
        let defaults = Self::default();

        let scoring = match config.get("scoring").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => defaults.scoring,
        };
        let index = match config.get("index").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => defaults.index,
        };
        let label_source = match config.get("label_source").and_then(Value::as_str) {
            Some(s) => s.parse()?,
            None => defaults.label_source,
        };
        let perturbation = match config.get("perturbation").and_then(Value::as_str) {
            Some("token-removal") => PerturbationMode::TokenRemoval,
            Some("bigram-removal") => PerturbationMode::BigramRemoval,
            Some("hypothesis-only") => PerturbationMode::HypothesisOnly {
                premise_len: get_usize(config, "premise_len")?,
            },
            Some(other) => {
                return Err(DkError::Config(format!(
                    "unknown perturbation mode: '{other}'"
                )))
            }
            None => defaults.perturbation,
        };

        let index_per_layer = match config.get("index_per_layer").and_then(Value::as_array) {
            Some(kinds) => Some(
                kinds
                    .iter()
                    .map(|kind| {
                        kind.as_str()
                            .ok_or_else(|| {
                                DkError::Config("index_per_layer entries must be strings".into())
                            })?
                            .parse()
                    })
                    .collect::<Result<Vec<IndexKind>>>()?,
            ),
            None => defaults.index_per_layer,
        };

        let parsed = Self {
            k: get_usize_or(config, "k", defaults.k),
            index,
            index_per_layer,
            batch_size: get_usize_or(config, "batch_size", defaults.batch_size),
            calibration_size: get_usize_or(config, "calibration_size", defaults.calibration_size),
            scoring,
            perturbation,
            positive_label: get_usize_or(config, "positive_label", defaults.positive_label),
            label_source,
            lsh: LshParams {
                tables: get_usize_or(config, "lsh_tables", defaults.lsh.tables),
                bits: get_usize_or(config, "lsh_bits", defaults.lsh.bits),
                seed: get_u64_or(config, "lsh_seed", defaults.lsh.seed),
            },
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Resolve the index kind for each of `n_layers` designated layers.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if `index_per_layer` is present with
    /// the wrong length.
    pub fn layer_index_kinds(&self, n_layers: usize) -> Result<Vec<IndexKind>> {
        match &self.index_per_layer {
            Some(kinds) => {
                if kinds.len() != n_layers {
                    return Err(DkError::Config(format!(
                        "index_per_layer lists {} kinds for {n_layers} designated layers",
                        kinds.len()
                    )));
                }
                Ok(kinds.clone())
            }
            None => Ok(vec![self.index; n_layers]),
        }
    }

    /// Validate field values and mode combinations.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] for zero-valued sizes and
    /// [`DkError::UnsupportedMode`] when gradient saliency is combined
    /// with a perturbation mode other than token removal (gradients are
    /// only defined per single-token position).
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DkError::Config("k must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(DkError::Config("batch_size must be at least 1".into()));
        }
        let uses_lsh = self.index == IndexKind::Lsh
            || self
                .index_per_layer
                .as_ref()
                .is_some_and(|kinds| kinds.contains(&IndexKind::Lsh));
        if uses_lsh && (self.lsh.tables == 0 || self.lsh.bits == 0) {
            return Err(DkError::Config(
                "lsh_tables and lsh_bits must be at least 1".into(),
            ));
        }
        if self.scoring == ScoringMode::GradientSaliency
            && self.perturbation != PerturbationMode::TokenRemoval
        {
            return Err(DkError::UnsupportedMode(format!(
                "gradient saliency cannot be combined with {} generation",
                self.perturbation
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract a required `usize` field from a JSON object.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| DkError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| DkError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(default)
}

/// Extract an optional `u64` field, returning a default if absent.
fn get_u64_or(config: &Value, key: &str, default: u64) -> u64 {
    config.get(key).and_then(Value::as_u64).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
