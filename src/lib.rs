// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-dknn
//!
//! Post-hoc interpretability for trained sequence classifiers in Rust,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! candle-dknn indexes the per-layer activations a classifier produces
//! for its training set in nearest-neighbor structures, scores new
//! inputs by the label agreement among their nearest neighbors at each
//! layer (deep k-nearest neighbors), and ranks which input tokens most
//! influence that score by re-scoring token-ablated variants
//! (leave-one-out).
//!
//! ## Pipeline
//!
//! 1. [`DkNNScorer::build`] — run the classifier over the training data,
//!    index every designated layer's activations.
//! 2. [`DkNNScorer::calibrate`] — optional held-out pass deriving
//!    score-normalization statistics.
//! 3. [`PerturbationRanker::rank`] — score every single-token-removed
//!    variant of a probe and rank positions by how much their removal
//!    degrades the prediction.
//!
//! Exact and locality-sensitive-hashing index kinds share one query
//! contract; any model that implements [`ClassifierBackend`] plugs in.

#![deny(warnings)]
#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod data;
pub mod encoder;
pub mod error;
pub mod index;
pub mod interp;
pub mod scorer;
pub mod store;

pub use backend::{argmax_row, ClassifierBackend, ClassifierModel, ForwardPass};
pub use config::{DkNNConfig, IndexKind, LabelSource, LshParams, PerturbationMode, ScoringMode};
pub use data::{Example, ExampleId, TokenAttribution, Vocab};
pub use encoder::{BowClassifierConfig, BowMlpClassifier};
pub use error::{DkError, Result};
pub use index::{ExactIndex, LayerIndex, LshIndex, NeighborIndex};
pub use interp::leave_one_out::{
    normalize_two_sided, ImportanceRanking, PerturbationRanker, RankedPosition,
};
pub use scorer::{CalibrationStats, DkNNScorer, Prediction};
pub use store::{ActivationCollector, NeighborLabelStore, TrainingActivationSet};
