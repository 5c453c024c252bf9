// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-dknn.

/// Errors that can occur during index building, scoring, or ranking.
#[derive(Debug, thiserror::Error)]
pub enum DkError {
    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// Inconsistent activation dimensionality while building a layer index.
    #[error("index build error: {0}")]
    IndexBuild(String),

    /// Query issued against a layer index that holds no vectors, or a
    /// layer outside the built range.
    #[error("empty index: {0}")]
    EmptyIndex(String),

    /// `build` was called with zero training examples.
    #[error("training set is empty")]
    EmptyTrainingSet,

    /// Probe sequence too short to generate perturbation variants.
    ///
    /// Reported per probe; a batch of probes continues past it.
    #[error("sequence of length {len} is too short to perturb (minimum {min})")]
    DegenerateSequence {
        /// Length of the offending sequence (for hypothesis-only removal,
        /// the hypothesis length).
        len: usize,
        /// Minimum length the selected perturbation mode requires.
        min: usize,
    },

    /// Unrecognized or invalid scoring-mode configuration.
    #[error("unsupported scoring mode: {0}")]
    UnsupportedMode(String),

    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-dknn operations.
pub type Result<T> = std::result::Result<T, DkError>;
