// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core backend trait and model wrapper.
//!
//! [`ClassifierBackend`] is the forward-pass boundary the scorer consumes:
//! given a batch of token-id sequences it returns the output distribution
//! plus one activation vector per designated layer per example.
//! [`ClassifierModel`] wraps a backend with device metadata.
//!
//! Backends must be deterministic: dropout and every other stochastic
//! regularization stays off for build, calibration, prediction, and all
//! perturbation scoring.

use candle_core::{DType, Device, Tensor};

use crate::error::{DkError, Result};

// ---------------------------------------------------------------------------
// ForwardPass
// ---------------------------------------------------------------------------

/// Output of one batched forward pass.
///
/// Tensors stay on the backend's device; the scorer pulls `f32` rows out
/// on demand when feeding the index layer.
#[derive(Debug)]
pub struct ForwardPass {
    /// Output distribution, shape `[batch, n_classes]`.  Rows are
    /// probabilities (softmax already applied).
    probabilities: Tensor,
    /// One tensor per designated layer, each shape `[batch, dim]`.
    /// Layer dimensionality may differ between layers but is fixed per
    /// layer for the lifetime of an index.
    activations: Vec<Tensor>,
}

impl ForwardPass {
    /// Create a forward-pass result from the output distribution and the
    /// designated-layer activations.
    #[must_use]
    pub fn new(probabilities: Tensor, activations: Vec<Tensor>) -> Self {
        Self {
            probabilities,
            activations,
        }
    }

    /// The output distribution tensor, shape `[batch, n_classes]`.
    #[must_use]
    pub const fn probabilities(&self) -> &Tensor {
        &self.probabilities
    }

    /// Number of designated layers captured.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.activations.len()
    }

    /// Extract the output distribution as `f32` rows, one per example.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Model`] if dtype conversion or extraction fails.
    pub fn probability_rows(&self) -> Result<Vec<Vec<f32>>> {
        Ok(self.probabilities.to_dtype(DType::F32)?.to_vec2()?)
    }

    /// Extract one layer's activations as `f32` rows, one per example.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::EmptyIndex`] if `layer` is out of range and
    /// [`DkError::Model`] if extraction fails.
    pub fn activation_rows(&self, layer: usize) -> Result<Vec<Vec<f32>>> {
        let tensor = self.activations.get(layer).ok_or_else(|| {
            DkError::EmptyIndex(format!(
                "layer {layer} not captured (have {})",
                self.activations.len()
            ))
        })?;
        Ok(tensor.to_dtype(DType::F32)?.to_vec2()?)
    }
}

// ---------------------------------------------------------------------------
// ClassifierBackend trait
// ---------------------------------------------------------------------------

/// Forward-pass boundary between the classifier and the scoring core.
///
/// Implementing this trait is the only requirement for plugging a model
/// into the deep-kNN pipeline.  The backend owns its parameters and
/// device placement; the core never retrains or mutates it.
///
/// The one optional capability, [`onehot_gradient`](Self::onehot_gradient),
/// backs the gradient-saliency scoring mode and defaults to an error for
/// backends without input-gradient access.
pub trait ClassifierBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of output classes.
    fn num_classes(&self) -> usize;

    /// Number of designated activation layers exposed per forward pass.
    fn num_activation_layers(&self) -> usize;

    // --- Core forward pass -----------------------------------------------

    /// Run the classifier over a batch of token-id sequences.
    ///
    /// Must be a pure function of (parameters, input): stochastic
    /// regularization is off, and repeated calls on the same batch return
    /// identical outputs.
    ///
    /// # Shapes
    /// - `batch`: one token-id sequence per example (lengths may differ)
    /// - returns: [`ForwardPass`] with probabilities `[batch, n_classes]`
    ///   and `num_activation_layers()` activation tensors `[batch, dim]`
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Model`] on tensor operation failures.
    fn forward(&self, batch: &[Vec<u32>]) -> Result<ForwardPass>;

    // --- Optional capabilities -------------------------------------------

    /// Per-position one-hot input gradient magnitudes for one sequence.
    ///
    /// Backs the gradient-saliency scoring mode.  Values are expected to
    /// be locally normalized by the backend.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::UnsupportedMode`] if the backend does not
    /// support input gradients.
    fn onehot_gradient(&self, _sequence: &[u32]) -> Result<Vec<f32>> {
        Err(DkError::UnsupportedMode(
            "onehot gradient not supported by this backend".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// ClassifierModel
// ---------------------------------------------------------------------------

/// High-level model wrapper combining a backend with device metadata.
///
/// Constructed once at startup and shared read-only; the scorer takes
/// ownership at build time so every query runs against the parameters the
/// indices were built from.
pub struct ClassifierModel {
    /// The underlying classifier backend.
    // TRAIT_OBJECT: heterogeneous classifier backends require dynamic dispatch
    backend: Box<dyn ClassifierBackend>,
    /// The device this model lives on.
    device: Device,
}

impl ClassifierModel {
    /// Wrap an existing backend.
    // TRAIT_OBJECT: heterogeneous classifier backends require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn ClassifierBackend>, device: Device) -> Self {
        Self { backend, device }
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Number of output classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.backend.num_classes()
    }

    /// Number of designated activation layers.
    #[must_use]
    pub fn num_activation_layers(&self) -> usize {
        self.backend.num_activation_layers()
    }

    /// Run a deterministic forward pass over a batch of sequences.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn forward(&self, batch: &[Vec<u32>]) -> Result<ForwardPass> {
        let pass = self.backend.forward(batch)?;
        if pass.num_layers() != self.backend.num_activation_layers() {
            return Err(DkError::Model(candle_core::Error::Msg(format!(
                "backend returned {} activation layers, declared {}",
                pass.num_layers(),
                self.backend.num_activation_layers()
            ))));
        }
        Ok(pass)
    }

    /// Per-position one-hot gradient magnitudes for one sequence.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying backend.
    pub fn onehot_gradient(&self, sequence: &[u32]) -> Result<Vec<f32>> {
        self.backend.onehot_gradient(sequence)
    }

    /// Access the underlying backend (e.g., for backend-specific methods).
    // TRAIT_OBJECT: caller needs dynamic dispatch for backend-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn ClassifierBackend {
        &*self.backend
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Index of the row's maximum, lowest index winning ties.
///
/// Deterministic tie-breaking keeps repeated predictions identical.
/// Returns `None` for an empty row.
#[must_use]
pub fn argmax_row(row: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in row.iter().enumerate() {
        match best {
            Some((_, top)) if value <= top => {}
            _ => best = Some((idx, value)),
        }
    }
    best.map(|(idx, _)| idx)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
