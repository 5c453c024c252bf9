// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference classifier backend: bag-of-words encoder with an MLP head.
//!
//! Encodes a sequence by averaging its token embeddings, feeds the pooled
//! vector through `mlp_layers` ReLU layers, and projects to class
//! probabilities.  The designated activation layers are the pooled
//! bag-of-words vector plus each MLP hidden layer.
//!
//! This is boundary glue so the pipeline runs end-to-end out of the box;
//! any [`ClassifierBackend`] implementation can replace it.  Weights
//! arrive through a [`VarBuilder`] — training them is out of scope here.

use candle_core::{Device, Module, Tensor};
use candle_nn::{Embedding, Linear, VarBuilder};

use crate::backend::{ClassifierBackend, ClassifierModel, ForwardPass};
use crate::error::{DkError, Result};

// ---------------------------------------------------------------------------
// BowClassifierConfig
// ---------------------------------------------------------------------------

/// Configuration for [`BowMlpClassifier`].
#[derive(Debug, Clone, Copy)]
#[must_use]
pub struct BowClassifierConfig {
    /// Vocabulary size of the embedding table.
    pub vocab_size: usize,
    /// Embedding (and MLP) width.
    pub embed_dim: usize,
    /// Number of ReLU MLP layers after pooling.
    pub mlp_layers: usize,
    /// Number of output classes.
    pub n_classes: usize,
}

impl BowClassifierConfig {
    /// Create a config with the historical defaults: 300 embedding units
    /// and 3 MLP layers.
    pub const fn new(vocab_size: usize, n_classes: usize) -> Self {
        Self {
            vocab_size,
            embed_dim: 300,
            mlp_layers: 3,
            n_classes,
        }
    }

    /// Override the embedding width.
    pub const fn with_embed_dim(mut self, embed_dim: usize) -> Self {
        self.embed_dim = embed_dim;
        self
    }

    /// Override the MLP depth.
    pub const fn with_mlp_layers(mut self, mlp_layers: usize) -> Self {
        self.mlp_layers = mlp_layers;
        self
    }
}

// ---------------------------------------------------------------------------
// BowMlpClassifier
// ---------------------------------------------------------------------------

/// Bag-of-words + MLP sequence classifier.
pub struct BowMlpClassifier {
    /// Token embedding table, `[vocab_size, embed_dim]`.
    embed: Embedding,
    /// ReLU MLP layers, each `[embed_dim, embed_dim]`.
    hidden: Vec<Linear>,
    /// Output projection, `[embed_dim, n_classes]`.
    output: Linear,
    /// Number of output classes.
    n_classes: usize,
    /// Device the parameters live on.
    device: Device,
}

impl BowMlpClassifier {
    /// Load classifier weights from a [`VarBuilder`].
    ///
    /// Weight names: `embed`, `mlp.{i}` for each hidden layer, `output`.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Model`] if weight loading fails.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn load(config: &BowClassifierConfig, device: &Device, vb: VarBuilder<'_>) -> Result<Self> {
        let embed = candle_nn::embedding(config.vocab_size, config.embed_dim, vb.pp("embed"))?;
        let mut hidden = Vec::with_capacity(config.mlp_layers);
        for i in 0..config.mlp_layers {
            hidden.push(candle_nn::linear(
                config.embed_dim,
                config.embed_dim,
                vb.pp(format!("mlp.{i}")),
            )?);
        }
        let output = candle_nn::linear(config.embed_dim, config.n_classes, vb.pp("output"))?;
        Ok(Self {
            embed,
            hidden,
            output,
            n_classes: config.n_classes,
            device: device.clone(),
        })
    }

    /// Wrap this backend in a [`ClassifierModel`].
    #[must_use]
    pub fn into_model(self) -> ClassifierModel {
        let device = self.device.clone();
        ClassifierModel::new(Box::new(self), device)
    }

    /// Mean-pool one sequence's token embeddings.
    ///
    /// # Shapes
    /// - returns: `[embed_dim]`
    fn pool(&self, sequence: &[u32]) -> Result<Tensor> {
        if sequence.is_empty() {
            return Err(DkError::Config("cannot encode an empty sequence".into()));
        }
        let ids = Tensor::new(sequence, &self.device)?;
        let embedded = self.embed.forward(&ids)?;
        Ok(embedded.mean(0)?)
    }
}

impl ClassifierBackend for BowMlpClassifier {
    fn num_classes(&self) -> usize {
        self.n_classes
    }

    fn num_activation_layers(&self) -> usize {
        1 + self.hidden.len()
    }

    fn forward(&self, batch: &[Vec<u32>]) -> Result<ForwardPass> {
        if batch.is_empty() {
            return Err(DkError::Config("forward pass over an empty batch".into()));
        }
        let pooled: Vec<Tensor> = batch
            .iter()
            .map(|sequence| self.pool(sequence))
            .collect::<Result<_>>()?;
        let mut x = Tensor::stack(&pooled, 0)?;

        let mut activations = Vec::with_capacity(self.num_activation_layers());
        activations.push(x.clone());
        for layer in &self.hidden {
            x = layer.forward(&x)?.relu()?;
            activations.push(x.clone());
        }

        let logits = self.output.forward(&x)?;
        let probabilities = candle_nn::ops::softmax_last_dim(&logits)?;
        Ok(ForwardPass::new(probabilities, activations))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
