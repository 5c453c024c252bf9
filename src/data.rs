// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dataset and visualization boundary types.
//!
//! Training, held-out, and test data arrive as [`Example`]s — token-id
//! sequences with a label, carrying an explicit identifier so batched
//! results are always re-attributed by id, never by arrival order.
//! [`Vocab`] maps token ids back to surface strings for rendering; it
//! plays no part in scoring.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{DkError, Result};

/// Identifier of a training example — the identifier space every layer
/// index draws its neighbor ids from.
pub type ExampleId = usize;

// ---------------------------------------------------------------------------
// Example
// ---------------------------------------------------------------------------

/// One labeled token-id sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Example {
    /// Stable identifier, unique within its dataset split.
    pub id: ExampleId,
    /// Token ids, in surface order.
    pub tokens: Vec<u32>,
    /// Ground-truth class label.
    pub label: usize,
}

impl Example {
    /// Create a new example.
    #[must_use]
    pub const fn new(id: ExampleId, tokens: Vec<u32>, label: usize) -> Self {
        Self { id, tokens, label }
    }

    /// Sequence length in tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the sequence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Vocab
// ---------------------------------------------------------------------------

/// Token id → surface string mapping.
///
/// Used only when rendering attributions; scoring never consults it.
/// Unknown ids decode to the `<unk>` marker.
///
/// # Example
///
/// ```
/// use candle_dknn::Vocab;
///
/// let json = serde_json::json!({"the": 0, "movie": 1, "great": 2});
/// let vocab = Vocab::from_word_map(&json).unwrap();
/// assert_eq!(vocab.decode(1), "movie");
/// assert_eq!(vocab.decode(99), "<unk>");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Vocab {
    /// id → surface string.
    words: HashMap<u32, String>,
}

/// Decoded stand-in for ids absent from the vocabulary.
const UNK: &str = "<unk>";

impl Vocab {
    /// Build from an id → word mapping.
    #[must_use]
    pub fn from_id_map(words: HashMap<u32, String>) -> Self {
        Self { words }
    }

    /// Build from a word → id JSON object (the on-disk `vocab.json`
    /// format), inverting it.
    ///
    /// # Errors
    ///
    /// Returns [`DkError::Config`] if the value is not an object or an id
    /// does not fit in `u32`.
    pub fn from_word_map(json: &Value) -> Result<Self> {
        let object = json
            .as_object()
            .ok_or_else(|| DkError::Config("vocab must be a JSON object".into()))?;
        let mut words = HashMap::with_capacity(object.len());
        for (word, id) in object {
            let id = id
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    DkError::Config(format!("vocab entry '{word}' has an invalid id"))
                })?;
            words.insert(id, word.clone());
        }
        Ok(Self { words })
    }

    /// Decode a token id to its surface string, or `<unk>`.
    #[must_use]
    pub fn decode(&self, id: u32) -> &str {
        self.words.get(&id).map_or(UNK, String::as_str)
    }

    /// Number of known tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether the vocabulary is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TokenAttribution
// ---------------------------------------------------------------------------

/// One (surface token, normalized score) pair for visualization.
///
/// Scores lie in `[0, 1]` and are aligned to the probe's original token
/// order — directly usable as a color-map coordinate by any renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenAttribution {
    /// Surface form of the token.
    pub token: String,
    /// Normalized importance in `[0, 1]`; `0.5` is neutral.
    pub score: f32,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
