//! Reference model manifest.
//!
//! A manifest is a small JSON document naming the transformer shape, the
//! weight seed and the vocabulary pieces. Weights are not stored; they are
//! regenerated from the seed, so the same manifest always yields the same
//! model.
//!
//! ```json
//! {
//!   "name": "tiny",
//!   "seed": 7,
//!   "config": { "d_model": 32, "n_heads": 4, "n_layers": 2 },
//!   "vocab": { "pieces": ["th", "he", "the"] }
//! }
//! ```

use std::path::Path;

use lgen_engine::GenError;
use serde::{Deserialize, Serialize};

/// Error type for manifest loading.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported model shape: {0}")]
    Invalid(String),
}

impl From<ManifestError> for GenError {
    fn from(err: ManifestError) -> Self {
        GenError::ModelLoad(err.to_string())
    }
}

/// Transformer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Hidden dimension.
    #[serde(default = "default_d_model")]
    pub d_model: usize,

    /// Attention heads; `d_model / n_heads` must be even for RoPE.
    #[serde(default = "default_n_heads")]
    pub n_heads: usize,

    #[serde(default = "default_n_layers")]
    pub n_layers: usize,

    /// Feedforward hidden dimension.
    #[serde(default = "default_d_ff")]
    pub d_ff: usize,

    #[serde(default = "default_rope_base")]
    pub rope_base: f32,

    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

/// Most weights a reference manifest may ask for (16 GiB of `f32`).
pub const MAX_PARAMETERS: usize = u32::MAX as usize;

fn default_d_model() -> usize {
    32
}
fn default_n_heads() -> usize {
    4
}
fn default_n_layers() -> usize {
    2
}
fn default_d_ff() -> usize {
    64
}
fn default_rope_base() -> f32 {
    10000.0
}
fn default_norm_eps() -> f32 {
    1e-5
}
fn default_max_context() -> usize {
    4096
}
fn default_name() -> String {
    "reference".to_string()
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: default_d_model(),
            n_heads: default_n_heads(),
            n_layers: default_n_layers(),
            d_ff: default_d_ff(),
            rope_base: default_rope_base(),
            norm_eps: default_norm_eps(),
        }
    }
}

impl ModelConfig {
    /// Derived property: dimension per head
    pub fn head_dim(&self) -> usize {
        self.d_model / self.n_heads
    }

    /// Weights needed for a vocabulary of `vocab` entries, or `None` on overflow.
    pub fn parameter_count(&self, vocab: usize) -> Option<usize> {
        let d = self.d_model;
        let attention = d.checked_mul(d)?.checked_mul(4)?;
        let ffn = d.checked_mul(self.d_ff)?.checked_mul(3)?;
        let norms = d.checked_mul(2)?;
        let per_layer = attention.checked_add(ffn)?.checked_add(norms)?;
        vocab
            .checked_mul(d)?
            .checked_add(per_layer.checked_mul(self.n_layers)?)?
            .checked_add(d)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.d_model == 0 || self.n_heads == 0 || self.n_layers == 0 || self.d_ff == 0 {
            return Err(ManifestError::Invalid(
                "dimensions must be non-zero".to_string(),
            ));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ManifestError::Invalid(format!(
                "d_model {} is not divisible by n_heads {}",
                self.d_model, self.n_heads
            )));
        }
        if self.head_dim() % 2 != 0 {
            return Err(ManifestError::Invalid(format!(
                "head_dim {} must be even",
                self.head_dim()
            )));
        }
        if !(self.rope_base.is_finite() && self.rope_base > 0.0) {
            return Err(ManifestError::Invalid("rope_base must be positive".to_string()));
        }
        Ok(())
    }
}

/// Vocabulary section: multi-byte pieces layered over the byte tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VocabSpec {
    #[serde(default)]
    pub pieces: Vec<String>,
}

/// Root manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    #[serde(default = "default_name")]
    pub name: String,

    /// Seed the weights are generated from.
    #[serde(default)]
    pub seed: u64,

    #[serde(default)]
    pub config: ModelConfig,

    /// Largest context window a cache may be created with.
    #[serde(default = "default_max_context")]
    pub max_context: usize,

    #[serde(default)]
    pub vocab: VocabSpec,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            name: default_name(),
            seed: 0,
            config: ModelConfig::default(),
            max_context: default_max_context(),
            vocab: VocabSpec::default(),
        }
    }
}

impl ModelManifest {
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: Self = serde_json::from_str(json)?;
        manifest.config.validate()?;
        Ok(manifest)
    }

    pub fn from_path(path: &Path) -> Result<Self, ManifestError> {
        let json = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> String {
        // Plain data with string keys; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_config(mut self, config: ModelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_max_context(mut self, max_context: usize) -> Self {
        self.max_context = max_context;
        self
    }

    pub fn with_pieces<I, S>(mut self, pieces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.vocab.pieces = pieces.into_iter().map(Into::into).collect();
        self
    }
}
