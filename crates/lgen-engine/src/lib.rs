//! # lgen-engine
//!
//! The "narrow waist" of the lgen stack. Defines the capability traits a
//! model-execution engine must provide and the error taxonomy every other
//! crate reports through. The generation core is written against these
//! traits only, so the reference engine, llama.cpp, or a test double can be
//! swapped without touching prefill or decode.
//!
//! ## Design Notes
//!
//! ### Model vs. cache
//! An [`ExecutionModel`] is immutable once loaded (weights + vocabulary) and
//! may be shared. All mutable attention history lives in its associated
//! [`EvalCache`], which is bounded by the context size chosen when it was
//! created. Evaluation takes the cache by `&mut`, so a single cache can never
//! be advanced by two calls at once.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::path::PathBuf;

pub use lgen_tokenizer::{TokenId, Tokenizer, TokenizerError};

pub type Result<T> = std::result::Result<T, GenError>;

/// Top-level error type for all engine operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenError {
    /// Model file missing, unreadable, corrupt or unsupported.
    #[error("model loading failed: {0}")]
    ModelLoad(String),
    /// The engine could not build an evaluation cache (e.g. resource exhaustion).
    #[error("context initialization failed: {0}")]
    ContextInit(String),
    /// The engine failed while evaluating a prefill batch or decode step.
    #[error("evaluation failed: {0}")]
    Evaluation(String),
    /// Programming error: freed context reuse, out-of-range token.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    /// A request parameter is outside its documented range.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<TokenizerError> for GenError {
    fn from(err: TokenizerError) -> Self {
        match err {
            TokenizerError::EncodingError(msg) => GenError::InvalidRequest(msg),
            other => GenError::InvariantViolation(other.to_string()),
        }
    }
}

/// Specification for loading a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub context_size: usize,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, context_size: usize) -> Self {
        Self {
            path: path.into(),
            context_size,
        }
    }
}

/// Static description of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Display name (manifest name or file name).
    pub name: String,
    /// Vocabulary size; every score vector has exactly this length.
    pub vocab_size: usize,
    /// Largest context the model can be evaluated with.
    pub max_context: usize,
}

/// Mutable per-context attention history (the KV cache).
///
/// Invariant: `len() <= capacity()`. An engine must refuse to grow past
/// capacity rather than silently drop history.
pub trait EvalCache: Send {
    /// Number of positions currently held.
    fn len(&self) -> usize;

    /// Maximum number of positions (the context size).
    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions still available before the window is full.
    fn remaining(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    /// Drop all history. Afterwards `len() == 0` and `logits()` is `None`.
    fn clear(&mut self);

    /// Scores over the vocabulary for the position after the last evaluated
    /// token, or `None` if nothing has been evaluated since the last clear.
    fn logits(&self) -> Option<&[f32]>;
}

/// The model-execution capability: "evaluate tokens, return next-token scores".
pub trait ExecutionModel: Send + Sync {
    type Cache: EvalCache;

    /// Static model description.
    fn info(&self) -> ModelInfo;

    /// The vocabulary bundled with this model.
    fn tokenizer(&self) -> &dyn Tokenizer;

    /// Allocate an empty evaluation cache holding up to `context_size` positions.
    ///
    /// Failures are reported as [`GenError::ContextInit`].
    fn new_cache(&self, context_size: usize) -> Result<Self::Cache>;

    /// Evaluate `batch` at the cache's current position.
    ///
    /// On success the cache has advanced by `batch.len()` and its logits
    /// describe the position after the batch. Failures, including running
    /// out of capacity, are reported as [`GenError::Evaluation`].
    fn evaluate(&self, cache: &mut Self::Cache, batch: &[TokenId]) -> Result<()>;
}

/// Loads models of one backend from disk.
pub trait ModelLoader {
    type Model: ExecutionModel;

    /// Load weights and vocabulary. Failures are [`GenError::ModelLoad`].
    fn load(&self, spec: &ModelSpec) -> Result<Self::Model>;
}
