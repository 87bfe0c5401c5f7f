//! # lgen-models
//!
//! Reference model-execution engine for lgen.
//!
//! Provides:
//! - **ModelManifest**: JSON description of a model (shape, weight seed, vocabulary)
//! - **Layers**: RMSNorm, RoPE, SwiGLU and cached attention
//! - **ReferenceModel / ReferenceCache**: a CPU transformer implementing the
//!   `lgen-engine` traits over a bounded `lgen-kv` cache
//! - **ReferenceLoader**: the `ModelLoader` for manifest files

pub mod layers;
pub mod manifest;
pub mod reference;

pub use manifest::{ManifestError, ModelConfig, ModelManifest, VocabSpec, MAX_PARAMETERS};
pub use reference::{ReferenceCache, ReferenceLoader, ReferenceModel};
