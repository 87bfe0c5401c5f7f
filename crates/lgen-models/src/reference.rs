//! The reference model-execution engine.
//!
//! A small pre-norm transformer (RMSNorm, RoPE attention, SwiGLU) whose
//! weights are generated from the manifest seed. The output is meaningless
//! as language but fully deterministic, which makes it the engine the
//! generation core is tested against end to end.

use lgen_engine::{
    EvalCache, ExecutionModel, GenError, ModelInfo, ModelLoader, ModelSpec, Result, Tokenizer,
};
use lgen_kv::SessionKVCache;
use lgen_tokenizer::{ByteLevelTokenizer, TokenId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::layers::{attend, dot, uniform, Linear, RMSNorm, RoPE, SwiGLU};
use crate::manifest::{ModelConfig, ModelManifest, MAX_PARAMETERS};

#[derive(Debug, Clone)]
struct Block {
    attn_norm: RMSNorm,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    ffn_norm: RMSNorm,
    ffn: SwiGLU,
}

impl Block {
    fn random(rng: &mut StdRng, config: &ModelConfig) -> Option<Self> {
        let d = config.d_model;
        Some(Self {
            attn_norm: RMSNorm::new(d, config.norm_eps),
            wq: Linear::random(rng, d, d)?,
            wk: Linear::random(rng, d, d)?,
            wv: Linear::random(rng, d, d)?,
            wo: Linear::random(rng, d, d)?,
            ffn_norm: RMSNorm::new(d, config.norm_eps),
            ffn: SwiGLU::random(rng, d, config.d_ff)?,
        })
    }
}

/// Loaded reference model. Immutable; share it freely.
#[derive(Debug, Clone)]
pub struct ReferenceModel {
    name: String,
    config: ModelConfig,
    max_context: usize,
    tokenizer: ByteLevelTokenizer,
    /// `[vocab, d_model]`, tied with the output projection.
    embedding: Vec<f32>,
    blocks: Vec<Block>,
    final_norm: RMSNorm,
    rope: RoPE,
}

impl ReferenceModel {
    /// Build the model a manifest describes.
    pub fn from_manifest(manifest: &ModelManifest) -> Result<Self> {
        manifest.config.validate()?;
        let config = manifest.config.clone();
        let tokenizer = ByteLevelTokenizer::with_pieces(manifest.vocab.pieces.iter().cloned());
        let vocab = tokenizer.vocab_size();
        let too_large = || {
            GenError::ModelLoad(format!(
                "model {} is too large for the reference engine ({} layers of d_model {}, d_ff {})",
                manifest.name, config.n_layers, config.d_model, config.d_ff
            ))
        };
        match config.parameter_count(vocab) {
            Some(n) if n <= MAX_PARAMETERS => {}
            _ => return Err(too_large()),
        }

        let mut rng = StdRng::seed_from_u64(manifest.seed);
        let embedding = config
            .d_model
            .checked_mul(vocab)
            .and_then(|len| uniform(&mut rng, len, 1.0))
            .ok_or_else(too_large)?;
        let blocks = (0..config.n_layers)
            .map(|_| Block::random(&mut rng, &config))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(too_large)?;

        Ok(Self {
            name: manifest.name.clone(),
            final_norm: RMSNorm::new(config.d_model, config.norm_eps),
            rope: RoPE::new(config.head_dim(), config.rope_base),
            max_context: manifest.max_context,
            config,
            tokenizer,
            embedding,
            blocks,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn embed(&self, token: TokenId) -> Vec<f32> {
        let d = self.config.d_model;
        let row = token as usize * d;
        self.embedding[row..row + d].to_vec()
    }

    /// Run one token through every block, appending its K/V to the cache.
    /// Returns the final hidden state.
    fn forward_token(
        &self,
        kv: &mut SessionKVCache,
        token: TokenId,
        pos: usize,
    ) -> std::result::Result<Vec<f32>, lgen_kv::KVError> {
        let n_heads = self.config.n_heads;
        let head_dim = self.config.head_dim();
        let mut x = self.embed(token);

        for (layer, block) in self.blocks.iter().enumerate() {
            let h = block.attn_norm.forward(&x);
            let mut q = block.wq.forward(&h);
            let mut k = block.wk.forward(&h);
            let v = block.wv.forward(&h);
            self.rope.rotate(&mut q, pos);
            self.rope.rotate(&mut k, pos);

            kv.append(layer, &k, &v)?;
            let cached = kv.layer(layer)?;
            let attn = attend(&q, cached.keys(), cached.values(), n_heads, head_dim);
            for (xi, oi) in x.iter_mut().zip(block.wo.forward(&attn)) {
                *xi += oi;
            }

            let h = block.ffn_norm.forward(&x);
            for (xi, fi) in x.iter_mut().zip(block.ffn.forward(&h)) {
                *xi += fi;
            }
        }

        Ok(self.final_norm.forward(&x))
    }

    fn project(&self, hidden: &[f32]) -> Vec<f32> {
        self.embedding
            .chunks_exact(self.config.d_model)
            .map(|row| dot(row, hidden))
            .collect()
    }
}

/// Evaluation cache for [`ReferenceModel`].
#[derive(Debug)]
pub struct ReferenceCache {
    kv: SessionKVCache,
    logits: Option<Vec<f32>>,
}

impl EvalCache for ReferenceCache {
    fn len(&self) -> usize {
        self.kv.seq_len()
    }

    fn capacity(&self) -> usize {
        self.kv.capacity()
    }

    fn clear(&mut self) {
        self.kv.clear();
        self.logits = None;
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

impl ReferenceCache {
    /// Bytes held by the KV buffers.
    pub fn memory_bytes(&self) -> usize {
        self.kv.memory_bytes()
    }
}

impl ExecutionModel for ReferenceModel {
    type Cache = ReferenceCache;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            vocab_size: self.tokenizer.vocab_size(),
            max_context: self.max_context,
        }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn new_cache(&self, context_size: usize) -> Result<ReferenceCache> {
        if context_size == 0 || context_size > self.max_context {
            return Err(GenError::ContextInit(format!(
                "context size {} outside 1..={} for model {}",
                context_size, self.max_context, self.name
            )));
        }
        let kv = SessionKVCache::new(
            self.config.n_layers,
            context_size,
            self.config.n_heads,
            self.config.head_dim(),
        )
        .map_err(|e| GenError::ContextInit(e.to_string()))?;
        debug!(
            context_size,
            bytes = kv.memory_bytes(),
            "allocated reference KV cache"
        );
        Ok(ReferenceCache { kv, logits: None })
    }

    fn evaluate(&self, cache: &mut ReferenceCache, batch: &[TokenId]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let vocab = self.tokenizer.vocab_size();
        if let Some(&bad) = batch.iter().find(|&&t| t < 0 || t as usize >= vocab) {
            return Err(GenError::InvariantViolation(format!(
                "token {} outside vocabulary of {}",
                bad, vocab
            )));
        }
        cache
            .kv
            .ensure_capacity(batch.len())
            .map_err(|e| GenError::Evaluation(e.to_string()))?;

        let start = cache.kv.seq_len();
        let mut hidden = Vec::new();
        for (offset, &token) in batch.iter().enumerate() {
            match self.forward_token(&mut cache.kv, token, start + offset) {
                Ok(h) => hidden = h,
                Err(e) => {
                    cache.kv.truncate(start);
                    return Err(GenError::Evaluation(e.to_string()));
                }
            }
        }

        // Only the last position's scores are ever consumed.
        cache.logits = Some(self.project(&hidden));
        Ok(())
    }
}

/// Loads [`ReferenceModel`]s from JSON manifests.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceLoader;

impl ModelLoader for ReferenceLoader {
    type Model = ReferenceModel;

    fn load(&self, spec: &ModelSpec) -> Result<ReferenceModel> {
        let manifest = ModelManifest::from_path(&spec.path)?;
        let model = ReferenceModel::from_manifest(&manifest)?;
        info!(
            path = %spec.path.display(),
            name = %manifest.name,
            vocab_size = model.tokenizer.vocab_size(),
            n_layers = manifest.config.n_layers,
            "loaded reference model"
        );
        Ok(model)
    }
}
