//! llama.cpp engine: GGUF loading, vocabulary and evaluation via llama-cpp-2.
//!
//! llama.cpp keeps process-wide state that may only be initialized once at a
//! time. It lives in a [`BackendSlot`] leased by every loaded model, so the
//! backend is freed together with the last model that used it.

use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use lgen_engine::{
    EvalCache, ExecutionModel, GenError, ModelInfo, ModelLoader, ModelSpec, Result, TokenId,
    Tokenizer, TokenizerError,
};
use lgen_tokenizer::TokenizerResult;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::token::LlamaToken;
use tracing::info;

use crate::backend::{BackendLease, BackendSlot};
use crate::context::GenerationContext;
use crate::request::ContextParams;

static LLAMA_BACKEND: BackendSlot<LlamaBackend> = BackendSlot::new();

/// Tokens per `decode` call; larger evaluations are split.
const N_BATCH: usize = 512;

/// Field order matters: the model drops before the backend lease.
struct Shared {
    model: LlamaModel,
    backend: BackendLease<LlamaBackend>,
}

/// A GGUF model loaded through llama.cpp.
pub struct LlamaCppModel {
    shared: Arc<Shared>,
    name: String,
}

/// llama.cpp context plus the scores of its last evaluated position.
pub struct LlamaCppCache {
    // Must be declared before `_shared`: the context borrows the model.
    ctx: LlamaContext<'static>,
    n_past: usize,
    logits: Option<Vec<f32>>,
    _shared: Arc<Shared>,
}

// SAFETY: the context is only reached through `&mut LlamaCppCache`, so it is
// never used from two threads at once.
unsafe impl Send for LlamaCppCache {}

impl EvalCache for LlamaCppCache {
    fn len(&self) -> usize {
        self.n_past
    }

    fn capacity(&self) -> usize {
        self.ctx.n_ctx() as usize
    }

    fn clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.n_past = 0;
        self.logits = None;
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

impl Tokenizer for LlamaCppModel {
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<TokenId>> {
        let bos = if add_bos { AddBos::Always } else { AddBos::Never };
        let tokens = self
            .shared
            .model
            .str_to_token(text, bos)
            .map_err(|e| TokenizerError::EncodingError(e.to_string()))?;
        Ok(tokens.iter().map(|t| t.0).collect())
    }

    fn token_bytes(&self, token: TokenId, out: &mut Vec<u8>) -> TokenizerResult<()> {
        if token < 0 || token as usize >= self.vocab_size() {
            return Err(TokenizerError::InvalidToken(token));
        }
        let bytes = self
            .shared
            .model
            .token_to_piece_bytes(LlamaToken(token), 128, false, None)
            .map_err(|e| TokenizerError::DecodingError(e.to_string()))?;
        out.extend_from_slice(&bytes);
        Ok(())
    }

    fn vocab_size(&self) -> usize {
        self.shared.model.n_vocab().max(0) as usize
    }

    fn bos_token(&self) -> Option<TokenId> {
        Some(self.shared.model.token_bos().0)
    }

    fn eos_token(&self) -> TokenId {
        self.shared.model.token_eos().0
    }
}

impl ExecutionModel for LlamaCppModel {
    type Cache = LlamaCppCache;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            vocab_size: self.vocab_size(),
            max_context: self.shared.model.n_ctx_train() as usize,
        }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        self
    }

    fn new_cache(&self, context_size: usize) -> Result<LlamaCppCache> {
        let n_ctx = u32::try_from(context_size)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or_else(|| GenError::ContextInit(format!("invalid context size {}", context_size)))?;
        let params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(N_BATCH as u32);

        // SAFETY: the model lives on the heap inside `Shared`, and the cache
        // keeps that `Arc` alive until after the context has been dropped.
        let model: &'static LlamaModel = unsafe { &*(&self.shared.model as *const LlamaModel) };
        let ctx = model
            .new_context(&self.shared.backend, params)
            .map_err(|e| GenError::ContextInit(e.to_string()))?;

        Ok(LlamaCppCache {
            ctx,
            n_past: 0,
            logits: None,
            _shared: Arc::clone(&self.shared),
        })
    }

    fn evaluate(&self, cache: &mut LlamaCppCache, batch: &[TokenId]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > cache.remaining() {
            return Err(GenError::Evaluation(format!(
                "batch of {} exceeds remaining context {}",
                batch.len(),
                cache.remaining()
            )));
        }

        let vocab = self.vocab_size();
        for chunk in batch.chunks(N_BATCH) {
            let mut llama_batch = LlamaBatch::new(chunk.len(), 1);
            for (i, &token) in chunk.iter().enumerate() {
                if token < 0 || token as usize >= vocab {
                    return Err(GenError::InvariantViolation(format!(
                        "token {} outside vocabulary of {}",
                        token, vocab
                    )));
                }
                let is_last = i == chunk.len() - 1;
                llama_batch
                    .add(LlamaToken(token), (cache.n_past + i) as i32, &[0], is_last)
                    .map_err(|e| GenError::Evaluation(format!("batch add: {}", e)))?;
            }

            cache
                .ctx
                .decode(&mut llama_batch)
                .map_err(|e| GenError::Evaluation(format!("decode: {}", e)))?;
            cache.n_past += chunk.len();
            cache.logits = Some(cache.ctx.get_logits_ith((chunk.len() - 1) as i32).to_vec());
        }
        Ok(())
    }
}

/// Loads GGUF files.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlamaCppLoader {
    /// Layers offloaded to the GPU; `0` keeps everything on the CPU.
    pub n_gpu_layers: u32,
}

impl LlamaCppLoader {
    pub fn with_gpu_layers(mut self, n: u32) -> Self {
        self.n_gpu_layers = n;
        self
    }
}

impl ModelLoader for LlamaCppLoader {
    type Model = LlamaCppModel;

    fn load(&self, spec: &ModelSpec) -> Result<LlamaCppModel> {
        if !spec.path.exists() {
            return Err(GenError::ModelLoad(format!(
                "GGUF file not found: {}",
                spec.path.display()
            )));
        }

        let backend = LLAMA_BACKEND.acquire(|| {
            LlamaBackend::init().map_err(|e| GenError::ModelLoad(format!("backend init: {}", e)))
        })?;
        let params = LlamaModelParams::default().with_n_gpu_layers(self.n_gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &spec.path, &params)
            .map_err(|e| GenError::ModelLoad(e.to_string()))?;

        let name = spec
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.path.display().to_string());
        info!(
            path = %spec.path.display(),
            vocab_size = model.n_vocab(),
            gpu_layers = self.n_gpu_layers,
            "loaded GGUF model"
        );

        Ok(LlamaCppModel {
            shared: Arc::new(Shared {
                model,
                backend,
            }),
            name,
        })
    }
}

impl GenerationContext<LlamaCppModel> {
    /// Load a GGUF model on the CPU and allocate its context.
    pub fn init(path: impl AsRef<Path>, params: ContextParams) -> Result<Self> {
        Self::init_with(&LlamaCppLoader::default(), path, params)
    }
}
