//! Generation context: one loaded model plus its evaluation cache.
//!
//! A [`GenerationContext`] owns both halves exclusively. [`free`] releases
//! them (cache first, then model) and may be called any number of times;
//! dropping the context frees it too. Every later generation call fails
//! with [`GenError::InvariantViolation`].
//!
//! [`free`]: GenerationContext::free

use std::path::Path;
use std::sync::Arc;

use lgen_engine::{
    EvalCache, ExecutionModel, GenError, ModelInfo, ModelLoader, ModelSpec, Result, Tokenizer,
};
use lgen_models::{ReferenceLoader, ReferenceModel};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::decode::Decoder;
use crate::prefill::prefill;
use crate::request::{
    CacheRetention, ContextParams, GenerationOutput, GenerationRequest, StopReason,
};
use crate::stop::StopMatcher;
use crate::telemetry::{GenerationTimer, NoopTelemetry, TelemetryHook};

/// Field order is drop order: the cache goes before the model it belongs to.
struct Loaded<M: ExecutionModel> {
    cache: M::Cache,
    model: M,
}

pub struct GenerationContext<M: ExecutionModel> {
    id: Uuid,
    model_id: String,
    params: ContextParams,
    inner: Option<Loaded<M>>,
    /// Set after a faulted request; the next request starts from a clean cache.
    needs_reset: bool,
    telemetry: Arc<dyn TelemetryHook>,
}

impl GenerationContext<ReferenceModel> {
    /// Load a reference model manifest and allocate its cache.
    pub fn init(path: impl AsRef<Path>, params: ContextParams) -> Result<Self> {
        Self::init_with(&ReferenceLoader, path, params)
    }
}

impl<M: ExecutionModel> GenerationContext<M> {
    /// Load a model with `loader` and allocate a cache of `params.context_size`.
    ///
    /// On failure nothing stays allocated: a model whose cache could not be
    /// built is dropped before the error is returned.
    pub fn init_with<L>(loader: &L, path: impl AsRef<Path>, params: ContextParams) -> Result<Self>
    where
        L: ModelLoader<Model = M>,
    {
        let path = path.as_ref();
        let params = params.normalized();
        let id = Uuid::new_v4();
        let spec = ModelSpec::new(path, params.context_size);

        let model = loader.load(&spec).map_err(|e| {
            error!(context = %id, path = %path.display(), error = %e, "model load failed");
            e
        })?;
        let cache = model.new_cache(params.context_size).map_err(|e| {
            error!(
                context = %id,
                context_size = params.context_size,
                error = %e,
                "context initialization failed"
            );
            e
        })?;

        let model_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| model.info().name);
        let info = model.info();
        info!(
            context = %id,
            model = %model_id,
            context_size = params.context_size,
            vocab_size = info.vocab_size,
            "generation context ready"
        );

        Ok(Self {
            id,
            model_id,
            params,
            inner: Some(Loaded { cache, model }),
            needs_reset: false,
            telemetry: Arc::new(NoopTelemetry),
        })
    }

    /// Release the cache and the model. Calling this again is a no-op.
    pub fn free(&mut self) {
        match self.inner.take() {
            Some(loaded) => {
                drop(loaded);
                info!(context = %self.id, model = %self.model_id, "generation context freed");
            }
            None => debug!(context = %self.id, "free on already-freed context ignored"),
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.is_some()
    }

    /// File stem of the model path.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> ContextParams {
        self.params
    }

    pub fn info(&self) -> Option<ModelInfo> {
        self.inner.as_ref().map(|l| l.model.info())
    }

    pub fn tokenizer(&self) -> Option<&dyn Tokenizer> {
        self.inner.as_ref().map(|l| l.model.tokenizer())
    }

    /// Positions currently held by the cache.
    pub fn cache_len(&self) -> Option<usize> {
        self.inner.as_ref().map(|l| l.cache.len())
    }

    pub fn set_telemetry(&mut self, hook: Arc<dyn TelemetryHook>) {
        self.telemetry = hook;
    }

    /// Make the next request start from an empty cache regardless of retention.
    pub fn force_reset(&mut self) {
        self.needs_reset = true;
    }

    /// Run one request to completion.
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.generate_streaming(request, |_| {})
    }

    /// Boundary form of [`generate`](Self::generate): returns only the text.
    pub fn generate_text(
        &mut self,
        prompt: &str,
        max_tokens: usize,
        temperature: f32,
        top_p: f32,
        seed: u64,
    ) -> Result<String> {
        let request = GenerationRequest::new(prompt)
            .with_max_tokens(max_tokens)
            .with_temperature(temperature)
            .with_top_p(top_p)
            .with_seed(seed);
        self.generate(&request).map(|out| out.text)
    }

    /// Run one request, handing each piece of text to `on_fragment` as soon
    /// as it is known to be final. The returned text is the concatenation
    /// of every fragment delivered.
    pub fn generate_streaming<F>(
        &mut self,
        request: &GenerationRequest,
        mut on_fragment: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(&str),
    {
        let Some(Loaded { cache, model }) = self.inner.as_mut() else {
            return Err(GenError::InvariantViolation(
                "generation context has been freed".to_string(),
            ));
        };
        request.validate()?;
        let mut policy = request
            .sampling
            .policy()
            .map_err(|e| GenError::InvalidRequest(e.to_string()))?;

        let retain = request.retention == CacheRetention::Retain;
        if retain && self.needs_reset {
            warn!(context = %self.id, "previous request faulted; resetting retained cache");
        }
        if !retain || self.needs_reset {
            cache.clear();
            debug!(context = %self.id, "cache reset");
        }
        self.needs_reset = false;

        let tokenizer = model.tokenizer();
        let add_bos = cache.is_empty() && tokenizer.bos_token().is_some();
        let tokens = tokenizer.encode(&request.prompt, add_bos)?;
        if tokens.is_empty() {
            return Err(GenError::InvalidRequest(
                "prompt produced no tokens".to_string(),
            ));
        }

        info!(
            context = %self.id,
            prompt_tokens = tokens.len(),
            max_tokens = request.max_tokens,
            temperature = request.sampling.temperature,
            top_p = request.sampling.top_p,
            policy = policy.name(),
            "generation started"
        );

        let mut timer = GenerationTimer::start(
            self.id,
            &self.model_id,
            tokens.len(),
            Arc::clone(&self.telemetry),
        );
        match prefill(&*model, cache, &tokens, self.params.batch_size) {
            Ok(batches) => timer.prefill_complete(batches),
            Err(e) => {
                self.needs_reset = true;
                error!(context = %self.id, error = %e, "prefill failed; request discarded");
                timer.finish(StopReason::EngineFault, true);
                return Err(e);
            }
        }

        let decoder = Decoder {
            policy: policy.as_mut(),
            stops: StopMatcher::new(&request.stop),
            max_tokens: request.max_tokens,
            cancel: request.cancel.as_ref(),
            timer: &mut timer,
        };
        let outcome = decoder.run(&*model, cache, &mut on_fragment);
        let metrics = timer.finish(outcome.stop, outcome.fault.is_some());

        if let Some(fault) = &outcome.fault {
            self.needs_reset = true;
            if outcome.tokens.is_empty() {
                error!(context = %self.id, error = %fault, "decode failed before any output");
                return Err(fault.clone());
            }
            warn!(
                context = %self.id,
                tokens = outcome.tokens.len(),
                error = %fault,
                "engine fault during decode; returning partial output"
            );
        }

        info!(
            context = %self.id,
            stop = %outcome.stop,
            tokens = outcome.tokens.len(),
            tokens_per_sec = metrics.tokens_per_sec,
            "generation finished"
        );

        Ok(GenerationOutput {
            text: outcome.text,
            tokens: outcome.tokens,
            prompt_tokens: tokens.len(),
            stop: outcome.stop,
            fault: outcome.fault,
            metrics,
        })
    }
}

impl<M: ExecutionModel> Drop for GenerationContext<M> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<M: ExecutionModel> std::fmt::Debug for GenerationContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationContext")
            .field("id", &self.id)
            .field("model_id", &self.model_id)
            .field("live", &self.is_live())
            .field("params", &self.params)
            .finish()
    }
}
