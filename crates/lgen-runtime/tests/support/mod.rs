//! Scripted engine doubles for lgen-runtime tests.
//!
//! - Live models and caches are counted so tests can assert nothing leaks.
//! - A script maps the cache history to the token the engine will favour next.
//! - Faults can be injected at load, at cache creation, or at the n-th
//!   evaluation call (prefill batches and decode feeds share one counter).

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lgen_engine::{
    EvalCache, ExecutionModel, GenError, ModelInfo, ModelLoader, ModelSpec, Result, TokenId,
    Tokenizer,
};
use lgen_tokenizer::ByteLevelTokenizer;

#[derive(Debug, Default)]
pub struct Counters {
    pub live_models: AtomicUsize,
    pub live_caches: AtomicUsize,
    pub evaluations: AtomicUsize,
    /// Length of every batch passed to `evaluate`, in call order.
    pub batches: std::sync::Mutex<Vec<usize>>,
}

impl Counters {
    pub fn models(&self) -> usize {
        self.live_models.load(Ordering::SeqCst)
    }

    pub fn caches(&self) -> usize {
        self.live_caches.load(Ordering::SeqCst)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

pub type Script = Arc<dyn Fn(&[TokenId]) -> TokenId + Send + Sync>;

pub fn byte(b: u8) -> TokenId {
    ByteLevelTokenizer::byte_token(b)
}

/// Continue `reply` from however much of it the history already ends with,
/// then emit end-of-sequence.
pub fn reply_tokens(reply: Vec<TokenId>) -> Script {
    Arc::new(move |history: &[TokenId]| {
        let done = (0..=reply.len())
            .rev()
            .find(|&n| history.ends_with(&reply[..n]))
            .unwrap_or(0);
        reply.get(done).copied().unwrap_or(ByteLevelTokenizer::EOS_ID)
    })
}

pub fn reply(text: &str) -> Script {
    reply_tokens(text.bytes().map(byte).collect())
}

/// Never stops on its own: always favours `b'x'`.
pub fn endless() -> Script {
    Arc::new(|_: &[TokenId]| byte(b'x'))
}

#[derive(Clone)]
pub struct ScriptedLoader {
    pub counters: Arc<Counters>,
    pub script: Script,
    pub max_context: usize,
    pub fail_load: bool,
    pub fail_cache: bool,
    pub fail_on_eval: Option<usize>,
    pub withhold_logits: bool,
}

impl ScriptedLoader {
    pub fn new(script: Script) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            script,
            max_context: 4096,
            fail_load: false,
            fail_cache: false,
            fail_on_eval: None,
            withhold_logits: false,
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn failing_cache(mut self) -> Self {
        self.fail_cache = true;
        self
    }

    /// Fail the n-th evaluation call (0-based).
    pub fn failing_eval(mut self, n: usize) -> Self {
        self.fail_on_eval = Some(n);
        self
    }

    pub fn without_logits(mut self) -> Self {
        self.withhold_logits = true;
        self
    }

    pub fn with_max_context(mut self, n: usize) -> Self {
        self.max_context = n;
        self
    }
}

impl ModelLoader for ScriptedLoader {
    type Model = ScriptedModel;

    fn load(&self, spec: &ModelSpec) -> Result<ScriptedModel> {
        if self.fail_load {
            return Err(GenError::ModelLoad(format!(
                "cannot open {}",
                spec.path.display()
            )));
        }
        self.counters.live_models.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedModel {
            tokenizer: ByteLevelTokenizer::new(),
            config: self.clone(),
        })
    }
}

pub struct ScriptedModel {
    tokenizer: ByteLevelTokenizer,
    config: ScriptedLoader,
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.config.counters.live_models.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ScriptedCache {
    history: Vec<TokenId>,
    capacity: usize,
    logits: Option<Vec<f32>>,
    counters: Arc<Counters>,
}

impl ScriptedCache {
    pub fn history(&self) -> &[TokenId] {
        &self.history
    }
}

impl Drop for ScriptedCache {
    fn drop(&mut self) {
        self.counters.live_caches.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EvalCache for ScriptedCache {
    fn len(&self) -> usize {
        self.history.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.history.clear();
        self.logits = None;
    }

    fn logits(&self) -> Option<&[f32]> {
        self.logits.as_deref()
    }
}

impl ExecutionModel for ScriptedModel {
    type Cache = ScriptedCache;

    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: "scripted".to_string(),
            vocab_size: self.tokenizer.vocab_size(),
            max_context: self.config.max_context,
        }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &self.tokenizer
    }

    fn new_cache(&self, context_size: usize) -> Result<ScriptedCache> {
        if self.config.fail_cache || context_size > self.config.max_context {
            return Err(GenError::ContextInit(format!(
                "cannot allocate {} positions",
                context_size
            )));
        }
        self.config.counters.live_caches.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedCache {
            history: Vec::new(),
            capacity: context_size,
            logits: None,
            counters: Arc::clone(&self.config.counters),
        })
    }

    fn evaluate(&self, cache: &mut ScriptedCache, batch: &[TokenId]) -> Result<()> {
        let counters = &self.config.counters;
        let call = counters.evaluations.fetch_add(1, Ordering::SeqCst);
        counters.batches.lock().unwrap().push(batch.len());
        if self.config.fail_on_eval == Some(call) {
            return Err(GenError::Evaluation(format!("injected fault at call {}", call)));
        }
        if batch.len() > cache.remaining() {
            return Err(GenError::Evaluation("context window exhausted".to_string()));
        }

        cache.history.extend_from_slice(batch);
        if self.config.withhold_logits {
            cache.logits = None;
            return Ok(());
        }
        let next = (self.config.script)(&cache.history);
        let mut logits = vec![0.0; self.tokenizer.vocab_size()];
        logits[next as usize] = 10.0;
        cache.logits = Some(logits);
        Ok(())
    }
}
