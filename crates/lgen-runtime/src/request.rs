//! Per-request configuration and results.

use std::fmt;

use lgen_engine::{GenError, Result, TokenId};
use lgen_sampling::SamplingParams;

use crate::shared::CancellationFlag;
use crate::telemetry::GenerationMetrics;

/// Context window used when none (or a non-positive one) is requested.
pub const DEFAULT_CONTEXT_SIZE: usize = 2048;

/// Prompt tokens submitted per engine call during prefill.
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// Load-time configuration of a [`GenerationContext`](crate::GenerationContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Maximum cache length.
    pub context_size: usize,
    /// Prefill batch size.
    pub batch_size: usize,
}

impl Default for ContextParams {
    fn default() -> Self {
        Self {
            context_size: DEFAULT_CONTEXT_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl ContextParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the context window. Values `<= 0` select [`DEFAULT_CONTEXT_SIZE`].
    pub fn with_context_size(mut self, size: i64) -> Self {
        self.context_size = if size <= 0 {
            DEFAULT_CONTEXT_SIZE
        } else {
            usize::try_from(size).unwrap_or(usize::MAX)
        };
        self
    }

    /// Set the prefill batch size (at least 1).
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Apply the defaults to fields set directly: a zero context size
    /// becomes [`DEFAULT_CONTEXT_SIZE`] and a zero batch size becomes 1.
    pub fn normalized(self) -> Self {
        Self {
            context_size: if self.context_size == 0 {
                DEFAULT_CONTEXT_SIZE
            } else {
                self.context_size
            },
            batch_size: self.batch_size.max(1),
        }
    }
}

/// Whether a request starts from an empty cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheRetention {
    /// Clear the cache before prefill.
    #[default]
    Reset,
    /// Append the prompt to whatever the previous request left in the cache.
    /// Ignored after a faulted request, which always forces a reset.
    Retain,
}

/// One generation request. Read-only for the duration of a call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: usize,
    pub sampling: SamplingParams,
    /// Generation stops before the first occurrence of any of these.
    pub stop: Vec<String>,
    pub retention: CacheRetention,
    pub cancel: Option<CancellationFlag>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 64,
            sampling: SamplingParams::default(),
            stop: Vec::new(),
            retention: CacheRetention::Reset,
            cancel: None,
        }
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.sampling.temperature = t;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.sampling.top_p = p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sampling.seed = seed;
        self
    }

    /// Add a stop sequence. Empty strings are ignored.
    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        let stop = stop.into();
        if !stop.is_empty() {
            self.stop.push(stop);
        }
        self
    }

    pub fn with_retention(mut self, retention: CacheRetention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.sampling
            .validate()
            .map_err(|e| GenError::InvalidRequest(e.to_string()))
    }
}

/// Why the decode loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The model produced its end-of-sequence marker.
    Eos,
    /// `max_tokens` tokens were produced.
    MaxTokens,
    /// A stop sequence appeared in the output.
    StopSequence,
    /// The request's cancellation flag was raised.
    Cancelled,
    /// The engine failed after at least one token was produced.
    EngineFault,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Eos => "eos",
            StopReason::MaxTokens => "max_tokens",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Cancelled => "cancelled",
            StopReason::EngineFault => "engine_fault",
        };
        f.write_str(name)
    }
}

/// Result of one generation call.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub text: String,
    /// Tokens produced by decode, excluding the end-of-sequence marker.
    pub tokens: Vec<TokenId>,
    pub prompt_tokens: usize,
    pub stop: StopReason,
    /// The engine error that cut generation short, if any.
    pub fault: Option<GenError>,
    pub metrics: GenerationMetrics,
}

impl GenerationOutput {
    /// True when the text was cut short by an engine fault.
    pub fn is_truncated(&self) -> bool {
        self.fault.is_some()
    }
}
