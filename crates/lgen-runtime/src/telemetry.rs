//! Per-request generation telemetry.
//!
//! A [`GenerationTimer`] follows one request through prefill and decode and
//! reports [`GenerationEvent`]s to the context's [`TelemetryHook`]. The
//! closing event carries the [`GenerationMetrics`] that also land in
//! [`GenerationOutput::metrics`](crate::GenerationOutput::metrics).

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::request::StopReason;

/// Summary of one generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationMetrics {
    /// Context that ran the request.
    pub context: Uuid,
    /// File stem of the model that served it.
    pub model: String,
    /// Prompt tokens evaluated, including an inserted BOS.
    pub prompt_tokens: usize,
    /// Batches submitted during prefill. Zero when prefill never completed.
    pub prefill_batches: usize,
    /// Tokens accepted into the output.
    pub generated_tokens: usize,
    pub stop: StopReason,
    /// The engine failed at some point during the request.
    pub faulted: bool,
    /// Wall time from request start until the first scores were ready.
    pub prefill_ms: f64,
    /// Wall time spent in the decode loop.
    pub decode_ms: f64,
    /// Decode throughput; zero when nothing was generated.
    pub tokens_per_sec: f64,
}

impl GenerationMetrics {
    pub fn total_ms(&self) -> f64 {
        self.prefill_ms + self.decode_ms
    }
}

/// What a [`TelemetryHook`] is told while a request runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GenerationEvent<'a> {
    /// The whole prompt is in the cache.
    PrefillComplete {
        context: Uuid,
        prompt_tokens: usize,
        batches: usize,
        elapsed_ms: f64,
    },
    /// A token was accepted; `index` counts from 1.
    Token {
        context: Uuid,
        index: usize,
        elapsed_ms: f64,
    },
    /// The request ended, successfully or not.
    Complete(&'a GenerationMetrics),
}

/// Observer attached to a [`GenerationContext`](crate::GenerationContext).
///
/// Runs on the generating thread, so implementations should return quickly.
pub trait TelemetryHook: Send + Sync {
    fn on_event(&self, _event: &GenerationEvent<'_>) {}
}

/// Ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Logs events through `tracing` and keeps the metrics of the last request.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last: Arc<Mutex<Option<GenerationMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_event(&self, event: &GenerationEvent<'_>) {
        match *event {
            GenerationEvent::PrefillComplete {
                context,
                prompt_tokens,
                batches,
                elapsed_ms,
            } => debug!(%context, prompt_tokens, batches, elapsed_ms, "prefill complete"),
            GenerationEvent::Token {
                context,
                index,
                elapsed_ms,
            } => trace!(%context, index, elapsed_ms, "token accepted"),
            GenerationEvent::Complete(metrics) => {
                debug!(
                    context = %metrics.context,
                    stop = %metrics.stop,
                    faulted = metrics.faulted,
                    generated_tokens = metrics.generated_tokens,
                    total_ms = metrics.total_ms(),
                    "request metrics"
                );
                *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(metrics.clone());
            }
        }
    }
}

/// Clock for one request. Created once the prompt is tokenized.
pub(crate) struct GenerationTimer {
    context: Uuid,
    model: String,
    prompt_tokens: usize,
    prefill_batches: usize,
    start: Instant,
    prefill_end: Option<Instant>,
    tokens: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl GenerationTimer {
    pub fn start(
        context: Uuid,
        model: impl Into<String>,
        prompt_tokens: usize,
        hook: Arc<dyn TelemetryHook>,
    ) -> Self {
        Self {
            context,
            model: model.into(),
            prompt_tokens,
            prefill_batches: 0,
            start: Instant::now(),
            prefill_end: None,
            tokens: 0,
            hook,
        }
    }

    pub fn prefill_complete(&mut self, batches: usize) {
        let now = Instant::now();
        self.prefill_end = Some(now);
        self.prefill_batches = batches;
        self.hook.on_event(&GenerationEvent::PrefillComplete {
            context: self.context,
            prompt_tokens: self.prompt_tokens,
            batches,
            elapsed_ms: millis(now - self.start),
        });
    }

    pub fn token(&mut self) {
        self.tokens += 1;
        self.hook.on_event(&GenerationEvent::Token {
            context: self.context,
            index: self.tokens,
            elapsed_ms: millis(self.start.elapsed()),
        });
    }

    pub fn finish(self, stop: StopReason, faulted: bool) -> GenerationMetrics {
        let now = Instant::now();
        let (prefill_ms, decode_ms) = match self.prefill_end {
            Some(end) => (millis(end - self.start), millis(now - end)),
            None => (millis(now - self.start), 0.0),
        };
        let tokens_per_sec = if decode_ms > 0.0 && self.tokens > 0 {
            self.tokens as f64 / (decode_ms / 1000.0)
        } else {
            0.0
        };

        let metrics = GenerationMetrics {
            context: self.context,
            model: self.model,
            prompt_tokens: self.prompt_tokens,
            prefill_batches: self.prefill_batches,
            generated_tokens: self.tokens,
            stop,
            faulted,
            prefill_ms,
            decode_ms,
            tokens_per_sec,
        };
        self.hook.on_event(&GenerationEvent::Complete(&metrics));
        metrics
    }
}

fn millis(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
