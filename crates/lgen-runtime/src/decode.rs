//! The autoregressive decode loop.
//!
//! Each iteration reads the scores the last evaluation left in the cache,
//! selects a token, detokenizes it, and feeds it back. The loop ends on the
//! end-of-sequence marker, the token budget, a stop sequence, cancellation
//! or an engine fault.

use lgen_engine::{EvalCache, ExecutionModel, GenError, TokenId};
use lgen_sampling::SelectionPolicy;
use lgen_tokenizer::DecodingState;

use crate::request::StopReason;
use crate::shared::CancellationFlag;
use crate::stop::{StopCheck, StopMatcher};
use crate::telemetry::GenerationTimer;

pub(crate) struct DecodeOutcome {
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub stop: StopReason,
    pub fault: Option<GenError>,
}

pub(crate) struct Decoder<'a> {
    pub policy: &'a mut dyn SelectionPolicy,
    pub stops: StopMatcher,
    pub max_tokens: usize,
    pub cancel: Option<&'a CancellationFlag>,
    pub timer: &'a mut GenerationTimer,
}

impl Decoder<'_> {
    pub fn run<M: ExecutionModel>(
        mut self,
        model: &M,
        cache: &mut M::Cache,
        on_fragment: &mut dyn FnMut(&str),
    ) -> DecodeOutcome {
        let tokenizer = model.tokenizer();
        let eos = tokenizer.eos_token();
        let mut state = DecodingState::new();
        let mut text = String::new();
        let mut tokens = Vec::new();

        let mut emit = |release: String, text: &mut String| {
            if !release.is_empty() {
                on_fragment(&release);
                text.push_str(&release);
            }
        };

        let (stop, fault) = loop {
            if tokens.len() >= self.max_tokens {
                break (StopReason::MaxTokens, None);
            }
            if self.cancel.is_some_and(CancellationFlag::is_cancelled) {
                break (StopReason::Cancelled, None);
            }

            let Some(logits) = cache.logits() else {
                break fault("engine produced no scores for the next position");
            };
            let token = match self.policy.select(logits) {
                Ok(index) => match TokenId::try_from(index) {
                    Ok(token) => token,
                    Err(_) => break fault(format!("selected index {} overflows token id", index)),
                },
                Err(e) => break fault(format!("selection failed: {}", e)),
            };
            if token == eos {
                break (StopReason::Eos, None);
            }

            let fragment = match tokenizer.decode_token(token, &mut state) {
                Ok(fragment) => fragment,
                Err(e) => break (StopReason::EngineFault, Some(GenError::from(e))),
            };
            tokens.push(token);
            self.timer.token();

            match self.stops.push(&fragment) {
                StopCheck::Matched { release } => {
                    emit(release, &mut text);
                    break (StopReason::StopSequence, None);
                }
                StopCheck::Continue { release } => emit(release, &mut text),
            }

            if let Err(e) = model.evaluate(cache, &[token]) {
                break (StopReason::EngineFault, Some(e));
            }
        };

        let stop = if stop == StopReason::StopSequence {
            stop
        } else {
            // Flush a trailing partial character, then anything held back
            // as a possible stop prefix.
            let tail = state.finish();
            match self.stops.push(&tail) {
                StopCheck::Matched { release } => {
                    emit(release, &mut text);
                    StopReason::StopSequence
                }
                StopCheck::Continue { release } => {
                    emit(release, &mut text);
                    emit(self.stops.finish(), &mut text);
                    stop
                }
            }
        };

        DecodeOutcome {
            text,
            tokens,
            stop,
            fault,
        }
    }
}

fn fault(msg: impl Into<String>) -> (StopReason, Option<GenError>) {
    (StopReason::EngineFault, Some(GenError::Evaluation(msg.into())))
}
