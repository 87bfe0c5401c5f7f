//! Prefill and decode behaviour against scripted engines.
//!
//! Validates:
//! - Stop conditions: end-of-sequence, token budget, stop sequences, cancellation
//! - Prefill batching and ordering
//! - Fault handling: prefill faults discard output, decode faults keep it
//! - Cache reset and retention between requests
//! - Streaming delivery never splits a character

mod support;

use std::sync::{Arc, Mutex};

use lgen_engine::TokenId;
use lgen_runtime::*;
use lgen_tokenizer::{ByteLevelTokenizer, Tokenizer};
use support::*;

fn context(loader: &ScriptedLoader) -> GenerationContext<ScriptedModel> {
    GenerationContext::init_with(loader, "scripted.bin", ContextParams::default()).unwrap()
}

fn greedy(prompt: &str, max_tokens: usize) -> GenerationRequest {
    GenerationRequest::new(prompt)
        .with_max_tokens(max_tokens)
        .with_sampling(SamplingParams::greedy())
}

// ===========================================================================
// Stop conditions
// ===========================================================================

#[test]
fn max_tokens_zero_runs_prefill_only() {
    let loader = ScriptedLoader::new(reply("abc"));
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 0)).unwrap();
    assert_eq!(out.text, "");
    assert!(out.tokens.is_empty());
    assert_eq!(out.stop, StopReason::MaxTokens);
    assert_eq!(loader.counters.evaluations(), 1);
}

#[test]
fn eos_stops_without_emitting_marker() {
    let loader = ScriptedLoader::new(reply("abc"));
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 10)).unwrap();
    assert_eq!(out.text, "abc");
    assert_eq!(out.tokens.len(), 3);
    assert!(!out.tokens.contains(&ByteLevelTokenizer::EOS_ID));
    assert_eq!(out.stop, StopReason::Eos);
    assert!(out.fault.is_none());
    // prefill + one feed per emitted token
    assert_eq!(loader.counters.evaluations(), 4);
}

#[test]
fn token_budget_caps_output() {
    let loader = ScriptedLoader::new(endless());
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 5)).unwrap();
    assert_eq!(out.text, "xxxxx");
    assert_eq!(out.tokens.len(), 5);
    assert_eq!(out.stop, StopReason::MaxTokens);
}

#[test]
fn eos_before_budget_terminates_early() {
    let loader = ScriptedLoader::new(reply("hi"));
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 5)).unwrap();
    assert!(out.tokens.len() <= 5);
    assert_eq!(out.stop, StopReason::Eos);
}

#[test]
fn stop_sequence_truncates_output() {
    let loader = ScriptedLoader::new(reply("hello\nworld"));
    let mut ctx = context(&loader);
    let out = ctx
        .generate(&greedy("Q:", 50).with_stop("\n"))
        .unwrap();
    assert_eq!(out.text, "hello");
    assert_eq!(out.stop, StopReason::StopSequence);
}

#[test]
fn stop_sequence_spanning_tokens() {
    let loader = ScriptedLoader::new(reply("abENDcd"));
    let mut ctx = context(&loader);
    let mut streamed = String::new();
    let out = ctx
        .generate_streaming(&greedy("Q:", 50).with_stop("END"), |f| streamed.push_str(f))
        .unwrap();
    assert_eq!(out.text, "ab");
    assert_eq!(streamed, "ab");
    assert_eq!(out.stop, StopReason::StopSequence);
}

#[test]
fn held_back_stop_prefix_is_released_at_eos() {
    let loader = ScriptedLoader::new(reply("aEbE"));
    let mut ctx = context(&loader);
    let mut streamed = String::new();
    let out = ctx
        .generate_streaming(&greedy("Q:", 50).with_stop("EN"), |f| streamed.push_str(f))
        .unwrap();
    assert_eq!(out.text, "aEbE");
    assert_eq!(streamed, "aEbE");
    assert_eq!(out.stop, StopReason::Eos);
}

#[test]
fn pre_cancelled_request_returns_empty() {
    let loader = ScriptedLoader::new(endless());
    let mut ctx = context(&loader);
    let flag = CancellationFlag::new();
    flag.cancel();
    let out = ctx
        .generate(&greedy("Hello", 10).with_cancellation(flag))
        .unwrap();
    assert_eq!(out.stop, StopReason::Cancelled);
    assert_eq!(out.text, "");
}

#[test]
fn cancellation_mid_stream_keeps_text() {
    let loader = ScriptedLoader::new(endless());
    let mut ctx = context(&loader);
    let flag = CancellationFlag::new();
    let trigger = flag.clone();
    let mut seen = 0;
    let out = ctx
        .generate_streaming(&greedy("Hello", 100).with_cancellation(flag), |_| {
            seen += 1;
            if seen == 3 {
                trigger.cancel();
            }
        })
        .unwrap();
    assert_eq!(out.stop, StopReason::Cancelled);
    assert_eq!(out.text, "xxx");
}

// ===========================================================================
// Prefill
// ===========================================================================

#[test]
fn prefill_uses_fixed_size_batches_in_order() {
    let seen: Arc<Mutex<Vec<Vec<TokenId>>>> = Arc::default();
    let log = Arc::clone(&seen);
    let script: Script = Arc::new(move |history: &[TokenId]| {
        log.lock().unwrap().push(history.to_vec());
        ByteLevelTokenizer::EOS_ID
    });
    let loader = ScriptedLoader::new(script);
    let mut ctx = GenerationContext::init_with(
        &loader,
        "scripted.bin",
        ContextParams::new().with_batch_size(2),
    )
    .unwrap();

    ctx.generate(&greedy("hello", 0)).unwrap();
    assert_eq!(loader.counters.batches(), vec![2, 2, 2]);

    let expected = ByteLevelTokenizer::new().encode("hello", true).unwrap();
    let histories = seen.lock().unwrap();
    assert_eq!(histories.last().unwrap(), &expected);
    assert_eq!(histories[0], expected[..2].to_vec());
}

#[test]
fn prompt_longer_than_context_fails_prefill() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = GenerationContext::init_with(
        &loader,
        "scripted.bin",
        ContextParams::new().with_context_size(4),
    )
    .unwrap();
    let err = ctx.generate(&greedy("hello", 5)).unwrap_err();
    assert!(matches!(err, GenError::Evaluation(_)));
}

// ===========================================================================
// Faults
// ===========================================================================

#[test]
fn prefill_fault_returns_error_and_no_output() {
    let loader = ScriptedLoader::new(reply("abc")).failing_eval(0);
    let mut ctx = context(&loader);
    let mut streamed = String::new();
    let err = ctx
        .generate_streaming(&greedy("Hello", 10), |f| streamed.push_str(f))
        .unwrap_err();
    assert!(matches!(err, GenError::Evaluation(_)));
    assert!(streamed.is_empty());
}

#[test]
fn decode_fault_returns_partial_text() {
    // call 0 = prefill, calls 1.. feed each emitted token
    let loader = ScriptedLoader::new(reply("abcdef")).failing_eval(3);
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 10)).unwrap();
    assert_eq!(out.text, "abc");
    assert_eq!(out.tokens.len(), 3);
    assert_eq!(out.stop, StopReason::EngineFault);
    assert!(matches!(out.fault, Some(GenError::Evaluation(_))));
    assert!(out.is_truncated());
}

#[test]
fn missing_scores_before_any_token_is_error() {
    let loader = ScriptedLoader::new(reply("abc")).without_logits();
    let mut ctx = context(&loader);
    assert!(matches!(
        ctx.generate(&greedy("Hello", 10)),
        Err(GenError::Evaluation(_))
    ));
}

#[test]
fn context_exhaustion_during_decode_keeps_partial_text() {
    let loader = ScriptedLoader::new(endless());
    let mut ctx = GenerationContext::init_with(
        &loader,
        "scripted.bin",
        ContextParams::new().with_context_size(8),
    )
    .unwrap();
    // BOS + "hi" = 3 positions; five feeds fill the window, the sixth fails.
    let out = ctx.generate(&greedy("hi", 100)).unwrap();
    assert_eq!(out.stop, StopReason::EngineFault);
    assert_eq!(out.text, "xxxxxx");
}

#[test]
fn context_is_usable_after_fault() {
    let loader = ScriptedLoader::new(reply("ok")).failing_eval(1);
    let mut ctx = context(&loader);
    let first = ctx.generate(&greedy("hi", 10)).unwrap();
    assert_eq!(first.stop, StopReason::EngineFault);

    let second = ctx.generate(&greedy("hi", 10)).unwrap();
    assert_eq!(second.text, "ok");
    assert_eq!(second.stop, StopReason::Eos);
}

// ===========================================================================
// Cache reset and retention
// ===========================================================================

#[test]
fn each_request_starts_from_clean_cache() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    ctx.generate(&greedy("hi", 10)).unwrap();
    assert_eq!(ctx.cache_len(), Some(5));
    ctx.generate(&greedy("hi", 10)).unwrap();
    assert_eq!(ctx.cache_len(), Some(5));
    // Both prefills carried the leading marker.
    let batches = loader.counters.batches();
    assert_eq!(batches[0], 3);
    assert_eq!(batches[3], 3);
}

#[test]
fn retain_appends_without_leading_marker() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    ctx.generate(&greedy("hi", 10)).unwrap();
    let out = ctx
        .generate(&greedy("ya", 10).with_retention(CacheRetention::Retain))
        .unwrap();
    assert_eq!(out.text, "ok");
    assert_eq!(loader.counters.batches()[3], 2);
    assert_eq!(ctx.cache_len(), Some(9));
}

#[test]
fn fault_forces_reset_even_when_retaining() {
    let loader = ScriptedLoader::new(reply("ok")).failing_eval(2);
    let mut ctx = context(&loader);
    let first = ctx.generate(&greedy("hi", 10)).unwrap();
    assert_eq!(first.stop, StopReason::EngineFault);

    ctx.generate(&greedy("ya", 10).with_retention(CacheRetention::Retain))
        .unwrap();
    // Fresh prefill: leading marker plus two bytes.
    assert_eq!(loader.counters.batches()[3], 3);
}

#[test]
fn empty_prompt_on_retained_cache_is_invalid() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    ctx.generate(&greedy("hi", 10)).unwrap();
    let err = ctx
        .generate(&greedy("", 10).with_retention(CacheRetention::Retain))
        .unwrap_err();
    assert!(matches!(err, GenError::InvalidRequest(_)));
}

#[test]
fn empty_prompt_on_fresh_cache_is_just_the_marker() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("", 10)).unwrap();
    assert_eq!(out.prompt_tokens, 1);
    assert_eq!(out.text, "ok");
}

// ===========================================================================
// Requests and streaming
// ===========================================================================

#[test]
fn invalid_sampling_rejected_before_evaluation() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    for request in [
        greedy("hi", 5).with_temperature(-1.0),
        greedy("hi", 5).with_top_p(1.5),
        greedy("hi", 5).with_temperature(f32::NAN),
    ] {
        assert!(matches!(
            ctx.generate(&request),
            Err(GenError::InvalidRequest(_))
        ));
    }
    assert_eq!(loader.counters.evaluations(), 0);
}

#[test]
fn streaming_never_splits_characters() {
    let loader = ScriptedLoader::new(reply("é🦙"));
    let mut ctx = context(&loader);
    let mut fragments = Vec::new();
    let out = ctx
        .generate_streaming(&greedy("Q:", 20), |f| fragments.push(f.to_string()))
        .unwrap();
    assert_eq!(fragments, vec!["é", "🦙"]);
    assert_eq!(out.text, "é🦙");
    assert_eq!(out.tokens.len(), 6);
}

#[test]
fn generate_text_boundary() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = context(&loader);
    assert_eq!(ctx.generate_text("Hello", 5, 0.0, 1.0, 0).unwrap(), "ok");
}

#[test]
fn telemetry_reports_each_request() {
    let loader = ScriptedLoader::new(reply("abc"));
    let mut ctx = context(&loader);
    let log = LogTelemetry::new();
    ctx.set_telemetry(Arc::new(log.clone()));

    let out = ctx.generate(&greedy("Hello", 10)).unwrap();
    let metrics = log.last_metrics().unwrap();
    assert_eq!(metrics, out.metrics);
    assert_eq!(metrics.model, "scripted");
    assert_eq!(metrics.generated_tokens, 3);
    assert_eq!(metrics.prompt_tokens, 6);
    assert_eq!(metrics.prefill_batches, 1);
    assert_eq!(metrics.stop, StopReason::Eos);
    assert!(!metrics.faulted);
    assert_eq!(metrics.context, ctx.id());
}

#[test]
fn metrics_count_prefill_batches() {
    let loader = ScriptedLoader::new(reply("ok"));
    let mut ctx = GenerationContext::init_with(
        &loader,
        "scripted.bin",
        ContextParams::new().with_batch_size(2),
    )
    .unwrap();
    let out = ctx.generate(&greedy("hello", 0)).unwrap();
    assert_eq!(out.metrics.prefill_batches, 3);
    assert_eq!(out.metrics.stop, StopReason::MaxTokens);
    assert_eq!(out.metrics.tokens_per_sec, 0.0);
}

#[test]
fn decode_fault_is_flagged_in_metrics() {
    let loader = ScriptedLoader::new(reply("abcdef")).failing_eval(3);
    let mut ctx = context(&loader);
    let out = ctx.generate(&greedy("Hello", 10)).unwrap();
    assert!(out.metrics.faulted);
    assert_eq!(out.metrics.stop, StopReason::EngineFault);
    assert_eq!(out.metrics.generated_tokens, 3);
}

#[test]
fn failed_prefill_still_reaches_the_hook() {
    let loader = ScriptedLoader::new(reply("abc")).failing_eval(0);
    let mut ctx = context(&loader);
    let log = LogTelemetry::new();
    ctx.set_telemetry(Arc::new(log.clone()));

    assert!(ctx.generate(&greedy("Hello", 10)).is_err());
    let metrics = log.last_metrics().unwrap();
    assert!(metrics.faulted);
    assert_eq!(metrics.prefill_batches, 0);
    assert_eq!(metrics.generated_tokens, 0);
}
