//! Integration tests for the reference engine.
//!
//! Validates:
//! - Loading from manifest files, including every failure path
//! - Determinism: same manifest, same scores
//! - Clearing the cache restores fresh-context behaviour
//! - Capacity is enforced, never truncated

use std::io::Write;

use lgen_engine::{EvalCache, ExecutionModel, GenError, ModelLoader, ModelSpec};
use lgen_models::*;

fn write_manifest(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file
}

fn small_manifest() -> ModelManifest {
    ModelManifest::default()
        .with_name("small")
        .with_seed(11)
        .with_max_context(128)
        .with_pieces(["He", "llo", " wo", "rld"])
        .with_config(ModelConfig {
            d_model: 16,
            n_heads: 2,
            n_layers: 2,
            d_ff: 32,
            ..ModelConfig::default()
        })
}

fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best
}

// ===========================================================================
// Loading
// ===========================================================================

#[test]
fn load_from_file() {
    let file = write_manifest(&small_manifest().to_json());
    let model = ReferenceLoader
        .load(&ModelSpec::new(file.path(), 64))
        .unwrap();
    let info = model.info();
    assert_eq!(info.name, "small");
    assert_eq!(info.vocab_size, 258 + 4);
    assert_eq!(info.max_context, 128);
}

#[test]
fn missing_file_is_model_load_error() {
    let err = ReferenceLoader
        .load(&ModelSpec::new("/nonexistent/model.json", 64))
        .unwrap_err();
    match err {
        GenError::ModelLoad(msg) => assert!(msg.contains("/nonexistent/model.json")),
        other => panic!("expected ModelLoad, got {other:?}"),
    }
}

#[test]
fn corrupt_file_is_model_load_error() {
    let file = write_manifest("{ \"config\": ");
    assert!(matches!(
        ReferenceLoader.load(&ModelSpec::new(file.path(), 64)),
        Err(GenError::ModelLoad(_))
    ));
}

#[test]
fn unsupported_shape_is_model_load_error() {
    let file = write_manifest(r#"{"config":{"d_model":10,"n_heads":3}}"#);
    assert!(matches!(
        ReferenceLoader.load(&ModelSpec::new(file.path(), 64)),
        Err(GenError::ModelLoad(_))
    ));
}

#[test]
fn oversized_shape_is_model_load_error_not_abort() {
    let file = write_manifest(
        r#"{"config":{"d_model":1099511627776,"n_heads":549755813888,"n_layers":1,"d_ff":1}}"#,
    );
    let err = ReferenceLoader
        .load(&ModelSpec::new(file.path(), 64))
        .unwrap_err();
    assert!(matches!(err, GenError::ModelLoad(_)));
    assert!(err.to_string().contains("too large"));
}

#[test]
fn parameter_count_overflow_is_detected() {
    let config = ModelConfig {
        d_model: usize::MAX / 2,
        n_heads: 1,
        ..ModelConfig::default()
    };
    assert_eq!(config.parameter_count(258), None);
    assert!(ModelConfig::default().parameter_count(258).unwrap() < MAX_PARAMETERS);
}

#[test]
fn bundled_manifest_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../models/tiny.json");
    let model = ReferenceLoader.load(&ModelSpec::new(path, 2048)).unwrap();
    assert_eq!(model.info().name, "tiny");
    assert!(model.new_cache(2048).is_ok());
}

// ===========================================================================
// Determinism and reset
// ===========================================================================

#[test]
fn same_manifest_same_scores() {
    let a = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let b = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let prompt = a.tokenizer().encode("Hello world", true).unwrap();

    let mut ca = a.new_cache(32).unwrap();
    let mut cb = b.new_cache(32).unwrap();
    a.evaluate(&mut ca, &prompt).unwrap();
    b.evaluate(&mut cb, &prompt).unwrap();
    assert_eq!(ca.logits(), cb.logits());
}

#[test]
fn different_seed_different_scores() {
    let a = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let b = ReferenceModel::from_manifest(&small_manifest().with_seed(12)).unwrap();
    let mut ca = a.new_cache(8).unwrap();
    let mut cb = b.new_cache(8).unwrap();
    a.evaluate(&mut ca, &[0, 50]).unwrap();
    b.evaluate(&mut cb, &[0, 50]).unwrap();
    assert_ne!(ca.logits(), cb.logits());
}

#[test]
fn clear_gives_fresh_context_behaviour() {
    let model = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let tok = model.tokenizer();
    let first = tok.encode("the first prompt", true).unwrap();
    let second = tok.encode("Hello", true).unwrap();

    let mut fresh = model.new_cache(64).unwrap();
    model.evaluate(&mut fresh, &second).unwrap();
    let expected = fresh.logits().unwrap().to_vec();

    let mut reused = model.new_cache(64).unwrap();
    model.evaluate(&mut reused, &first).unwrap();
    reused.clear();
    assert!(reused.logits().is_none());
    model.evaluate(&mut reused, &second).unwrap();
    assert_eq!(reused.logits().unwrap(), expected.as_slice());
}

#[test]
fn incremental_decode_matches_full_evaluation() {
    let model = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let prompt = model.tokenizer().encode("Hello", true).unwrap();

    let mut step = model.new_cache(32).unwrap();
    model.evaluate(&mut step, &prompt).unwrap();
    let next = argmax(step.logits().unwrap()) as i32;
    model.evaluate(&mut step, &[next]).unwrap();

    let mut full = model.new_cache(32).unwrap();
    let mut all = prompt.clone();
    all.push(next);
    model.evaluate(&mut full, &all).unwrap();

    for (x, y) in step.logits().unwrap().iter().zip(full.logits().unwrap()) {
        assert!((x - y).abs() < 1e-4);
    }
}

// ===========================================================================
// Capacity
// ===========================================================================

#[test]
fn cache_fills_to_capacity_then_errors() {
    let model = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let mut cache = model.new_cache(3).unwrap();
    model.evaluate(&mut cache, &[0, 10, 11]).unwrap();
    assert_eq!(cache.remaining(), 0);
    assert!(matches!(
        model.evaluate(&mut cache, &[12]),
        Err(GenError::Evaluation(_))
    ));
    assert_eq!(cache.len(), 3);
}

#[test]
fn cache_memory_is_bounded_by_context() {
    let model = ReferenceModel::from_manifest(&small_manifest()).unwrap();
    let small = model.new_cache(8).unwrap();
    let large = model.new_cache(16).unwrap();
    assert_eq!(large.memory_bytes(), 2 * small.memory_bytes());
}
