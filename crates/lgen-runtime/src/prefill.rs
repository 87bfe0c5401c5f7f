//! Prefill stage: feed the prompt to the engine in order, in fixed-size batches.

use lgen_engine::{ExecutionModel, Result, TokenId};
use tracing::debug;

/// Evaluate `tokens` into `cache`, `batch_size` at a time.
///
/// Batches are submitted front to back; the first failing batch aborts the
/// whole prefill and its error is returned unchanged. Returns the number of
/// batches submitted.
pub fn prefill<M: ExecutionModel>(
    model: &M,
    cache: &mut M::Cache,
    tokens: &[TokenId],
    batch_size: usize,
) -> Result<usize> {
    let mut batches = 0;
    for (index, batch) in tokens.chunks(batch_size.max(1)).enumerate() {
        model.evaluate(cache, batch)?;
        batches += 1;
        debug!(batch = index, len = batch.len(), "prefill batch evaluated");
    }
    Ok(batches)
}
