//! Thread-safe access to a generation context.
//!
//! A cache must never be advanced by two requests at once. [`SharedContext`]
//! serializes every call on one context behind a mutex; distinct contexts
//! still run in parallel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lgen_engine::{ExecutionModel, Result};
use tracing::warn;

use crate::context::GenerationContext;
use crate::request::{GenerationOutput, GenerationRequest};

/// Cooperative cancellation, checked at the top of every decode iteration.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for another request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A [`GenerationContext`] shared across threads. Clones refer to the same context.
pub struct SharedContext<M: ExecutionModel> {
    inner: Arc<Mutex<GenerationContext<M>>>,
}

impl<M: ExecutionModel> Clone for SharedContext<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ExecutionModel> SharedContext<M> {
    pub fn new(context: GenerationContext<M>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(context)),
        }
    }

    /// Lock the context. A lock poisoned by a panicking request is recovered
    /// and the context is forced to reset its cache before the next request.
    pub fn lock(&self) -> MutexGuard<'_, GenerationContext<M>> {
        self.inner.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            let mut guard = poisoned.into_inner();
            warn!(context = %guard.id(), "recovered poisoned context lock; forcing cache reset");
            guard.force_reset();
            self.inner.clear_poison();
            guard
        })
    }

    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.lock().generate(request)
    }

    pub fn generate_streaming<F>(&self, request: &GenerationRequest, on_fragment: F) -> Result<GenerationOutput>
    where
        F: FnMut(&str),
    {
        self.lock().generate_streaming(request, on_fragment)
    }

    pub fn free(&self) {
        self.lock().free();
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_flag_is_shared_between_clones() {
        let flag = CancellationFlag::new();
        let observer = flag.clone();
        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
        observer.reset();
        assert!(!flag.is_cancelled());
    }
}
