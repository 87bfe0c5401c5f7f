//! Backend selection and process-wide backend state.
//!
//! Provides:
//! - [`Backend`] enum gated by cargo features (`llama-cpp`)
//! - [`Backend::for_path`]: picks the engine that reads a model file
//! - [`BackendSlot`]: reference-counted process-wide state, torn down with
//!   its last user

use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use lgen_engine::GenError;
use tracing::debug;

/// Model-execution engine serving a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Built-in CPU transformer reading JSON manifests.
    Reference,
    /// llama.cpp reading GGUF files.
    #[cfg(feature = "llama-cpp")]
    LlamaCpp,
}

impl Backend {
    /// All backends enabled at compile time.
    pub fn compiled() -> &'static [Backend] {
        &[
            Backend::Reference,
            #[cfg(feature = "llama-cpp")]
            Backend::LlamaCpp,
        ]
    }

    /// Choose the backend for a model file by its extension.
    pub fn for_path(path: &Path) -> Result<Self, BackendError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "json" => Ok(Backend::Reference),
            #[cfg(feature = "llama-cpp")]
            "gguf" => Ok(Backend::LlamaCpp),
            #[cfg(not(feature = "llama-cpp"))]
            "gguf" => Err(BackendError::NotCompiled("llama-cpp".to_string())),
            _ => Err(BackendError::UnknownFormat(path.display().to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Reference => write!(f, "reference"),
            #[cfg(feature = "llama-cpp")]
            Backend::LlamaCpp => write!(f, "llama-cpp"),
        }
    }
}

/// Errors from backend selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("no backend reads {0} (expected .json or .gguf)")]
    UnknownFormat(String),
    #[error("backend {0} not compiled (missing cargo feature)")]
    NotCompiled(String),
}

impl From<BackendError> for GenError {
    fn from(err: BackendError) -> Self {
        GenError::ModelLoad(err.to_string())
    }
}

struct SlotState<T> {
    value: Option<Arc<T>>,
    users: usize,
}

/// Process-wide backend state shared by every live context.
///
/// The first [`acquire`](Self::acquire) initializes the value; it is dropped
/// when the last [`BackendLease`] goes away, so a later acquire starts fresh.
/// Initialization and teardown both run under the slot lock, so they never
/// overlap.
pub struct BackendSlot<T> {
    state: Mutex<SlotState<T>>,
}

impl<T> BackendSlot<T> {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                value: None,
                users: 0,
            }),
        }
    }

    /// Number of outstanding leases.
    pub fn users(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .users
    }

    pub fn is_live(&self) -> bool {
        self.users() > 0
    }
}

impl<T: Send + Sync + 'static> BackendSlot<T> {
    /// Lease the shared value, running `init` if no lease is outstanding.
    pub fn acquire<E>(
        &'static self,
        init: impl FnOnce() -> Result<T, E>,
    ) -> Result<BackendLease<T>, E> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let value = match state.value.clone() {
            Some(value) => value,
            None => {
                let value = Arc::new(init()?);
                debug!("process-wide backend initialized");
                state.value = Some(Arc::clone(&value));
                value
            }
        };
        state.users += 1;
        Ok(BackendLease {
            slot: self,
            value: Some(value),
        })
    }
}

impl<T> Default for BackendSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One user's share of a [`BackendSlot`].
pub struct BackendLease<T: Send + Sync + 'static> {
    slot: &'static BackendSlot<T>,
    /// `Some` until the lease is dropped.
    value: Option<Arc<T>>,
}

impl<T: Send + Sync + 'static> Deref for BackendLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_deref().expect("lease is live until dropped")
    }
}

impl<T: Send + Sync + 'static> Drop for BackendLease<T> {
    fn drop(&mut self) {
        let mut state = self
            .slot
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        drop(self.value.take());
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            // Last user: tear down while still holding the lock.
            drop(state.value.take());
            debug!("process-wide backend released");
        }
    }
}
