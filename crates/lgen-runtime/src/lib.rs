//! # lgen-runtime
//!
//! The generation core of lgen: context lifecycle, batched prompt prefill,
//! the decode loop with its stop conditions, and serialized shared access.
//!
//! ```no_run
//! use lgen_models::ReferenceModel;
//! use lgen_runtime::{ContextParams, GenerationContext, GenerationRequest};
//!
//! let mut ctx =
//!     GenerationContext::<ReferenceModel>::init("models/tiny.json", ContextParams::default())?;
//! let out = ctx.generate(&GenerationRequest::new("Hello").with_max_tokens(5))?;
//! println!("{} ({})", out.text, out.stop);
//! ctx.free();
//! # Ok::<(), lgen_runtime::GenError>(())
//! ```

pub mod backend;
pub mod context;
mod decode;
#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;
pub mod prefill;
pub mod request;
pub mod shared;
pub mod stop;
pub mod telemetry;

pub use backend::{Backend, BackendError, BackendLease, BackendSlot};
pub use context::GenerationContext;
pub use request::{
    CacheRetention, ContextParams, GenerationOutput, GenerationRequest, StopReason,
    DEFAULT_BATCH_SIZE, DEFAULT_CONTEXT_SIZE,
};
pub use shared::{CancellationFlag, SharedContext};
pub use telemetry::{
    GenerationEvent, GenerationMetrics, LogTelemetry, NoopTelemetry, TelemetryHook,
};

pub use lgen_engine::{GenError, Result};
pub use lgen_sampling::SamplingParams;
