//! # lgen-cli
//!
//! Command-line front end: picks the engine from the model path, runs one
//! request (or inspects the model) and writes the result to stdout.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use lgen_engine::ExecutionModel;
use lgen_models::ReferenceModel;
use lgen_runtime::{
    Backend, ContextParams, GenError, GenerationContext, GenerationRequest, SamplingParams,
    DEFAULT_CONTEXT_SIZE,
};
use tracing::{debug, warn};

/// lgen: local text generation
#[derive(Debug, Parser)]
#[command(name = "lgen", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Generate text from a prompt.
    Generate {
        /// Model file (.json manifest or .gguf).
        #[arg(short, long)]
        model: PathBuf,

        /// Input prompt text.
        #[arg(short, long)]
        prompt: String,

        /// Maximum number of tokens to generate.
        #[arg(short = 'n', long, default_value_t = 64)]
        max_tokens: usize,

        /// Sampling temperature; 0 selects greedy decoding.
        #[arg(short, long, default_value_t = 0.4, allow_negative_numbers = true)]
        temperature: f32,

        /// Nucleus sampling threshold in [0, 1].
        #[arg(long, default_value_t = 0.9)]
        top_p: f32,

        /// Seed for reproducible sampling. Random when omitted.
        #[arg(short, long)]
        seed: Option<u64>,

        /// Context window in tokens; values <= 0 use the default.
        #[arg(short, long, default_value_t = DEFAULT_CONTEXT_SIZE as i64, allow_negative_numbers = true)]
        context_size: i64,

        /// Stop generating when this text appears. May be repeated.
        #[arg(long)]
        stop: Vec<String>,

        /// Print text as it is generated.
        #[arg(long)]
        stream: bool,
    },
    /// Load a model and print what it reports about itself.
    Inspect {
        #[arg(short, long)]
        model: PathBuf,

        #[arg(short, long, default_value_t = DEFAULT_CONTEXT_SIZE as i64, allow_negative_numbers = true)]
        context_size: i64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Generation(#[from] GenError),
    #[error("output error: {0}")]
    Io(#[from] io::Error),
}

/// Run one command, writing its result to `out`.
pub fn run<W: Write>(cli: Cli, out: &mut W) -> Result<(), CliError> {
    match cli.command {
        Command::Generate {
            model,
            prompt,
            max_tokens,
            temperature,
            top_p,
            seed,
            context_size,
            stop,
            stream,
        } => {
            let seed = seed.unwrap_or_else(rand::random);
            debug!(seed, "sampling seed");
            let mut request = GenerationRequest::new(prompt)
                .with_max_tokens(max_tokens)
                .with_sampling(SamplingParams {
                    temperature,
                    top_p,
                    seed,
                });
            for s in stop {
                request = request.with_stop(s);
            }
            let params = ContextParams::new().with_context_size(context_size);
            match backend_for(&model)? {
                Backend::Reference => {
                    let ctx = GenerationContext::<ReferenceModel>::init(&model, params)?;
                    generate(ctx, &request, stream, out)
                }
                #[cfg(feature = "llama-cpp")]
                Backend::LlamaCpp => {
                    let ctx = GenerationContext::<lgen_runtime::llama_cpp::LlamaCppModel>::init(
                        &model, params,
                    )?;
                    generate(ctx, &request, stream, out)
                }
            }
        }
        Command::Inspect { model, context_size } => {
            let backend = backend_for(&model)?;
            let params = ContextParams::new().with_context_size(context_size);
            match backend {
                Backend::Reference => {
                    let ctx = GenerationContext::<ReferenceModel>::init(&model, params)?;
                    inspect(&ctx, backend, out)
                }
                #[cfg(feature = "llama-cpp")]
                Backend::LlamaCpp => {
                    let ctx = GenerationContext::<lgen_runtime::llama_cpp::LlamaCppModel>::init(
                        &model, params,
                    )?;
                    inspect(&ctx, backend, out)
                }
            }
        }
    }
}

fn backend_for(path: &Path) -> Result<Backend, CliError> {
    Backend::for_path(path).map_err(|e| CliError::Generation(e.into()))
}

fn generate<M: ExecutionModel, W: Write>(
    mut ctx: GenerationContext<M>,
    request: &GenerationRequest,
    stream: bool,
    out: &mut W,
) -> Result<(), CliError> {
    let output = if stream {
        let mut write_err = None;
        let output = ctx.generate_streaming(request, |fragment| {
            if write_err.is_none() {
                if let Err(e) = out.write_all(fragment.as_bytes()).and_then(|_| out.flush()) {
                    write_err = Some(e);
                }
            }
        })?;
        if let Some(e) = write_err {
            return Err(e.into());
        }
        writeln!(out)?;
        output
    } else {
        let output = ctx.generate(request)?;
        writeln!(out, "{}", output.text)?;
        output
    };
    ctx.free();

    if let Some(fault) = &output.fault {
        warn!(error = %fault, "output truncated by engine fault");
    }
    debug!(
        stop = %output.stop,
        tokens = output.tokens.len(),
        tokens_per_sec = output.metrics.tokens_per_sec,
        "done"
    );
    Ok(())
}

fn inspect<M: ExecutionModel, W: Write>(
    ctx: &GenerationContext<M>,
    backend: Backend,
    out: &mut W,
) -> Result<(), CliError> {
    let (Some(info), Some(tokenizer)) = (ctx.info(), ctx.tokenizer()) else {
        return Err(GenError::InvariantViolation("context is not live".to_string()).into());
    };
    writeln!(out, "name:         {}", info.name)?;
    writeln!(out, "backend:      {}", backend)?;
    writeln!(out, "vocab_size:   {}", info.vocab_size)?;
    match tokenizer.bos_token() {
        Some(bos) => writeln!(out, "bos_token:    {}", bos)?,
        None => writeln!(out, "bos_token:    none")?,
    }
    writeln!(out, "eos_token:    {}", tokenizer.eos_token())?;
    writeln!(out, "context_size: {}", ctx.params().context_size)?;
    writeln!(out, "max_context:  {}", info.max_context)?;
    Ok(())
}
