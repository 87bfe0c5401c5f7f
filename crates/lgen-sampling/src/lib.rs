//! # lgen-sampling
//!
//! Next-token selection policies for lgen.
//!
//! Supports:
//! - Greedy (argmax, ties broken by lowest token id)
//! - Temperature scaling
//! - Top-p (nucleus) filtering
//! - Deterministic seeded RNG for reproducible generation
//!
//! The decode loop only sees [`SelectionPolicy`], so new strategies plug in
//! without touching it.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be finite and >= 0")]
    InvalidTemperature,
    #[error("Top-p must be within [0, 1]")]
    InvalidTopP,
    #[error("No valid tokens after filtering")]
    NoValidTokens,
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Maps a score vector to one chosen token index.
pub trait SelectionPolicy: Send {
    /// Pick one index into `logits`.
    fn select(&mut self, logits: &[f32]) -> SamplingResult<usize>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Strict arg-max. The first maximum in a left-to-right scan wins, so ties
/// resolve to the lowest token id. NaN scores are never selected.
pub fn argmax(logits: &[f32]) -> SamplingResult<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &score) in logits.iter().enumerate() {
        if score.is_nan() {
            continue;
        }
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx).ok_or(SamplingError::InvalidLogits)
}

/// Deterministic greedy selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Greedy;

impl SelectionPolicy for Greedy {
    fn select(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        argmax(logits)
    }

    fn name(&self) -> &'static str {
        "greedy"
    }
}

/// Stochastic sampler: temperature-scaled softmax, nucleus truncation, seeded draw.
#[derive(Debug, Clone)]
pub struct Sampler {
    /// Temperature for softmax scaling. > 1.0 = more random, < 1.0 = more deterministic.
    pub temperature: f32,

    /// Top-p (nucleus sampling): sample from smallest set of tokens with cumulative prob >= p.
    pub top_p: Option<f32>,

    /// RNG state for reproducible sampling. Mutated on each call.
    rng: StdRng,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            temperature: 1.0,
            top_p: None,
            rng: StdRng::seed_from_u64(42),
        }
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = Some(p);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sample a token index from logits using the configured strategy.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if logits.is_empty() {
            return Err(SamplingError::InvalidLogits);
        }
        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }

        // Shift by the raw maximum before dividing: every scaled value is
        // then <= 0, so a tiny temperature cannot overflow to +inf.
        let max_logit = logits
            .iter()
            .copied()
            .filter(|l| !l.is_nan())
            .fold(f32::NEG_INFINITY, f32::max);
        if max_logit == f32::NEG_INFINITY {
            return Err(SamplingError::NoValidTokens);
        }
        if max_logit == f32::INFINITY {
            return logits
                .iter()
                .position(|&l| l == f32::INFINITY)
                .ok_or(SamplingError::NoValidTokens);
        }

        let scaled: Vec<f32> = logits
            .iter()
            .map(|&l| {
                if l.is_nan() {
                    f32::NEG_INFINITY
                } else {
                    (l - max_logit) / self.temperature
                }
            })
            .collect();

        let probs = Self::softmax(&scaled)?;

        let probs = match self.top_p {
            Some(p) if p < 1.0 => Self::apply_top_p(&probs, p),
            _ => probs,
        };

        self.sample_from_distribution(&probs)
    }

    fn softmax(logits: &[f32]) -> SamplingResult<Vec<f32>> {
        let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if !max_logit.is_finite() {
            return Err(SamplingError::NoValidTokens);
        }
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let sum: f32 = exps.iter().sum();
        Ok(exps.iter().map(|&e| e / sum).collect())
    }

    fn apply_top_p(probs: &[f32], p: f32) -> Vec<f32> {
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().enumerate().map(|(i, &pr)| (i, pr)).collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cumsum = 0.0;
        let mut cutoff_idx = 0;
        for (idx, (_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            cutoff_idx = idx;
            if cumsum >= p {
                break;
            }
        }

        let cutoff_prob = indexed[cutoff_idx].1;
        let mut result = vec![0.0; probs.len()];
        for (i, &pr) in probs.iter().enumerate() {
            if pr >= cutoff_prob {
                result[i] = pr;
            }
        }

        // Renormalize
        let sum: f32 = result.iter().sum();
        if sum > 0.0 {
            for p in &mut result {
                *p /= sum;
            }
        }

        result
    }

    fn sample_from_distribution(&mut self, probs: &[f32]) -> SamplingResult<usize> {
        let r: f32 = self.rng.gen();
        let mut cumsum = 0.0;

        for (i, &prob) in probs.iter().enumerate() {
            cumsum += prob;
            if r < cumsum {
                return Ok(i);
            }
        }

        // Rounding left the cumulative sum just under r: take the last live token.
        probs
            .iter()
            .rposition(|&prob| prob > 0.0)
            .ok_or(SamplingError::NoValidTokens)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for Sampler {
    fn select(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        self.sample(logits)
    }

    fn name(&self) -> &'static str {
        "nucleus"
    }
}

/// Caller-facing sampling knobs for one generation request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// 0.0 selects greedy decoding.
    pub temperature: f32,
    /// Nucleus threshold in [0, 1]; 1.0 disables truncation.
    pub top_p: f32,
    pub seed: u64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.4,
            top_p: 0.9,
            seed: 0,
        }
    }
}

impl SamplingParams {
    /// Deterministic arg-max decoding.
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            seed: 0,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature == 0.0
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SamplingError::InvalidTemperature);
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(SamplingError::InvalidTopP);
        }
        Ok(())
    }

    /// Build the policy these parameters describe.
    pub fn policy(&self) -> SamplingResult<Box<dyn SelectionPolicy>> {
        self.validate()?;
        if self.is_greedy() {
            return Ok(Box::new(Greedy));
        }
        Ok(Box::new(
            Sampler::new()
                .with_temperature(self.temperature)
                .with_top_p(self.top_p)
                .with_seed(self.seed),
        ))
    }
}
