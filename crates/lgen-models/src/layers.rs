//! Transformer building blocks for the reference engine.
//!
//! Provides:
//! - **RMSNorm**: Root Mean Square layer normalization
//! - **RoPE**: Rotary Position Embeddings at an absolute position
//! - **Linear**: Dense projection without bias
//! - **SwiGLU**: Gated feedforward
//! - **attend**: Single-query causal attention over cached K/V

use rand::Rng;

/// Root Mean Square Layer Normalization.
///
/// Formula: `y = x / RMS(x) * weight`, where RMS(x) = sqrt(mean(x^2))
#[derive(Debug, Clone)]
pub struct RMSNorm {
    /// Learnable scale parameter, shape: [d_model]
    pub weight: Vec<f32>,
    /// Epsilon for numerical stability
    pub eps: f32,
}

impl RMSNorm {
    pub fn new(d_model: usize, eps: f32) -> Self {
        Self {
            weight: vec![1.0; d_model],
            eps,
        }
    }

    /// Normalize one hidden-state vector.
    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.weight.len());
        let mean_sq: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
        let rms = (mean_sq + self.eps).sqrt();
        x.iter()
            .zip(&self.weight)
            .map(|(&val, &w)| (val / rms) * w)
            .collect()
    }
}

/// Rotary Position Embeddings (RoPE).
///
/// Rotates each `(x[2i], x[2i+1])` pair of every head by a position-dependent
/// angle so attention scores depend on relative position.
#[derive(Debug, Clone)]
pub struct RoPE {
    /// Dimension of head (head_dim)
    pub dim: usize,
    /// Inverse frequencies: [1/base^(2i/dim) for i in 0..dim/2]
    pub inv_freq: Vec<f32>,
}

impl RoPE {
    /// `dim` must be even; the manifest validates this before construction.
    pub fn new(dim: usize, base: f32) -> Self {
        let inv_freq: Vec<f32> = (0..dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / dim as f32))
            .collect();
        Self { dim, inv_freq }
    }

    /// Rotate `x` (`[n_heads, head_dim]` flattened) in place for absolute position `pos`.
    pub fn rotate(&self, x: &mut [f32], pos: usize) {
        for head in x.chunks_exact_mut(self.dim) {
            for (i, &freq) in self.inv_freq.iter().enumerate() {
                let angle = pos as f32 * freq;
                let (sin, cos) = angle.sin_cos();
                let a = head[2 * i];
                let b = head[2 * i + 1];
                head[2 * i] = a * cos - b * sin;
                head[2 * i + 1] = a * sin + b * cos;
            }
        }
    }
}

/// Dense projection, row-major `[out_dim, in_dim]`.
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: Vec<f32>,
    pub in_dim: usize,
    pub out_dim: usize,
}

impl Linear {
    /// Uniform init in `±1/sqrt(in_dim)`. `None` if the weights cannot be allocated.
    pub fn random<R: Rng>(rng: &mut R, in_dim: usize, out_dim: usize) -> Option<Self> {
        let scale = 1.0 / (in_dim as f32).sqrt();
        let weight = uniform(rng, in_dim.checked_mul(out_dim)?, scale)?;
        Some(Self {
            weight,
            in_dim,
            out_dim,
        })
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        debug_assert_eq!(x.len(), self.in_dim);
        self.weight
            .chunks_exact(self.in_dim)
            .map(|row| dot(row, x))
            .collect()
    }
}

/// SwiGLU feedforward: `down(silu(gate(x)) * up(x))`.
#[derive(Debug, Clone)]
pub struct SwiGLU {
    pub gate: Linear,
    pub up: Linear,
    pub down: Linear,
}

impl SwiGLU {
    pub fn random<R: Rng>(rng: &mut R, d_model: usize, d_ff: usize) -> Option<Self> {
        Some(Self {
            gate: Linear::random(rng, d_model, d_ff)?,
            up: Linear::random(rng, d_model, d_ff)?,
            down: Linear::random(rng, d_ff, d_model)?,
        })
    }

    pub fn forward(&self, x: &[f32]) -> Vec<f32> {
        let gate = self.gate.forward(x);
        let up = self.up.forward(x);
        let hidden: Vec<f32> = gate.iter().zip(&up).map(|(&g, &u)| silu(g) * u).collect();
        self.down.forward(&hidden)
    }
}

/// `len` weights drawn from `±scale`, or `None` when the buffer cannot be reserved.
pub fn uniform<R: Rng>(rng: &mut R, len: usize, scale: f32) -> Option<Vec<f32>> {
    let mut weights = Vec::new();
    weights.try_reserve_exact(len).ok()?;
    weights.extend((0..len).map(|_| rng.gen_range(-scale..scale)));
    Some(weights)
}

pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Attention for one query over every cached position.
///
/// `keys` and `values` are `[seq_len, n_heads, head_dim]` flattened and must
/// already include the current token. Returns `[n_heads, head_dim]`.
pub fn attend(q: &[f32], keys: &[f32], values: &[f32], n_heads: usize, head_dim: usize) -> Vec<f32> {
    let width = n_heads * head_dim;
    let seq_len = keys.len() / width;
    let scale = 1.0 / (head_dim as f32).sqrt();
    let mut out = vec![0.0; width];
    let mut scores = vec![0.0; seq_len];

    for h in 0..n_heads {
        let q_h = &q[h * head_dim..(h + 1) * head_dim];
        for (t, score) in scores.iter_mut().enumerate() {
            let k_h = &keys[t * width + h * head_dim..t * width + (h + 1) * head_dim];
            *score = dot(q_h, k_h) * scale;
        }

        let max = scores.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for s in scores.iter_mut() {
            *s = (*s - max).exp();
            sum += *s;
        }

        let out_h = &mut out[h * head_dim..(h + 1) * head_dim];
        for (t, &w) in scores.iter().enumerate() {
            let v_h = &values[t * width + h * head_dim..t * width + (h + 1) * head_dim];
            for (o, &v) in out_h.iter_mut().zip(v_h) {
                *o += w / sum * v;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rmsnorm_scale_invariant() {
        let norm = RMSNorm::new(4, 1e-6);
        let a = norm.forward(&[1.0, 2.0, 3.0, 4.0]);
        let b = norm.forward(&[2.0, 4.0, 6.0, 8.0]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-5, "RMSNorm should be scale-invariant");
        }
    }

    #[test]
    fn rope_position_zero_is_identity() {
        let rope = RoPE::new(4, 10000.0);
        let mut x = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
        let original = x.clone();
        rope.rotate(&mut x, 0);
        assert_eq!(x, original);
    }

    #[test]
    fn rope_preserves_magnitude() {
        let rope = RoPE::new(8, 10000.0);
        let mut x = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let before: f32 = x.iter().map(|v| v * v).sum::<f32>().sqrt();
        rope.rotate(&mut x, 17);
        let after: f32 = x.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((before - after).abs() < 1e-5, "Rotation should preserve magnitude");
    }

    #[test]
    fn linear_shapes_and_determinism() {
        let a = Linear::random(&mut StdRng::seed_from_u64(3), 4, 6).unwrap();
        let b = Linear::random(&mut StdRng::seed_from_u64(3), 4, 6).unwrap();
        assert_eq!(a.weight, b.weight);
        assert_eq!(a.forward(&[1.0; 4]).len(), 6);
    }

    #[test]
    fn linear_with_overflowing_shape_is_refused() {
        let mut rng = StdRng::seed_from_u64(0);
        assert!(Linear::random(&mut rng, usize::MAX / 2, 3).is_none());
        assert!(uniform(&mut rng, usize::MAX / 2, 1.0).is_none());
    }

    #[test]
    fn attention_over_single_position_returns_its_value() {
        let q = [0.3, -0.2, 0.9, 0.1];
        let keys = [1.0, 1.0, 1.0, 1.0];
        let values = [5.0, 6.0, 7.0, 8.0];
        let out = attend(&q, &keys, &values, 2, 2);
        for (o, v) in out.iter().zip(&values) {
            assert!((o - v).abs() < 1e-5);
        }
    }

    #[test]
    fn silu_at_zero() {
        assert_eq!(silu(0.0), 0.0);
        assert!(silu(10.0) > 9.99);
    }
}
