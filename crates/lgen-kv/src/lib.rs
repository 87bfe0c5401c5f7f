//! # lgen-kv
//!
//! Bounded KV cache for the lgen reference engine.
//!
//! Supports:
//! - **Decode**: Appends K/V for one token at a time per layer
//! - **Multi-layer**: `SessionKVCache` keeps every layer at the same sequence length
//! - **Bounded window**: growth past capacity is an error, never a silent truncation
//! - **Rollback**: `truncate()` restores a consistent state after a failed step
//! - **Memory tracking**: byte accounting for allocated and active memory

use std::fmt;

/// Represents tensor shape: `[seq_len, n_heads, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KVShape {
    pub seq_len: usize,
    pub n_heads: usize,
    pub head_dim: usize,
}

impl KVShape {
    pub fn new(seq_len: usize, n_heads: usize, head_dim: usize) -> Self {
        Self {
            seq_len,
            n_heads,
            head_dim,
        }
    }

    pub fn total_elements(&self) -> usize {
        self.seq_len * self.n_heads * self.head_dim
    }

    pub fn capacity_bytes(&self, bytes_per_element: usize) -> usize {
        self.total_elements() * bytes_per_element
    }
}

impl fmt::Display for KVShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[seq:{}, heads:{}, dim:{}]",
            self.seq_len, self.n_heads, self.head_dim
        )
    }
}

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KVError {
    #[error("KV cache capacity exceeded: {seq_len} > {max}")]
    CapacityExceeded { seq_len: usize, max: usize },

    #[error("Shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    #[error("Layer {layer} out of range (cache has {n_layers} layers)")]
    LayerOutOfRange { layer: usize, n_layers: usize },

    #[error("Cannot allocate KV cache {shape} x {n_layers} layers")]
    AllocationFailed { shape: KVShape, n_layers: usize },

    #[error("KV cache requires at least one layer")]
    NoLayers,
}

pub type KVResult<T> = Result<T, KVError>;

fn zeroed(len: usize) -> Option<Vec<f32>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0.0);
    Some(buf)
}

/// Single transformer layer's K and V cache.
///
/// # Invariants
/// - `seq_len <= capacity`
/// - K and V are always the same size
#[derive(Debug, Clone)]
pub struct LayerKVCache {
    k: Vec<f32>,
    v: Vec<f32>,
    capacity: usize,
    n_heads: usize,
    head_dim: usize,
    seq_len: usize,
}

impl LayerKVCache {
    /// Allocate a cache for one layer holding up to `max_seq_len` tokens.
    ///
    /// # Errors
    /// - `AllocationFailed`: the buffers cannot be reserved
    pub fn new(max_seq_len: usize, n_heads: usize, head_dim: usize) -> KVResult<Self> {
        let shape = KVShape::new(max_seq_len, n_heads, head_dim);
        let failed = || KVError::AllocationFailed { shape, n_layers: 1 };
        let buf_len = max_seq_len
            .checked_mul(n_heads)
            .and_then(|n| n.checked_mul(head_dim))
            .ok_or_else(failed)?;

        Ok(Self {
            k: zeroed(buf_len).ok_or_else(failed)?,
            v: zeroed(buf_len).ok_or_else(failed)?,
            capacity: max_seq_len,
            n_heads,
            head_dim,
            seq_len: 0,
        })
    }

    /// Width of one token's K (or V) entry: `n_heads * head_dim`.
    pub fn token_width(&self) -> usize {
        self.n_heads * self.head_dim
    }

    /// Append K and V for a single token.
    ///
    /// # Errors
    /// - `CapacityExceeded`: If appending would exceed max sequence length
    /// - `ShapeMismatch`: If token shape doesn't match n_heads * head_dim
    pub fn append_token(&mut self, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        let expected_len = self.token_width();

        if k_token.len() != expected_len || v_token.len() != expected_len {
            let got_len = if k_token.len() != expected_len {
                k_token.len()
            } else {
                v_token.len()
            };
            return Err(KVError::ShapeMismatch {
                expected: expected_len,
                got: got_len,
            });
        }

        if self.seq_len >= self.capacity {
            return Err(KVError::CapacityExceeded {
                seq_len: self.seq_len + 1,
                max: self.capacity,
            });
        }

        let offset = self.seq_len * expected_len;
        self.k[offset..offset + expected_len].copy_from_slice(k_token);
        self.v[offset..offset + expected_len].copy_from_slice(v_token);
        self.seq_len += 1;

        Ok(())
    }

    /// K entries written so far, `[seq_len, n_heads, head_dim]` flattened.
    pub fn keys(&self) -> &[f32] {
        &self.k[..self.seq_len * self.token_width()]
    }

    /// V entries written so far, same layout as [`keys`](Self::keys).
    pub fn values(&self) -> &[f32] {
        &self.v[..self.seq_len * self.token_width()]
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn shape(&self) -> KVShape {
        KVShape::new(self.seq_len, self.n_heads, self.head_dim)
    }

    /// Forget every position at or after `len`. No-op if `len >= seq_len`.
    pub fn truncate(&mut self, len: usize) {
        self.seq_len = self.seq_len.min(len);
    }

    /// Clear the cache (reset seq_len to 0).
    pub fn clear(&mut self) {
        self.seq_len = 0;
    }

    /// Total memory allocated for K and V (in bytes).
    pub fn memory_bytes(&self) -> usize {
        (self.k.len() + self.v.len()) * std::mem::size_of::<f32>()
    }

    /// Memory used by the positions currently written.
    pub fn active_memory_bytes(&self) -> usize {
        self.seq_len * self.token_width() * 2 * std::mem::size_of::<f32>()
    }
}

/// Session-level KV cache managing all transformer layers.
///
/// Between tokens every layer holds the same `seq_len`. A forward pass
/// appends layer by layer, so the invariant is restored once the last layer
/// has been written; on failure the caller rolls back with [`truncate`](Self::truncate).
#[derive(Debug, Clone)]
pub struct SessionKVCache {
    layers: Vec<LayerKVCache>,
}

impl SessionKVCache {
    /// Allocate caches for `n_layers` layers.
    ///
    /// # Errors
    /// - `NoLayers`: `n_layers == 0`
    /// - `AllocationFailed`: the buffers cannot be reserved
    pub fn new(
        n_layers: usize,
        max_seq_len: usize,
        n_heads: usize,
        head_dim: usize,
    ) -> KVResult<Self> {
        if n_layers == 0 {
            return Err(KVError::NoLayers);
        }
        let layers = (0..n_layers)
            .map(|_| {
                LayerKVCache::new(max_seq_len, n_heads, head_dim).map_err(|_| {
                    KVError::AllocationFailed {
                        shape: KVShape::new(max_seq_len, n_heads, head_dim),
                        n_layers,
                    }
                })
            })
            .collect::<KVResult<Vec<_>>>()?;

        Ok(Self { layers })
    }

    /// Get KV cache for a specific layer.
    pub fn layer(&self, layer_idx: usize) -> KVResult<&LayerKVCache> {
        let n_layers = self.layers.len();
        self.layers.get(layer_idx).ok_or(KVError::LayerOutOfRange {
            layer: layer_idx,
            n_layers,
        })
    }

    /// Append one token's K/V to a single layer.
    pub fn append(&mut self, layer_idx: usize, k_token: &[f32], v_token: &[f32]) -> KVResult<()> {
        let n_layers = self.layers.len();
        self.layers
            .get_mut(layer_idx)
            .ok_or(KVError::LayerOutOfRange {
                layer: layer_idx,
                n_layers,
            })?
            .append_token(k_token, v_token)
    }

    /// Committed sequence length: the number of tokens every layer holds.
    pub fn seq_len(&self) -> usize {
        self.layers.iter().map(|l| l.seq_len).min().unwrap_or(0)
    }

    /// Whether all layers agree on `seq_len`.
    pub fn is_synchronized(&self) -> bool {
        self.layers.windows(2).all(|w| w[0].seq_len == w[1].seq_len)
    }

    pub fn capacity(&self) -> usize {
        self.layers[0].capacity
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Fail fast if `additional` more tokens would not fit.
    pub fn ensure_capacity(&self, additional: usize) -> KVResult<()> {
        let wanted = self.seq_len() + additional;
        if wanted > self.capacity() {
            return Err(KVError::CapacityExceeded {
                seq_len: wanted,
                max: self.capacity(),
            });
        }
        Ok(())
    }

    /// Roll every layer back to `len` tokens.
    pub fn truncate(&mut self, len: usize) {
        for layer in &mut self.layers {
            layer.truncate(len);
        }
    }

    /// Clear all layers.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }

    /// Total memory across all layers.
    pub fn memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.memory_bytes()).sum()
    }

    /// Active memory across all layers (based on seq_len).
    pub fn active_memory_bytes(&self) -> usize {
        self.layers.iter().map(|l| l.active_memory_bytes()).sum()
    }
}
