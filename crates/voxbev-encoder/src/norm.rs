//! Layer normalization over the embedding axis.

use ndarray::{Array1, Array3, ArrayView3, Axis};
use voxbev_types::BevError;

/// Layer normalization with a learnable affine transform.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    weight: Array1<f32>,
    bias: Array1<f32>,
    eps: f32,
}

impl LayerNorm {
    /// # Errors
    ///
    /// [`BevError::Shape`] when `weight` and `bias` differ in length.
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, eps: f32) -> Result<Self, BevError> {
        if weight.len() != bias.len() {
            return Err(BevError::Shape(format!(
                "layer norm weight has {} entries but bias has {}",
                weight.len(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias, eps })
    }

    /// Unit weight, zero bias.
    pub fn with_dims(embed_dims: usize, eps: f32) -> Self {
        Self {
            weight: Array1::ones(embed_dims),
            bias: Array1::zeros(embed_dims),
            eps,
        }
    }

    pub fn embed_dims(&self) -> usize {
        self.weight.len()
    }

    /// Normalize `(B, N, C)` activations over `C`.
    pub fn forward(&self, x: ArrayView3<'_, f32>) -> Result<Array3<f32>, BevError> {
        let channels = x.dim().2;
        if channels != self.embed_dims() {
            return Err(BevError::Shape(format!(
                "layer norm expects {} channels, got {channels}",
                self.embed_dims()
            )));
        }
        let mean = x
            .mean_axis(Axis(2))
            .ok_or_else(|| BevError::Shape("layer norm over empty axis".to_string()))?
            .insert_axis(Axis(2));
        let var = x.var_axis(Axis(2), 0.0).insert_axis(Axis(2));

        let inv_std = (var + self.eps).mapv(|v| 1.0 / v.sqrt());
        let normalized = (&x - &mean) * &inv_std;
        Ok(normalized * &self.weight + &self.bias)
    }
}
