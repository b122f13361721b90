//! Position-wise feed-forward block: `fc1 → ReLU → fc2` plus residual.

use ndarray::{Array1, Array2, Array3, ArrayView3};
use voxbev_types::BevError;

use crate::shape_error;

/// Two-layer MLP applied independently to every query.
///
/// Weights are stored `[out, in]`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForward {
    fc1_weight: Array2<f32>,
    fc1_bias: Array1<f32>,
    fc2_weight: Array2<f32>,
    fc2_bias: Array1<f32>,
}

impl FeedForward {
    /// # Arguments
    /// * `fc1_weight` - `[hidden, embed_dims]`
    /// * `fc1_bias` - `[hidden]`
    /// * `fc2_weight` - `[embed_dims, hidden]`
    /// * `fc2_bias` - `[embed_dims]`
    pub fn new(
        fc1_weight: Array2<f32>,
        fc1_bias: Array1<f32>,
        fc2_weight: Array2<f32>,
        fc2_bias: Array1<f32>,
    ) -> Result<Self, BevError> {
        let (hidden, embed) = fc1_weight.dim();
        if fc1_bias.len() != hidden
            || fc2_weight.dim() != (embed, hidden)
            || fc2_bias.len() != embed
        {
            return Err(BevError::Shape(format!(
                "inconsistent feed-forward weights: fc1 {:?}, fc2 {:?}",
                fc1_weight.dim(),
                fc2_weight.dim()
            )));
        }
        Ok(Self {
            fc1_weight,
            fc1_bias,
            fc2_weight,
            fc2_bias,
        })
    }

    /// All-zero weights: the block reduces to its residual.
    pub fn zeros(embed_dims: usize, hidden: usize) -> Self {
        Self {
            fc1_weight: Array2::zeros((hidden, embed_dims)),
            fc1_bias: Array1::zeros(hidden),
            fc2_weight: Array2::zeros((embed_dims, hidden)),
            fc2_bias: Array1::zeros(embed_dims),
        }
    }

    pub fn embed_dims(&self) -> usize {
        self.fc1_weight.dim().1
    }

    /// `identity + fc2(relu(fc1(x)))`, where `identity` defaults to `x`.
    pub fn forward(
        &self,
        x: ArrayView3<'_, f32>,
        identity: Option<ArrayView3<'_, f32>>,
    ) -> Result<Array3<f32>, BevError> {
        let (batch, seq, channels) = x.dim();
        if channels != self.embed_dims() {
            return Err(BevError::Shape(format!(
                "feed-forward expects {} channels, got {channels}",
                self.embed_dims()
            )));
        }

        let x_contig = x.as_standard_layout();
        let x_2d = x_contig
            .view()
            .into_shape_with_order((batch * seq, channels))
            .map_err(shape_error)?;

        let mut hidden = x_2d.dot(&self.fc1_weight.t()) + &self.fc1_bias;
        hidden.mapv_inplace(|v| v.max(0.0));
        let out = hidden.dot(&self.fc2_weight.t()) + &self.fc2_bias;
        let out = out
            .into_shape_with_order((batch, seq, channels))
            .map_err(shape_error)?;

        let identity = match &identity {
            Some(i) => i.view(),
            None => x.view(),
        };
        if identity.dim() != out.dim() {
            return Err(BevError::Shape(format!(
                "feed-forward identity {:?} does not match output {:?}",
                identity.dim(),
                out.dim()
            )));
        }
        Ok(out + &identity)
    }
}
