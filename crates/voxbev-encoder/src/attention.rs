//! Attention sub-module capabilities.
//!
//! The encoder never samples image or BEV features itself. It prepares the
//! sampling geometry and hands it to one of two externally supplied
//! capabilities, each typically wrapping a multi-scale deformable attention
//! kernel:
//!
//! | Capability | Attends to | Geometry supplied |
//! |---|---|---|
//! | [`TemporalSelfAttention`] | previous BEV (or the query itself) | 2-D reference points, single level `(H, W)` |
//! | [`SpatialCrossAttention`] | multi-camera image features | 3-D reference points, projected points + visibility mask, multi-scale shapes |
//!
//! Layers hold them as the closed [`Attention`] enum so the operation order
//! can be checked against the attention kinds at construction time.

use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4};
use voxbev_geometry::{Projection, ReferencePoints2D, ReferencePoints3D};
use voxbev_types::{BevError, SpatialShape, level_start_index};

// ────────────────────────────────────────────────────────────────────────────
// Camera features
// ────────────────────────────────────────────────────────────────────────────

/// Multi-camera, multi-scale image features produced by the backbone.
///
/// `key` and `value` have shape `(num_cameras, num_value, batch, C)` where
/// `num_value` is the sum of `h·w` over all feature levels.
#[derive(Debug, Clone)]
pub struct CameraFeatures {
    key: Array4<f32>,
    value: Array4<f32>,
    spatial_shapes: Vec<SpatialShape>,
    level_start_index: Vec<usize>,
}

impl CameraFeatures {
    /// # Errors
    ///
    /// [`BevError::Shape`] when `key` and `value` disagree or the flattened
    /// length does not match `spatial_shapes`.
    pub fn new(
        key: Array4<f32>,
        value: Array4<f32>,
        spatial_shapes: Vec<SpatialShape>,
    ) -> Result<Self, BevError> {
        if key.dim() != value.dim() {
            return Err(BevError::Shape(format!(
                "key {:?} and value {:?} differ",
                key.dim(),
                value.dim()
            )));
        }
        let total: usize = spatial_shapes.iter().map(SpatialShape::len).sum();
        if key.dim().1 != total {
            return Err(BevError::Shape(format!(
                "features hold {} values but spatial shapes cover {total}",
                key.dim().1
            )));
        }
        let level_start_index = level_start_index(&spatial_shapes);
        Ok(Self {
            key,
            value,
            spatial_shapes,
            level_start_index,
        })
    }

    pub fn key(&self) -> ArrayView4<'_, f32> {
        self.key.view()
    }

    pub fn value(&self) -> ArrayView4<'_, f32> {
        self.value.view()
    }

    pub fn spatial_shapes(&self) -> &[SpatialShape] {
        &self.spatial_shapes
    }

    pub fn level_start_index(&self) -> &[usize] {
        &self.level_start_index
    }

    pub fn num_cameras(&self) -> usize {
        self.key.dim().0
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// Everything a temporal self-attention call receives.
#[derive(Debug, Clone, Copy)]
pub struct TemporalInput<'a> {
    /// Current BEV query, `(B, H·W, C)`.
    pub query: ArrayView3<'a, f32>,
    /// Hybrid value `(2B, H·W, C)`: `[prev_bev, query]` per batch item, or
    /// `[query, query]` when there is no previous BEV.
    pub value: ArrayView3<'a, f32>,
    /// Residual to add, present only for pre-norm layers.
    pub residual: Option<ArrayView3<'a, f32>>,
    /// BEV positional encoding, used for both query and key.
    pub query_pos: Option<ArrayView3<'a, f32>>,
    /// Planar reference points covering `2B` entries.
    pub reference_points: &'a ReferencePoints2D,
    /// Single level `(H, W)`.
    pub spatial_shapes: &'a [SpatialShape],
    pub level_start_index: &'a [usize],
    pub attn_mask: Option<&'a Array2<f32>>,
    pub key_padding_mask: Option<ArrayView2<'a, bool>>,
}

/// Everything a spatial cross-attention call receives.
#[derive(Debug, Clone, Copy)]
pub struct CrossInput<'a> {
    /// Current BEV query, `(B, H·W, C)`.
    pub query: ArrayView3<'a, f32>,
    pub features: &'a CameraFeatures,
    pub residual: Option<ArrayView3<'a, f32>>,
    pub query_pos: Option<ArrayView3<'a, f32>>,
    pub key_pos: Option<ArrayView3<'a, f32>>,
    pub reference_points: &'a ReferencePoints3D,
    /// Per-camera projected points and visibility mask.
    pub projection: &'a Projection,
    pub attn_mask: Option<&'a Array2<f32>>,
    pub key_padding_mask: Option<ArrayView2<'a, bool>>,
}

// ────────────────────────────────────────────────────────────────────────────
// Capabilities
// ────────────────────────────────────────────────────────────────────────────

/// Temporal self-attention between the BEV query and the previous BEV.
///
/// Implementations return the updated query, `(B, H·W, C)`.
pub trait TemporalSelfAttention: Send + Sync {
    fn forward(&self, input: &TemporalInput<'_>) -> Result<Array3<f32>, BevError>;
}

/// Spatial cross-attention from the BEV query into the camera features.
///
/// Implementations must honour the projection mask: masked entries still
/// occupy their slot but must not contribute.
pub trait SpatialCrossAttention: Send + Sync {
    fn forward(&self, input: &CrossInput<'_>) -> Result<Array3<f32>, BevError>;
}

/// The kind of attention a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionKind {
    Temporal,
    SpatialMultiCamera,
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttentionKind::Temporal => write!(f, "temporal"),
            AttentionKind::SpatialMultiCamera => write!(f, "spatial multi-camera"),
        }
    }
}

/// An attention sub-module owned by a layer.
pub enum Attention {
    Temporal(Box<dyn TemporalSelfAttention>),
    SpatialMultiCamera(Box<dyn SpatialCrossAttention>),
}

impl Attention {
    pub fn temporal(attn: impl TemporalSelfAttention + 'static) -> Self {
        Attention::Temporal(Box::new(attn))
    }

    pub fn spatial(attn: impl SpatialCrossAttention + 'static) -> Self {
        Attention::SpatialMultiCamera(Box::new(attn))
    }

    pub fn kind(&self) -> AttentionKind {
        match self {
            Attention::Temporal(_) => AttentionKind::Temporal,
            Attention::SpatialMultiCamera(_) => AttentionKind::SpatialMultiCamera,
        }
    }
}

impl fmt::Debug for Attention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Attention").field(&self.kind()).finish()
    }
}
