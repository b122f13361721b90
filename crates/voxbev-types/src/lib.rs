use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of an attention layer's operation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationTag {
    /// Temporal self-attention against the previous BEV state.
    SelfAttn,
    /// Layer normalization.
    Norm,
    /// Spatial cross-attention against the multi-camera features.
    CrossAttn,
    /// Feed-forward block.
    Ffn,
}

impl OperationTag {
    /// True for the two tags that consume an attention sub-module.
    pub fn is_attention(self) -> bool {
        matches!(self, OperationTag::SelfAttn | OperationTag::CrossAttn)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationTag::SelfAttn => "self_attn",
            OperationTag::Norm => "norm",
            OperationTag::CrossAttn => "cross_attn",
            OperationTag::Ffn => "ffn",
        }
    }
}

impl fmt::Display for OperationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationTag {
    type Err = BevError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self_attn" => Ok(OperationTag::SelfAttn),
            "norm" => Ok(OperationTag::Norm),
            "cross_attn" => Ok(OperationTag::CrossAttn),
            "ffn" => Ok(OperationTag::Ffn),
            other => Err(BevError::InvalidConfig(format!(
                "unknown operation tag `{other}`"
            ))),
        }
    }
}

/// Axis-aligned physical volume the normalized reference points live in.
///
/// Serialized as the conventional six scalars
/// `[xmin, ymin, zmin, xmax, ymax, zmax]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 6]", into = "[f32; 6]")]
pub struct PointCloudRange {
    pub min: [f32; 3],
    pub max: [f32; 3],
}

impl PointCloudRange {
    pub fn new(min: [f32; 3], max: [f32; 3]) -> Self {
        Self { min, max }
    }

    /// Extent of axis `axis` (0 = x, 1 = y, 2 = z).
    pub fn extent(&self, axis: usize) -> f32 {
        self.max[axis] - self.min[axis]
    }

    /// Map a normalized `[0, 1]³` coordinate into the physical range.
    pub fn denormalize(&self, p: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|i| p[i] * self.extent(i) + self.min[i])
    }

    /// Inverse of [`denormalize`][Self::denormalize].
    pub fn normalize(&self, p: [f32; 3]) -> [f32; 3] {
        std::array::from_fn(|i| (p[i] - self.min[i]) / self.extent(i))
    }
}

impl From<[f32; 6]> for PointCloudRange {
    fn from(v: [f32; 6]) -> Self {
        Self::new([v[0], v[1], v[2]], [v[3], v[4], v[5]])
    }
}

impl From<PointCloudRange> for [f32; 6] {
    fn from(r: PointCloudRange) -> Self {
        [r.min[0], r.min[1], r.min[2], r.max[0], r.max[1], r.max[2]]
    }
}

impl Default for PointCloudRange {
    fn default() -> Self {
        Self::from([0.0, -25.6, -2.0, 51.2, 25.6, 4.4])
    }
}

/// Size of the (post-augmentation) camera image in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub height: usize,
    pub width: usize,
}

impl ImageSize {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }
}

impl Default for ImageSize {
    fn default() -> Self {
        Self::new(384, 1280)
    }
}

/// Near/far depth bounds (metres) used to normalize the optional depth channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthBounds {
    pub near: f32,
    pub far: f32,
}

impl DepthBounds {
    pub fn new(near: f32, far: f32) -> Self {
        Self { near, far }
    }

    /// Map a metric depth into `[0, 1]` over `[near, far]`. Values outside
    /// the bounds are not clamped.
    pub fn normalize(&self, depth: f32) -> f32 {
        (depth - self.near) / (self.far - self.near)
    }
}

impl Default for DepthBounds {
    fn default() -> Self {
        Self::new(2.0, 58.0)
    }
}

/// Spatial extent of one feature level (or the single BEV level).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpatialShape {
    pub height: usize,
    pub width: usize,
}

impl SpatialShape {
    pub fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn len(&self) -> usize {
        self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Offsets of each level in a flattened multi-level value tensor.
pub fn level_start_index(shapes: &[SpatialShape]) -> Vec<usize> {
    shapes
        .iter()
        .scan(0usize, |offset, s| {
            let start = *offset;
            *offset += s.len();
            Some(start)
        })
        .collect()
}

/// Error type shared by the projection geometry and the encoder.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BevError {
    #[error("operation order lists {found} {module} op(s) but {expected} sub-module(s) are configured")]
    OperationOrderMismatch {
        module: String,
        expected: usize,
        found: usize,
    },

    #[error("attention slot {slot} requires a {expected} attention")]
    AttentionKindMismatch { slot: usize, expected: String },

    #[error("matrix `{name}` has unsupported shape {rows}x{cols}")]
    InvalidMatrixShape {
        name: String,
        rows: usize,
        cols: usize,
    },

    #[error("matrix `{0}` is singular")]
    SingularMatrix(String),

    #[error("{found} attention masks supplied for {expected} attention op(s)")]
    AttentionMaskCount { expected: usize, found: usize },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("attention failed: {0}")]
    Attention(String),
}
