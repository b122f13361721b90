//! Reference Point Generator.
//!
//! Produces the normalized sample points that anchor BEV queries:
//!
//! - **3-D pillar points** – `D` height samples per BEV cell, used by spatial
//!   cross-attention after projection into the cameras.
//! - **2-D plane points** – one point per BEV cell, used by temporal
//!   self-attention.
//!
//! Both grids are generated once and shared read-only across the batch: the
//! underlying buffer is held behind an [`Arc`] and the batch axis is a
//! zero-copy broadcast.
//!
//! Cell centres are computed in `f64` and only then narrowed to `f32`, so the
//! outermost cells of large grids do not pick up visible quantization error.
//!
//! # Example
//!
//! ```rust
//! use voxbev_geometry::reference_points::generate_3d;
//!
//! let pts = generate_3d(2, 2, 8, 1, 1);
//! assert_eq!(pts.num_points_in_pillar(), 1);
//! assert_eq!(pts.num_queries(), 4);
//! assert!((pts.points()[[0, 3, 0]] - 0.75).abs() < 1e-6);
//! ```

use std::sync::Arc;

use ndarray::{Array3, ArrayView3, ArrayView4};
use voxbev_types::{BevError, SpatialShape};

// ────────────────────────────────────────────────────────────────────────────
// ReferencePoints3D
// ────────────────────────────────────────────────────────────────────────────

/// Normalized pillar sample points of shape `(D, H·W, 3)`, logically
/// broadcast over `batch`.
#[derive(Debug, Clone)]
pub struct ReferencePoints3D {
    points: Arc<Array3<f32>>,
    batch: usize,
}

impl ReferencePoints3D {
    /// The shared `(D, H·W, 3)` buffer.
    pub fn points(&self) -> ArrayView3<'_, f32> {
        self.points.view()
    }

    /// Batched view of shape `(batch, D, H·W, 3)` without copying.
    pub fn batched(&self) -> Result<ArrayView4<'_, f32>, BevError> {
        let (d, q, c) = self.points.dim();
        self.points
            .broadcast((self.batch, d, q, c))
            .ok_or_else(|| BevError::Shape("cannot broadcast 3-D reference points".to_string()))
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// `D`, the number of height samples per pillar.
    pub fn num_points_in_pillar(&self) -> usize {
        self.points.dim().0
    }

    /// `H·W`, the number of BEV cells.
    pub fn num_queries(&self) -> usize {
        self.points.dim().1
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ReferencePoints2D
// ────────────────────────────────────────────────────────────────────────────

/// Normalized planar points of shape `(H·W, 1, 2)`, logically broadcast over
/// `batch`.
#[derive(Debug, Clone)]
pub struct ReferencePoints2D {
    points: Arc<Array3<f32>>,
    grid: SpatialShape,
    batch: usize,
}

impl ReferencePoints2D {
    /// The shared `(H·W, 1, 2)` buffer.
    pub fn points(&self) -> ArrayView3<'_, f32> {
        self.points.view()
    }

    /// Batched view of shape `(batch, H·W, 1, 2)` without copying.
    pub fn batched(&self) -> Result<ArrayView4<'_, f32>, BevError> {
        let (q, l, c) = self.points.dim();
        self.points
            .broadcast((self.batch, q, l, c))
            .ok_or_else(|| BevError::Shape("cannot broadcast 2-D reference points".to_string()))
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Grid the points were sampled on.
    pub fn grid(&self) -> SpatialShape {
        self.grid
    }

    pub fn num_queries(&self) -> usize {
        self.points.dim().0
    }

    /// Same grid for another batch size, sharing the buffer.
    pub fn with_batch(&self, batch: usize) -> Self {
        Self {
            points: Arc::clone(&self.points),
            grid: self.grid,
            batch,
        }
    }

    /// Duplicate along a leading "two-pass" axis: the result covers
    /// `2 · batch` entries and still shares the same buffer.
    pub fn hybrid(&self) -> Self {
        Self {
            points: Arc::clone(&self.points),
            grid: self.grid,
            batch: self.batch * 2,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Generators
// ────────────────────────────────────────────────────────────────────────────

/// Generate the 3-D pillar points for an `h × w` BEV grid.
///
/// `z` is the pillar height in cells; `num_points_in_pillar` samples are
/// spread evenly over `[0.5, z - 0.5]` and divided by `z`. A single sample
/// sits at `0.5 / z`.
pub fn generate_3d(
    h: usize,
    w: usize,
    z: usize,
    num_points_in_pillar: usize,
    batch: usize,
) -> ReferencePoints3D {
    let zs = linspace(0.5, z as f64 - 0.5, num_points_in_pillar);
    let (hf, wf, zf) = (h as f64, w as f64, z as f64);

    let points = Array3::from_shape_fn((num_points_in_pillar, h * w, 3), |(d, q, c)| {
        let (row, col) = (q / w, q % w);
        let v = match c {
            0 => (col as f64 + 0.5) / wf,
            1 => (row as f64 + 0.5) / hf,
            _ => zs[d] / zf,
        };
        v as f32
    });

    ReferencePoints3D {
        points: Arc::new(points),
        batch,
    }
}

/// Generate the 2-D plane points for an `h × w` grid.
pub fn generate_2d(h: usize, w: usize, batch: usize) -> ReferencePoints2D {
    let (hf, wf) = (h as f64, w as f64);
    let points = Array3::from_shape_fn((h * w, 1, 2), |(q, _, c)| {
        let (row, col) = (q / w, q % w);
        let v = if c == 0 {
            (col as f64 + 0.5) / wf
        } else {
            (row as f64 + 0.5) / hf
        };
        v as f32
    });

    ReferencePoints2D {
        points: Arc::new(points),
        grid: SpatialShape::new(h, w),
        batch,
    }
}

/// `n` evenly spaced values from `start` to `end` inclusive; `[start]` when
/// `n == 1`.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
