//! Camera calibration bundle.
//!
//! Holds the rigid and projective parameters that relate the ego frame to
//! each camera image:
//!
//! ```text
//! ego ──(bda⁻¹)──▶ ego' ──(R⁻¹·(p − t))──▶ camera ──(K)──▶ image ──(post)──▶ augmented image
//! ```
//!
//! The batch-level augmentation (`bda`) and the intrinsics each come in two
//! flavours: a plain 3×3 linear map or a 4×4 homogeneous matrix that also
//! carries a translation / offset row. Anything else is a configuration
//! error reported when the bundle is built.
//!
//! # Example
//!
//! ```rust
//! use nalgebra::{Matrix2, Matrix3, Vector2, Vector3};
//! use voxbev_geometry::camera::{CameraCalibration, Intrinsics};
//!
//! let cam = CameraCalibration {
//!     rotation: Matrix3::identity(),
//!     translation: Vector3::new(0.0, 0.0, -1.0),
//!     intrinsics: Intrinsics::Pinhole(Matrix3::identity()),
//!     post_rotation: Matrix2::identity(),
//!     post_translation: Vector2::zeros(),
//! };
//! let p = cam.to_camera_frame(&cam.inverse_rotation().unwrap(), Vector3::zeros());
//! assert!((p.z - 1.0).abs() < 1e-6);
//! ```

use nalgebra::{Matrix2, Matrix3, Matrix4, Vector2, Vector3};
use ndarray::{ArrayView2, ArrayView3, ArrayView4, s};
use voxbev_types::BevError;

// ────────────────────────────────────────────────────────────────────────────
// Augmentation
// ────────────────────────────────────────────────────────────────────────────

/// Batch-level BEV data augmentation applied to the ego frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Augmentation {
    /// Rotation / scale / flip without translation.
    Linear(Matrix3<f32>),
    /// Homogeneous transform that may include a translation.
    Homogeneous(Matrix4<f32>),
}

impl Augmentation {
    pub fn identity() -> Self {
        Augmentation::Linear(Matrix3::identity())
    }

    /// Build from a 3×3 or 4×4 array.
    pub fn from_view(m: ArrayView2<'_, f32>) -> Result<Self, BevError> {
        match m.dim() {
            (3, 3) => Ok(Augmentation::Linear(Matrix3::from_fn(|r, c| m[[r, c]]))),
            (4, 4) => Ok(Augmentation::Homogeneous(Matrix4::from_fn(|r, c| m[[r, c]]))),
            (rows, cols) => Err(BevError::InvalidMatrixShape {
                name: "bda".to_string(),
                rows,
                cols,
            }),
        }
    }

    /// The inverse augmentation.
    pub fn inverse(&self) -> Result<Self, BevError> {
        let singular = || BevError::SingularMatrix("bda".to_string());
        match self {
            Augmentation::Linear(m) => m.try_inverse().map(Augmentation::Linear).ok_or_else(singular),
            Augmentation::Homogeneous(m) => m
                .try_inverse()
                .map(Augmentation::Homogeneous)
                .ok_or_else(singular),
        }
    }

    /// Apply to a point. The homogeneous form appends `w = 1` and drops the
    /// fourth component of the result without dividing by it.
    pub fn apply(&self, p: Vector3<f32>) -> Vector3<f32> {
        match self {
            Augmentation::Linear(m) => m * p,
            Augmentation::Homogeneous(m) => (m * p.push(1.0)).xyz(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Intrinsics
// ────────────────────────────────────────────────────────────────────────────

/// Camera intrinsic matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intrinsics {
    /// Standard 3×3 pinhole matrix.
    Pinhole(Matrix3<f32>),
    /// 4×4 matrix, possibly carrying an extra offset row/column.
    Homogeneous(Matrix4<f32>),
}

impl Intrinsics {
    pub fn from_view(m: ArrayView2<'_, f32>) -> Result<Self, BevError> {
        match m.dim() {
            (3, 3) => Ok(Intrinsics::Pinhole(Matrix3::from_fn(|r, c| m[[r, c]]))),
            (4, 4) => Ok(Intrinsics::Homogeneous(Matrix4::from_fn(|r, c| m[[r, c]]))),
            (rows, cols) => Err(BevError::InvalidMatrixShape {
                name: "intrins".to_string(),
                rows,
                cols,
            }),
        }
    }

    /// Map a camera-frame point to `(u·d, v·d, d)`.
    pub fn project(&self, p: Vector3<f32>) -> Vector3<f32> {
        match self {
            Intrinsics::Pinhole(k) => k * p,
            Intrinsics::Homogeneous(k) => (k * p.push(1.0)).xyz(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CameraCalibration
// ────────────────────────────────────────────────────────────────────────────

/// Extrinsics, intrinsics and post-processing image transform of one camera.
///
/// `rotation`/`translation` give the camera pose in the ego frame: a
/// camera-frame point `c` sits at `rotation · c + translation` in the ego
/// frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraCalibration {
    pub rotation: Matrix3<f32>,
    pub translation: Vector3<f32>,
    pub intrinsics: Intrinsics,
    /// Image-plane rotation/scale applied after projection (resize, flip).
    pub post_rotation: Matrix2<f32>,
    /// Image-plane offset applied after `post_rotation` (crop).
    pub post_translation: Vector2<f32>,
}

impl CameraCalibration {
    /// A camera at the ego origin with identity intrinsics and no image
    /// post-processing.
    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vector3::zeros(),
            intrinsics: Intrinsics::Pinhole(Matrix3::identity()),
            post_rotation: Matrix2::identity(),
            post_translation: Vector2::zeros(),
        }
    }

    pub fn inverse_rotation(&self) -> Result<Matrix3<f32>, BevError> {
        self.rotation
            .try_inverse()
            .ok_or_else(|| BevError::SingularMatrix("rots".to_string()))
    }

    /// Express an ego-frame point in this camera's frame. `inv_rotation`
    /// is the cached result of [`inverse_rotation`][Self::inverse_rotation].
    pub fn to_camera_frame(&self, inv_rotation: &Matrix3<f32>, p: Vector3<f32>) -> Vector3<f32> {
        inv_rotation * (p - self.translation)
    }

    /// Apply the post-processing image transform to a pixel coordinate.
    pub fn post_process(&self, uv: Vector2<f32>) -> Vector2<f32> {
        self.post_rotation * uv + self.post_translation
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CameraParams
// ────────────────────────────────────────────────────────────────────────────

/// Calibration of every camera for one batch item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCalibration {
    pub augmentation: Augmentation,
    pub cameras: Vec<CameraCalibration>,
}

/// Per-forward-pass camera parameters for the whole batch.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraParams {
    pub batches: Vec<BatchCalibration>,
}

impl CameraParams {
    pub fn new(batches: Vec<BatchCalibration>) -> Self {
        Self { batches }
    }

    pub fn batch_size(&self) -> usize {
        self.batches.len()
    }

    /// Number of cameras, taken from the first batch item.
    pub fn num_cameras(&self) -> usize {
        self.batches.first().map_or(0, |b| b.cameras.len())
    }

    /// Build from the stacked tensor layout:
    ///
    /// | Tensor | Shape |
    /// |---|---|
    /// | `rots` | `(B, N, 3, 3)` |
    /// | `trans` | `(B, N, 3)` |
    /// | `intrins` | `(B, N, k, k)`, `k ∈ {3, 4}` |
    /// | `post_rots` | `(B, N, ≥2, ≥2)`, top-left 2×2 used |
    /// | `post_trans` | `(B, N, ≥2)`, first two used |
    /// | `bda` | `(B, k, k)`, `k ∈ {3, 4}` |
    pub fn from_arrays(
        rots: ArrayView4<'_, f32>,
        trans: ArrayView3<'_, f32>,
        intrins: ArrayView4<'_, f32>,
        post_rots: ArrayView4<'_, f32>,
        post_trans: ArrayView3<'_, f32>,
        bda: ArrayView3<'_, f32>,
    ) -> Result<Self, BevError> {
        let (b, n, _) = trans.dim();
        if trans.dim().2 != 3 {
            return Err(matrix_shape("trans", trans.dim().2, 1));
        }
        let (_, _, rr, rc) = rots.dim();
        if (rr, rc) != (3, 3) {
            return Err(matrix_shape("rots", rr, rc));
        }
        let (_, _, pr, pc) = post_rots.dim();
        if pr < 2 || pc < 2 {
            return Err(matrix_shape("post_rots", pr, pc));
        }
        if post_trans.dim().2 < 2 {
            return Err(matrix_shape("post_trans", post_trans.dim().2, 1));
        }
        for (name, dims) in [
            ("rots", &rots.shape()[..2]),
            ("intrins", &intrins.shape()[..2]),
            ("post_rots", &post_rots.shape()[..2]),
            ("post_trans", &post_trans.shape()[..2]),
        ] {
            if dims != [b, n] {
                return Err(BevError::Shape(format!(
                    "`{name}` leading dims {dims:?} do not match trans ({b}, {n})"
                )));
            }
        }
        if bda.dim().0 != b {
            return Err(BevError::Shape(format!(
                "`bda` batch {} does not match trans batch {b}",
                bda.dim().0
            )));
        }

        let batches = (0..b)
            .map(|bi| {
                let augmentation = Augmentation::from_view(bda.slice(s![bi, .., ..]))?;
                let cameras = (0..n)
                    .map(|ci| {
                        let r = rots.slice(s![bi, ci, .., ..]);
                        let t = trans.slice(s![bi, ci, ..]);
                        let pr = post_rots.slice(s![bi, ci, .., ..]);
                        let pt = post_trans.slice(s![bi, ci, ..]);
                        Ok(CameraCalibration {
                            rotation: Matrix3::from_fn(|i, j| r[[i, j]]),
                            translation: Vector3::new(t[0], t[1], t[2]),
                            intrinsics: Intrinsics::from_view(intrins.slice(s![bi, ci, .., ..]))?,
                            post_rotation: Matrix2::from_fn(|i, j| pr[[i, j]]),
                            post_translation: Vector2::new(pt[0], pt[1]),
                        })
                    })
                    .collect::<Result<Vec<_>, BevError>>()?;
                Ok(BatchCalibration {
                    augmentation,
                    cameras,
                })
            })
            .collect::<Result<Vec<_>, BevError>>()?;

        Ok(Self { batches })
    }
}

fn matrix_shape(name: &str, rows: usize, cols: usize) -> BevError {
    BevError::InvalidMatrixShape {
        name: name.to_string(),
        rows,
        cols,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
