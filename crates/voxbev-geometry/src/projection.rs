//! Camera Projector.
//!
//! Maps normalized 3-D pillar points into every camera image and reports
//! which projections land inside the image.
//!
//! For each batch item `b`, camera `n`, query `q` and pillar level `d`:
//!
//! 1. de-normalize the point into the point-cloud range;
//! 2. undo the batch augmentation (`bda⁻¹`, homogenized when 4×4);
//! 3. move into the camera frame: `R⁻¹ · (p − t)`;
//! 4. apply the intrinsics (homogenized when 4×4), giving `(u·d, v·d, d)`;
//! 5. divide `u·d, v·d` by `max(d, ε)`;
//! 6. apply the post rotation and translation;
//! 7. divide by the image width / height;
//! 8. optionally normalize depth over the configured near/far bounds;
//! 9. mark visible iff `d > ε` and both normalized coordinates lie strictly
//!    inside `(ε, 1 − ε)`.
//!
//! Invisible points keep their slot in the output; consumers gate on the
//! mask.
//!
//! Blocks of `(camera, batch)` are evaluated in parallel with `rayon`; each
//! block writes a disjoint slice so the result does not depend on
//! scheduling.

use nalgebra::{Matrix3, Vector2, Vector3};
use ndarray::{Array2, Array3, Array4, Array5, ArrayView4, ArrayView5, Axis, s};
use rayon::prelude::*;
use tracing::debug;
use voxbev_types::{BevError, DepthBounds, ImageSize, PointCloudRange};

use crate::camera::{Augmentation, CameraCalibration, CameraParams};
use crate::reference_points::ReferencePoints3D;

/// Depth guard and image-border margin.
pub const EPS: f32 = 1e-5;

// ────────────────────────────────────────────────────────────────────────────
// Projection
// ────────────────────────────────────────────────────────────────────────────

/// Result of [`CameraProjector::project`].
///
/// - `points`: `(num_cameras, batch, H·W, D, C)` with `C = 2` (normalized
///   pixel x, y) or `C = 3` (plus normalized depth).
/// - `mask`: `(num_cameras, batch, H·W, D)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    points: Array5<f32>,
    mask: Array4<bool>,
}

impl Projection {
    pub fn points(&self) -> ArrayView5<'_, f32> {
        self.points.view()
    }

    pub fn mask(&self) -> ArrayView4<'_, bool> {
        self.mask.view()
    }

    pub fn num_cameras(&self) -> usize {
        self.points.dim().0
    }

    /// Coordinates per point: 2 without a depth channel, 3 with.
    pub fn channels(&self) -> usize {
        self.points.dim().4
    }

    /// Number of visible (camera, batch, query, level) entries.
    pub fn visible_count(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// CameraProjector
// ────────────────────────────────────────────────────────────────────────────

/// Projects pillar reference points into the camera images.
///
/// # Example
///
/// ```rust
/// use voxbev_geometry::camera::{Augmentation, BatchCalibration, CameraCalibration, CameraParams};
/// use voxbev_geometry::projection::CameraProjector;
/// use voxbev_geometry::reference_points::generate_3d;
/// use voxbev_types::{ImageSize, PointCloudRange};
///
/// let params = CameraParams::new(vec![BatchCalibration {
///     augmentation: Augmentation::identity(),
///     cameras: vec![CameraCalibration::identity()],
/// }]);
/// let points = generate_3d(2, 2, 4, 2, 1);
/// let range = PointCloudRange::from([-1.0, -1.0, 1.0, 1.0, 1.0, 3.0]);
///
/// let projection = CameraProjector::new(ImageSize::new(4, 4))
///     .project(&points, &range, &params)
///     .unwrap();
/// assert_eq!(projection.points().dim(), (1, 1, 4, 2, 2));
/// assert_eq!(projection.mask().dim(), (1, 1, 4, 2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraProjector {
    image_size: ImageSize,
    depth_channel: Option<DepthBounds>,
}

/// Per-camera state hoisted out of the per-point loop.
struct PreparedCamera<'a> {
    calibration: &'a CameraCalibration,
    inv_rotation: Matrix3<f32>,
    inv_augmentation: Augmentation,
}

impl CameraProjector {
    /// Projector emitting 2 channels (normalized pixel x, y).
    pub fn new(image_size: ImageSize) -> Self {
        Self {
            image_size,
            depth_channel: None,
        }
    }

    /// Also emit the depth normalized over `bounds` as a third channel.
    pub fn with_depth_channel(mut self, bounds: DepthBounds) -> Self {
        self.depth_channel = Some(bounds);
        self
    }

    pub fn image_size(&self) -> ImageSize {
        self.image_size
    }

    pub fn channels(&self) -> usize {
        if self.depth_channel.is_some() { 3 } else { 2 }
    }

    /// Project `points` into every camera of `params`.
    ///
    /// # Errors
    ///
    /// - [`BevError::SingularMatrix`] – an augmentation or camera rotation
    ///   cannot be inverted.
    /// - [`BevError::Shape`] – batch items disagree on the camera count, or
    ///   the reference points were generated for a different batch size.
    pub fn project(
        &self,
        points: &ReferencePoints3D,
        pc_range: &PointCloudRange,
        params: &CameraParams,
    ) -> Result<Projection, BevError> {
        let batch = params.batch_size();
        let num_cams = params.num_cameras();
        if points.batch() != batch {
            return Err(BevError::Shape(format!(
                "reference points cover batch {} but camera params cover {batch}",
                points.batch()
            )));
        }

        let prepared = params
            .batches
            .iter()
            .enumerate()
            .map(|(b, item)| {
                if item.cameras.len() != num_cams {
                    return Err(BevError::Shape(format!(
                        "batch item {b} has {} cameras, expected {num_cams}",
                        item.cameras.len()
                    )));
                }
                let inv_augmentation = item.augmentation.inverse()?;
                item.cameras
                    .iter()
                    .map(|calibration| {
                        Ok(PreparedCamera {
                            calibration,
                            inv_rotation: calibration.inverse_rotation()?,
                            inv_augmentation,
                        })
                    })
                    .collect::<Result<Vec<_>, BevError>>()
            })
            .collect::<Result<Vec<_>, BevError>>()?;

        // De-normalize into a fresh buffer; the shared reference points are
        // never written.
        let world = points.points().map_axis(Axis(2), |p| {
            Vector3::from(pc_range.denormalize([p[0], p[1], p[2]]))
        });

        let (num_levels, num_queries) = world.dim();
        let channels = self.channels();

        let blocks: Vec<(Array3<f32>, Array2<bool>)> = (0..num_cams * batch)
            .into_par_iter()
            .map(|idx| {
                let camera = &prepared[idx % batch][idx / batch];
                self.project_block(camera, &world, num_queries, num_levels, channels)
            })
            .collect();

        let mut out_points = Array5::<f32>::zeros((num_cams, batch, num_queries, num_levels, channels));
        let mut out_mask = Array4::<bool>::from_elem((num_cams, batch, num_queries, num_levels), false);
        for (idx, (block_points, block_mask)) in blocks.into_iter().enumerate() {
            let (n, b) = (idx / batch, idx % batch);
            out_points.slice_mut(s![n, b, .., .., ..]).assign(&block_points);
            out_mask.slice_mut(s![n, b, .., ..]).assign(&block_mask);
        }

        let projection = Projection {
            points: out_points,
            mask: out_mask,
        };
        debug!(
            cameras = num_cams,
            batch,
            queries = num_queries,
            levels = num_levels,
            visible = projection.visible_count(),
            "projected reference points"
        );
        Ok(projection)
    }

    /// Project every `(query, level)` point for one `(camera, batch)` pair.
    fn project_block(
        &self,
        camera: &PreparedCamera<'_>,
        world: &Array2<Vector3<f32>>,
        num_queries: usize,
        num_levels: usize,
        channels: usize,
    ) -> (Array3<f32>, Array2<bool>) {
        let mut points = Array3::<f32>::zeros((num_queries, num_levels, channels));
        let mut mask = Array2::<bool>::from_elem((num_queries, num_levels), false);

        for ((d, q), &p) in world.indexed_iter() {
            let (coords, visible) = self.project_point(camera, p);
            points[[q, d, 0]] = coords[0];
            points[[q, d, 1]] = coords[1];
            if channels == 3 {
                points[[q, d, 2]] = coords[2];
            }
            mask[[q, d]] = visible;
        }
        (points, mask)
    }

    /// Project one de-normalized ego-frame point. Returns
    /// `[x_norm, y_norm, depth_channel]` and the visibility flag.
    fn project_point(&self, camera: &PreparedCamera<'_>, p: Vector3<f32>) -> ([f32; 3], bool) {
        let cal = camera.calibration;
        let p = camera.inv_augmentation.apply(p);
        let p = cal.to_camera_frame(&camera.inv_rotation, p);
        let homogeneous = cal.intrinsics.project(p);

        let depth = homogeneous.z;
        let uv = Vector2::new(homogeneous.x, homogeneous.y) / depth.max(EPS);
        let uv = cal.post_process(uv);

        let x = uv.x / self.image_size.width as f32;
        let y = uv.y / self.image_size.height as f32;
        let depth_channel = self.depth_channel.map_or(depth, |b| b.normalize(depth));

        (
            [x, y, depth_channel],
            is_visible(depth, x, y),
        )
    }
}

/// Visibility rule: positive depth and strictly inside the image with an
/// `EPS` margin on every side.
pub fn is_visible(depth: f32, x: f32, y: f32) -> bool {
    depth > EPS && x > EPS && x < 1.0 - EPS && y > EPS && y < 1.0 - EPS
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
