//! `voxbev-geometry` – BEV sampling geometry.
//!
//! Turns a BEV grid and a camera rig into the sampling geometry that the
//! attention layers consume.
//!
//! # Modules
//!
//! - [`reference_points`] – [`generate_3d`][reference_points::generate_3d] /
//!   [`generate_2d`][reference_points::generate_2d]: normalized pillar and
//!   plane sample points, shared read-only across the batch.
//! - [`camera`] – [`CameraParams`][camera::CameraParams]: per-camera
//!   extrinsics, intrinsics, image post-transform and the batch-level
//!   augmentation.
//! - [`projection`] – [`CameraProjector`][projection::CameraProjector]:
//!   projects pillar points into every camera, producing normalized pixel
//!   coordinates and a visibility mask.

pub mod camera;
pub mod projection;
pub mod reference_points;

pub use camera::{Augmentation, BatchCalibration, CameraCalibration, CameraParams, Intrinsics};
pub use projection::{CameraProjector, Projection};
pub use reference_points::{ReferencePoints2D, ReferencePoints3D, generate_2d, generate_3d};
