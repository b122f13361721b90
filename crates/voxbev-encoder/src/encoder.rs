//! Encoder – drives the attention layers over one BEV query.
//!
//! Per forward pass the encoder:
//!
//! 1. rebatches the 2-D temporal reference points (generated once per
//!    encoder on the configured temporal grid) and duplicates them for the
//!    two-pass temporal value,
//! 2. generates (or accepts) the 3-D pillar reference points,
//! 3. projects the pillar points into every camera once,
//! 4. moves the query and positional encodings from sequence-major
//!    `(H·W, B, C)` to batch-major `(B, H·W, C)`,
//! 5. runs every [`AttentionLayer`] in order, feeding each layer's output to
//!    the next, and returns the last output or all of them stacked.
//!
//! The projection and both reference point sets are shared read-only by all
//! layers; only the running query changes hands between layers.

use std::sync::atomic::{AtomicBool, Ordering};

use ndarray::{Array3, Array4, ArrayView2, ArrayView3, Axis};
use tracing::{debug, info_span, warn};
use voxbev_geometry::{
    CameraParams, CameraProjector, ReferencePoints2D, ReferencePoints3D, generate_2d,
    generate_3d,
};
use voxbev_types::{BevError, OperationTag, PointCloudRange, SpatialShape};

use crate::attention::{Attention, CameraFeatures, SpatialCrossAttention, TemporalSelfAttention};
use crate::config::{EncoderConfig, LayerConfig};
use crate::ffn::FeedForward;
use crate::layer::{AttentionLayer, AttnMasks, LayerInputs};
use crate::norm::LayerNorm;
use crate::shape_error;

// ────────────────────────────────────────────────────────────────────────────
// Sub-module factory
// ────────────────────────────────────────────────────────────────────────────

/// Supplies the sub-modules of each layer built by [`Encoder::build`].
///
/// Attention modules have no default: they wrap an external sampling
/// kernel. Norms default to unit-weight LayerNorm and feed-forwards to
/// zero-weighted MLPs; override them to load trained parameters.
pub trait SubModuleFactory {
    fn temporal_attention(
        &self,
        layer: usize,
        config: &LayerConfig,
    ) -> Result<Box<dyn TemporalSelfAttention>, BevError>;

    fn spatial_attention(
        &self,
        layer: usize,
        config: &LayerConfig,
    ) -> Result<Box<dyn SpatialCrossAttention>, BevError>;

    fn norm(&self, _layer: usize, config: &LayerConfig) -> Result<LayerNorm, BevError> {
        Ok(LayerNorm::with_dims(config.embed_dims, config.norm_eps))
    }

    fn ffn(&self, _layer: usize, config: &LayerConfig) -> Result<FeedForward, BevError> {
        Ok(FeedForward::zeros(config.embed_dims, config.feedforward_channels))
    }
}

fn build_layer(
    layer: usize,
    config: &LayerConfig,
    factory: &dyn SubModuleFactory,
) -> Result<AttentionLayer, BevError> {
    let mut attentions = Vec::new();
    let mut norms = Vec::new();
    let mut ffns = Vec::new();
    for &tag in config.operation_order.tags() {
        match tag {
            OperationTag::SelfAttn => {
                attentions.push(Attention::Temporal(factory.temporal_attention(layer, config)?));
            }
            OperationTag::CrossAttn => {
                attentions.push(Attention::SpatialMultiCamera(
                    factory.spatial_attention(layer, config)?,
                ));
            }
            OperationTag::Norm => norms.push(factory.norm(layer, config)?),
            OperationTag::Ffn => ffns.push(factory.ffn(layer, config)?),
        }
    }
    AttentionLayer::new(attentions, norms, ffns, config.operation_order.clone())
}

// ────────────────────────────────────────────────────────────────────────────
// Inputs / outputs
// ────────────────────────────────────────────────────────────────────────────

/// Inputs of one [`Encoder::forward`] call.
#[derive(Debug, Clone)]
pub struct EncoderInputs<'a> {
    /// Sequence-major BEV query, `(H·W, B, C)`.
    pub bev_query: ArrayView3<'a, f32>,
    pub features: &'a CameraFeatures,
    pub bev_shape: SpatialShape,
    pub camera_params: &'a CameraParams,
    /// Sequence-major positional encoding, `(H·W, B, C)`.
    pub bev_pos: Option<ArrayView3<'a, f32>>,
    /// Sequence-major query encoding for cross-attention, `(H·W, B, C)`.
    pub query_pos: Option<ArrayView3<'a, f32>>,
    /// Key encoding for cross-attention, passed through unchanged.
    pub key_pos: Option<ArrayView3<'a, f32>>,
    /// Batch-major BEV of the previous timestep, `(B, H·W, C)`.
    pub prev_bev: Option<ArrayView3<'a, f32>>,
    /// Overrides the configured point-cloud range.
    pub pc_range: Option<PointCloudRange>,
    /// Caller-generated pillar points; generated from the config otherwise.
    pub ref_3d: Option<&'a ReferencePoints3D>,
    pub attn_masks: AttnMasks,
    pub query_key_padding_mask: Option<ArrayView2<'a, bool>>,
    pub key_padding_mask: Option<ArrayView2<'a, bool>>,
}

impl<'a> EncoderInputs<'a> {
    pub fn new(
        bev_query: ArrayView3<'a, f32>,
        features: &'a CameraFeatures,
        bev_shape: SpatialShape,
        camera_params: &'a CameraParams,
    ) -> Self {
        Self {
            bev_query,
            features,
            bev_shape,
            camera_params,
            bev_pos: None,
            query_pos: None,
            key_pos: None,
            prev_bev: None,
            pc_range: None,
            ref_3d: None,
            attn_masks: AttnMasks::Absent,
            query_key_padding_mask: None,
            key_padding_mask: None,
        }
    }

    pub fn with_bev_pos(mut self, bev_pos: ArrayView3<'a, f32>) -> Self {
        self.bev_pos = Some(bev_pos);
        self
    }

    pub fn with_query_pos(mut self, query_pos: ArrayView3<'a, f32>) -> Self {
        self.query_pos = Some(query_pos);
        self
    }

    pub fn with_key_pos(mut self, key_pos: ArrayView3<'a, f32>) -> Self {
        self.key_pos = Some(key_pos);
        self
    }

    pub fn with_prev_bev(mut self, prev_bev: ArrayView3<'a, f32>) -> Self {
        self.prev_bev = Some(prev_bev);
        self
    }

    pub fn with_pc_range(mut self, pc_range: PointCloudRange) -> Self {
        self.pc_range = Some(pc_range);
        self
    }

    pub fn with_ref_3d(mut self, ref_3d: &'a ReferencePoints3D) -> Self {
        self.ref_3d = Some(ref_3d);
        self
    }

    pub fn with_attn_masks(mut self, masks: AttnMasks) -> Self {
        self.attn_masks = masks;
        self
    }
}

/// Result of [`Encoder::forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderOutput {
    /// Last layer output, `(B, H·W, C)`.
    Final(Array3<f32>),
    /// Every layer output stacked, `(num_layers, B, H·W, C)`.
    Intermediate(Array4<f32>),
}

impl EncoderOutput {
    /// Output of the last layer in either variant.
    pub fn last(&self) -> ArrayView3<'_, f32> {
        match self {
            EncoderOutput::Final(out) => out.view(),
            EncoderOutput::Intermediate(stack) => stack.index_axis(Axis(0), stack.dim().0 - 1),
        }
    }

    pub fn into_final(self) -> Option<Array3<f32>> {
        match self {
            EncoderOutput::Final(out) => Some(out),
            EncoderOutput::Intermediate(_) => None,
        }
    }

    pub fn into_intermediate(self) -> Option<Array4<f32>> {
        match self {
            EncoderOutput::Intermediate(stack) => Some(stack),
            EncoderOutput::Final(_) => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Encoder
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Encoder {
    layers: Vec<AttentionLayer>,
    projector: CameraProjector,
    pc_range: PointCloudRange,
    num_points_in_pillar: usize,
    pillar_height: usize,
    /// Temporal grid points at batch 1; rebatched per call.
    temporal_points: ReferencePoints2D,
    return_intermediate: bool,
    grid_mismatch_reported: AtomicBool,
}

impl Encoder {
    /// Wrap already-built layers.
    ///
    /// # Errors
    ///
    /// [`BevError::InvalidConfig`] when `config` is invalid or `layers` is
    /// empty.
    pub fn new(config: &EncoderConfig, layers: Vec<AttentionLayer>) -> Result<Self, BevError> {
        config.validate()?;
        if layers.is_empty() {
            return Err(BevError::InvalidConfig(
                "encoder needs at least one layer".to_string(),
            ));
        }
        Ok(Self {
            layers,
            projector: config.projector(),
            pc_range: config.pc_range,
            num_points_in_pillar: config.num_points_in_pillar,
            pillar_height: config.pillar_height,
            temporal_points: generate_2d(
                config.temporal_grid.height,
                config.temporal_grid.width,
                1,
            ),
            return_intermediate: config.return_intermediate,
            grid_mismatch_reported: AtomicBool::new(false),
        })
    }

    /// Build `config.num_layers` identical layers from `factory`.
    pub fn build(config: &EncoderConfig, factory: &dyn SubModuleFactory) -> Result<Self, BevError> {
        config.validate()?;
        let layers = (0..config.num_layers)
            .map(|lid| build_layer(lid, &config.layer, factory))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(config, layers)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[AttentionLayer] {
        &self.layers
    }

    pub fn projector(&self) -> &CameraProjector {
        &self.projector
    }

    pub fn return_intermediate(&self) -> bool {
        self.return_intermediate
    }

    pub fn forward(&self, inputs: &EncoderInputs<'_>) -> Result<EncoderOutput, BevError> {
        let (num_query, batch, _) = inputs.bev_query.dim();
        if num_query != inputs.bev_shape.len() {
            return Err(BevError::Shape(format!(
                "BEV query holds {num_query} cells but the grid is {}x{}",
                inputs.bev_shape.height, inputs.bev_shape.width
            )));
        }
        self.report_grid_mismatch(inputs.bev_shape);

        let ref_2d = self.temporal_points.with_batch(batch).hybrid();
        let generated;
        let ref_3d = match inputs.ref_3d {
            Some(points) => points,
            None => {
                generated = generate_3d(
                    inputs.bev_shape.height,
                    inputs.bev_shape.width,
                    self.pillar_height,
                    self.num_points_in_pillar,
                    batch,
                );
                &generated
            }
        };
        if ref_3d.batch() != batch || ref_3d.num_queries() != num_query {
            return Err(BevError::Shape(format!(
                "pillar points cover batch {} x {} cells, query is batch {batch} x {num_query}",
                ref_3d.batch(),
                ref_3d.num_queries()
            )));
        }

        let pc_range = inputs.pc_range.unwrap_or(self.pc_range);
        let projection = self.projector.project(ref_3d, &pc_range, inputs.camera_params)?;

        let layer_inputs = LayerInputs {
            features: inputs.features,
            bev_shape: inputs.bev_shape,
            ref_2d: &ref_2d,
            ref_3d,
            projection: &projection,
            bev_pos: inputs.bev_pos.as_ref().map(|v| to_batch_major(v.view())),
            query_pos: inputs.query_pos.as_ref().map(|v| to_batch_major(v.view())),
            key_pos: inputs.key_pos.as_ref().map(|v| v.view()),
            prev_bev: inputs.prev_bev.as_ref().map(|v| v.view()),
            attn_masks: &inputs.attn_masks,
            query_key_padding_mask: inputs.query_key_padding_mask.as_ref().map(|m| m.view()),
            key_padding_mask: inputs.key_padding_mask.as_ref().map(|m| m.view()),
        };

        let mut query = to_batch_major(inputs.bev_query).as_standard_layout().into_owned();
        let mut intermediate = Vec::with_capacity(if self.return_intermediate {
            self.layers.len()
        } else {
            0
        });
        for (lid, layer) in self.layers.iter().enumerate() {
            let _span = info_span!("encoder_layer", layer = lid).entered();
            query = layer.forward(query, &layer_inputs)?;
            if self.return_intermediate {
                intermediate.push(query.clone());
            }
        }
        debug!(
            layers = self.layers.len(),
            batch,
            num_query,
            visible = projection.visible_count(),
            "encoder pass complete"
        );

        if self.return_intermediate {
            let views: Vec<_> = intermediate.iter().map(Array3::view).collect();
            let stack = ndarray::stack(Axis(0), &views).map_err(shape_error)?;
            Ok(EncoderOutput::Intermediate(stack))
        } else {
            Ok(EncoderOutput::Final(query))
        }
    }

    fn report_grid_mismatch(&self, bev_shape: SpatialShape) {
        let temporal_grid = self.temporal_points.grid();
        if bev_shape != temporal_grid
            && !self.grid_mismatch_reported.swap(true, Ordering::Relaxed)
        {
            warn!(
                bev_h = bev_shape.height,
                bev_w = bev_shape.width,
                temporal_h = temporal_grid.height,
                temporal_w = temporal_grid.width,
                "temporal reference grid differs from the BEV grid"
            );
        }
    }
}

/// `(H·W, B, C)` → `(B, H·W, C)` as a view.
fn to_batch_major(x: ArrayView3<'_, f32>) -> ArrayView3<'_, f32> {
    x.permuted_axes([1, 0, 2])
}
