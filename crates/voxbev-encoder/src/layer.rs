//! Attention Layer – the per-layer operation state machine.
//!
//! A layer owns its attention, normalization and feed-forward sub-modules
//! and an [`OperationOrder`] that says in which sequence to apply them. One
//! call to [`AttentionLayer::forward`] walks the order left to right,
//! carrying two running tensors:
//!
//! - `query` – the current BEV features, replaced by every op.
//! - `identity` – the residual anchor, reset to `query` after every
//!   attention op.
//!
//! Sub-modules are consumed in order through independent cursors, so the
//! second `norm` tag uses the second norm, and so on. Counts and attention
//! kinds are checked once in [`AttentionLayer::new`]; a layer that
//! constructs successfully never fails for configuration reasons at call
//! time.
//!
//! A layer is pre-norm when its order starts with `norm`. Pre-norm layers
//! hand `identity` to attention and feed-forward ops as the residual;
//! post-norm layers hand nothing and the feed-forward adds its own input.
//!
//! # Example
//!
//! ```rust
//! use voxbev_encoder::layer::OperationOrder;
//! use voxbev_types::OperationTag;
//!
//! let order = OperationOrder::default();
//! assert_eq!(order.count(OperationTag::Norm), 3);
//! assert_eq!(order.num_attentions(), 2);
//! assert!(!order.is_pre_norm());
//! ```

use ndarray::{Array2, Array3, ArrayView2, ArrayView3};
use serde::{Deserialize, Serialize};
use tracing::warn;
use voxbev_geometry::{Projection, ReferencePoints2D, ReferencePoints3D};
use voxbev_types::{BevError, OperationTag, SpatialShape};

use crate::attention::{
    Attention, AttentionKind, CameraFeatures, CrossInput, TemporalInput,
};
use crate::ffn::FeedForward;
use crate::norm::LayerNorm;

// ────────────────────────────────────────────────────────────────────────────
// OperationOrder
// ────────────────────────────────────────────────────────────────────────────

/// Ordered operation tags executed by one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationOrder(Vec<OperationTag>);

impl OperationOrder {
    pub fn new(tags: Vec<OperationTag>) -> Self {
        Self(tags)
    }

    /// Parse textual tags such as `"self_attn"`.
    pub fn parse(names: &[&str]) -> Result<Self, BevError> {
        names
            .iter()
            .map(|n| n.parse::<OperationTag>())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn tags(&self) -> &[OperationTag] {
        &self.0
    }

    pub fn count(&self, tag: OperationTag) -> usize {
        self.0.iter().filter(|&&t| t == tag).count()
    }

    pub fn num_attentions(&self) -> usize {
        self.0.iter().filter(|t| t.is_attention()).count()
    }

    /// Attention kind expected by each attention slot, in slot order.
    pub fn attention_kinds(&self) -> impl Iterator<Item = AttentionKind> + '_ {
        self.0.iter().filter_map(|t| match t {
            OperationTag::SelfAttn => Some(AttentionKind::Temporal),
            OperationTag::CrossAttn => Some(AttentionKind::SpatialMultiCamera),
            _ => None,
        })
    }

    pub fn is_pre_norm(&self) -> bool {
        self.0.first() == Some(&OperationTag::Norm)
    }
}

impl Default for OperationOrder {
    fn default() -> Self {
        Self(vec![
            OperationTag::SelfAttn,
            OperationTag::Norm,
            OperationTag::CrossAttn,
            OperationTag::Norm,
            OperationTag::Ffn,
            OperationTag::Norm,
        ])
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Attention masks
// ────────────────────────────────────────────────────────────────────────────

/// Additive attention masks for a layer's attention ops.
#[derive(Debug, Clone, Default)]
pub enum AttnMasks {
    #[default]
    Absent,
    /// One mask reused by every attention op.
    Shared(Array2<f32>),
    /// One entry per attention op, in slot order.
    PerAttention(Vec<Option<Array2<f32>>>),
}

impl AttnMasks {
    /// Expand to exactly `num_attn` slots.
    ///
    /// # Errors
    ///
    /// [`BevError::AttentionMaskCount`] when a per-attention list has the
    /// wrong length.
    pub fn resolve(&self, num_attn: usize) -> Result<Vec<Option<&Array2<f32>>>, BevError> {
        match self {
            AttnMasks::Absent => Ok(vec![None; num_attn]),
            AttnMasks::Shared(mask) => {
                warn!(
                    num_attn,
                    "single attention mask supplied; reusing it for every attention op"
                );
                Ok(vec![Some(mask); num_attn])
            }
            AttnMasks::PerAttention(masks) => {
                if masks.len() != num_attn {
                    return Err(BevError::AttentionMaskCount {
                        expected: num_attn,
                        found: masks.len(),
                    });
                }
                Ok(masks.iter().map(Option::as_ref).collect())
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Layer inputs
// ────────────────────────────────────────────────────────────────────────────

/// Per-call inputs shared by every op of a layer pass.
///
/// All tensors are batch-major. The projection and both reference point sets
/// are computed once per encoder pass and only read here.
#[derive(Debug, Clone, Copy)]
pub struct LayerInputs<'a> {
    pub features: &'a CameraFeatures,
    /// BEV grid the query covers.
    pub bev_shape: SpatialShape,
    /// Temporal reference points, already duplicated to `2B`.
    pub ref_2d: &'a ReferencePoints2D,
    pub ref_3d: &'a ReferencePoints3D,
    pub projection: &'a Projection,
    /// `(B, H·W, C)` BEV positional encoding for temporal self-attention.
    pub bev_pos: Option<ArrayView3<'a, f32>>,
    /// Positional encodings for cross-attention.
    pub query_pos: Option<ArrayView3<'a, f32>>,
    pub key_pos: Option<ArrayView3<'a, f32>>,
    /// `(B, H·W, C)` BEV state of the previous timestep.
    pub prev_bev: Option<ArrayView3<'a, f32>>,
    pub attn_masks: &'a AttnMasks,
    pub query_key_padding_mask: Option<ArrayView2<'a, bool>>,
    pub key_padding_mask: Option<ArrayView2<'a, bool>>,
}

// ────────────────────────────────────────────────────────────────────────────
// AttentionLayer
// ────────────────────────────────────────────────────────────────────────────

/// One encoder layer.
#[derive(Debug)]
pub struct AttentionLayer {
    attentions: Vec<Attention>,
    norms: Vec<LayerNorm>,
    ffns: Vec<FeedForward>,
    operation_order: OperationOrder,
}

impl AttentionLayer {
    /// # Errors
    ///
    /// - [`BevError::OperationOrderMismatch`] when the number of attention,
    ///   norm or ffn tags differs from the sub-modules supplied.
    /// - [`BevError::AttentionKindMismatch`] when a `self_attn` slot holds a
    ///   spatial attention or a `cross_attn` slot a temporal one.
    pub fn new(
        attentions: Vec<Attention>,
        norms: Vec<LayerNorm>,
        ffns: Vec<FeedForward>,
        operation_order: OperationOrder,
    ) -> Result<Self, BevError> {
        let checks = [
            ("attention", attentions.len(), operation_order.num_attentions()),
            ("norm", norms.len(), operation_order.count(OperationTag::Norm)),
            ("ffn", ffns.len(), operation_order.count(OperationTag::Ffn)),
        ];
        for (module, expected, found) in checks {
            if expected != found {
                return Err(BevError::OperationOrderMismatch {
                    module: module.to_string(),
                    expected,
                    found,
                });
            }
        }

        for (slot, (attn, expected)) in attentions
            .iter()
            .zip(operation_order.attention_kinds())
            .enumerate()
        {
            if attn.kind() != expected {
                return Err(BevError::AttentionKindMismatch {
                    slot,
                    expected: expected.to_string(),
                });
            }
        }

        Ok(Self {
            attentions,
            norms,
            ffns,
            operation_order,
        })
    }

    pub fn operation_order(&self) -> &OperationOrder {
        &self.operation_order
    }

    pub fn pre_norm(&self) -> bool {
        self.operation_order.is_pre_norm()
    }

    /// Run one pass of the operation order over `query` (`(B, H·W, C)`).
    pub fn forward(
        &self,
        query: Array3<f32>,
        inputs: &LayerInputs<'_>,
    ) -> Result<Array3<f32>, BevError> {
        let masks = inputs.attn_masks.resolve(self.attentions.len())?;
        let bev_shapes = [inputs.bev_shape];
        let bev_level_start = [0usize];

        let mut query = query;
        let mut identity = query.clone();
        let mut attn_index = 0;
        let mut norm_index = 0;
        let mut ffn_index = 0;

        for &tag in self.operation_order.tags() {
            match tag {
                OperationTag::SelfAttn => {
                    let Attention::Temporal(attn) = &self.attentions[attn_index] else {
                        return Err(kind_mismatch(attn_index, AttentionKind::Temporal));
                    };
                    let value = hybrid_value(query.view(), inputs.prev_bev)?;
                    let out = attn.forward(&TemporalInput {
                        query: query.view(),
                        value: value.view(),
                        residual: self.residual(&identity),
                        query_pos: inputs.bev_pos.as_ref().map(|v| v.view()),
                        reference_points: inputs.ref_2d,
                        spatial_shapes: &bev_shapes,
                        level_start_index: &bev_level_start,
                        attn_mask: masks[attn_index],
                        key_padding_mask: inputs.query_key_padding_mask.as_ref().map(|m| m.view()),
                    })?;
                    query = same_shape(out, query.dim(), tag)?;
                    identity = query.clone();
                    attn_index += 1;
                }
                OperationTag::CrossAttn => {
                    let Attention::SpatialMultiCamera(attn) = &self.attentions[attn_index] else {
                        return Err(kind_mismatch(attn_index, AttentionKind::SpatialMultiCamera));
                    };
                    let out = attn.forward(&CrossInput {
                        query: query.view(),
                        features: inputs.features,
                        residual: self.residual(&identity),
                        query_pos: inputs.query_pos.as_ref().map(|v| v.view()),
                        key_pos: inputs.key_pos.as_ref().map(|v| v.view()),
                        reference_points: inputs.ref_3d,
                        projection: inputs.projection,
                        attn_mask: masks[attn_index],
                        key_padding_mask: inputs.key_padding_mask.as_ref().map(|m| m.view()),
                    })?;
                    query = same_shape(out, query.dim(), tag)?;
                    identity = query.clone();
                    attn_index += 1;
                }
                OperationTag::Norm => {
                    query = self.norms[norm_index].forward(query.view())?;
                    norm_index += 1;
                }
                OperationTag::Ffn => {
                    query = self.ffns[ffn_index].forward(query.view(), self.residual(&identity))?;
                    ffn_index += 1;
                }
            }
        }

        Ok(query)
    }

    fn residual<'a>(&self, identity: &'a Array3<f32>) -> Option<ArrayView3<'a, f32>> {
        self.pre_norm().then(|| identity.view())
    }
}

/// Interleave `[prev_bev, query]` per batch item into a `(2B, H·W, C)`
/// value: row `2b` is `prev_bev[b]`, row `2b + 1` is `query[b]`. Without a
/// previous BEV both rows are the query.
fn hybrid_value(
    query: ArrayView3<'_, f32>,
    prev_bev: Option<ArrayView3<'_, f32>>,
) -> Result<Array3<f32>, BevError> {
    let prev = match &prev_bev {
        Some(p) => p.view(),
        None => query.view(),
    };
    if prev.dim() != query.dim() {
        return Err(BevError::Shape(format!(
            "previous BEV {:?} does not match query {:?}",
            prev.dim(),
            query.dim()
        )));
    }
    let (b, n, c) = query.dim();
    Ok(Array3::from_shape_fn((2 * b, n, c), |(row, q, ch)| {
        if row % 2 == 0 {
            prev[[row / 2, q, ch]]
        } else {
            query[[row / 2, q, ch]]
        }
    }))
}

fn same_shape(
    out: Array3<f32>,
    expected: (usize, usize, usize),
    tag: OperationTag,
) -> Result<Array3<f32>, BevError> {
    if out.dim() != expected {
        return Err(BevError::Attention(format!(
            "{tag} returned {:?}, expected {expected:?}",
            out.dim()
        )));
    }
    Ok(out)
}

fn kind_mismatch(slot: usize, expected: AttentionKind) -> BevError {
    BevError::AttentionKindMismatch {
        slot,
        expected: expected.to_string(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::attention::{SpatialCrossAttention, TemporalSelfAttention};
    use ndarray::{Array4, Axis};
    use voxbev_geometry::{
        Augmentation, BatchCalibration, CameraCalibration, CameraParams, CameraProjector,
        generate_2d, generate_3d,
    };
    use voxbev_types::{ImageSize, PointCloudRange};

    /// What a mock attention saw on its last call.
    #[derive(Debug, Default, Clone)]
    struct Seen {
        value_dim: Option<(usize, usize, usize)>,
        value_first: Option<f32>,
        value_second: Option<f32>,
        had_residual: bool,
        had_pos: bool,
        mask: Option<f32>,
        spatial_shapes: Vec<SpatialShape>,
        level_start_index: Vec<usize>,
    }

    /// Adds `offset` to the query.
    struct AddTemporal {
        offset: f32,
        seen: Arc<Mutex<Seen>>,
    }

    impl TemporalSelfAttention for AddTemporal {
        fn forward(&self, input: &TemporalInput<'_>) -> Result<Array3<f32>, BevError> {
            let b = input.query.dim().0;
            let mut seen = self.seen.lock().unwrap();
            seen.value_dim = Some(input.value.dim());
            seen.value_first = Some(input.value[[0, 0, 0]]);
            seen.value_second = Some(input.value[[b, 0, 0]]);
            seen.had_residual = input.residual.is_some();
            seen.had_pos = input.query_pos.is_some();
            seen.mask = input.attn_mask.map(|m| m[[0, 0]]);
            seen.spatial_shapes = input.spatial_shapes.to_vec();
            seen.level_start_index = input.level_start_index.to_vec();
            Ok(&input.query + self.offset)
        }
    }

    /// Multiplies the query by `factor`.
    struct ScaleSpatial {
        factor: f32,
        seen: Arc<Mutex<Seen>>,
    }

    impl SpatialCrossAttention for ScaleSpatial {
        fn forward(&self, input: &CrossInput<'_>) -> Result<Array3<f32>, BevError> {
            let mut seen = self.seen.lock().unwrap();
            seen.had_residual = input.residual.is_some();
            seen.had_pos = input.query_pos.is_some();
            seen.mask = input.attn_mask.map(|m| m[[0, 0]]);
            seen.spatial_shapes = input.features.spatial_shapes().to_vec();
            seen.level_start_index = input.features.level_start_index().to_vec();
            Ok(&input.query * self.factor)
        }
    }

    struct Fixture {
        features: CameraFeatures,
        ref_2d: ReferencePoints2D,
        ref_3d: ReferencePoints3D,
        projection: Projection,
    }

    fn fixture(batch: usize) -> Fixture {
        let shapes = vec![SpatialShape::new(2, 2), SpatialShape::new(1, 1)];
        let features = CameraFeatures::new(
            Array4::zeros((1, 5, batch, 4)),
            Array4::zeros((1, 5, batch, 4)),
            shapes,
        )
        .unwrap();
        let ref_3d = generate_3d(2, 2, 8, 2, batch);
        let params = CameraParams::new(vec![
            BatchCalibration {
                augmentation: Augmentation::identity(),
                cameras: vec![CameraCalibration::identity()],
            };
            batch
        ]);
        let projection = CameraProjector::new(ImageSize::new(4, 4))
            .project(&ref_3d, &PointCloudRange::default(), &params)
            .unwrap();
        Fixture {
            features,
            ref_2d: generate_2d(2, 2, batch).hybrid(),
            ref_3d,
            projection,
        }
    }

    fn inputs<'a>(fx: &'a Fixture, masks: &'a AttnMasks) -> LayerInputs<'a> {
        LayerInputs {
            features: &fx.features,
            bev_shape: SpatialShape::new(2, 2),
            ref_2d: &fx.ref_2d,
            ref_3d: &fx.ref_3d,
            projection: &fx.projection,
            bev_pos: None,
            query_pos: None,
            key_pos: None,
            prev_bev: None,
            attn_masks: masks,
            query_key_padding_mask: None,
            key_padding_mask: None,
        }
    }

    fn standard_layer(
        order: OperationOrder,
        temporal: Arc<Mutex<Seen>>,
        spatial: Arc<Mutex<Seen>>,
    ) -> Result<AttentionLayer, BevError> {
        let norms = (0..order.count(OperationTag::Norm))
            .map(|_| LayerNorm::with_dims(4, 1e-5))
            .collect();
        let ffns = (0..order.count(OperationTag::Ffn))
            .map(|_| FeedForward::zeros(4, 8))
            .collect();
        AttentionLayer::new(
            vec![
                Attention::temporal(AddTemporal {
                    offset: 1.0,
                    seen: temporal,
                }),
                Attention::spatial(ScaleSpatial {
                    factor: 2.0,
                    seen: spatial,
                }),
            ],
            norms,
            ffns,
            order,
        )
    }

    fn query(batch: usize) -> Array3<f32> {
        Array3::from_shape_fn((batch, 4, 4), |(b, n, c)| (b * 16 + n * 4 + c) as f32 * 0.1)
    }

    #[test]
    fn default_order_runs() {
        let (t, s) = (Arc::default(), Arc::default());
        let layer = standard_layer(OperationOrder::default(), t, s).unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::default();
        let out = layer.forward(query(1), &inputs(&fx, &masks)).unwrap();
        assert_eq!(out.dim(), (1, 4, 4));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn missing_norm_is_rejected_at_construction() {
        let order = OperationOrder::new(vec![
            OperationTag::SelfAttn,
            OperationTag::Norm,
            OperationTag::CrossAttn,
            OperationTag::Ffn,
            OperationTag::Norm,
        ]);
        let norms = vec![LayerNorm::with_dims(4, 1e-5); 3];
        let err = AttentionLayer::new(
            vec![
                Attention::temporal(AddTemporal {
                    offset: 0.0,
                    seen: Arc::default(),
                }),
                Attention::spatial(ScaleSpatial {
                    factor: 1.0,
                    seen: Arc::default(),
                }),
            ],
            norms,
            vec![FeedForward::zeros(4, 8)],
            order,
        )
        .unwrap_err();
        assert_eq!(
            err,
            BevError::OperationOrderMismatch {
                module: "norm".to_string(),
                expected: 3,
                found: 2,
            }
        );
    }

    #[test]
    fn swapped_attention_kinds_are_rejected() {
        let order = OperationOrder::new(vec![OperationTag::CrossAttn, OperationTag::SelfAttn]);
        let err = AttentionLayer::new(
            vec![
                Attention::temporal(AddTemporal {
                    offset: 0.0,
                    seen: Arc::default(),
                }),
                Attention::spatial(ScaleSpatial {
                    factor: 1.0,
                    seen: Arc::default(),
                }),
            ],
            vec![],
            vec![],
            order,
        )
        .unwrap_err();
        assert!(matches!(err, BevError::AttentionKindMismatch { slot: 0, .. }));
    }

    #[test]
    fn attention_ops_apply_in_order_without_norm() {
        // query → +1 → ×2 → ffn (zero weights, residual = input)
        let order = OperationOrder::new(vec![
            OperationTag::SelfAttn,
            OperationTag::CrossAttn,
            OperationTag::Ffn,
        ]);
        let layer = standard_layer(order, Arc::default(), Arc::default()).unwrap();
        let fx = fixture(2);
        let masks = AttnMasks::default();
        let q = query(2);
        let out = layer.forward(q.clone(), &inputs(&fx, &masks)).unwrap();
        assert_eq!(out, (q + 1.0) * 2.0);
    }

    #[test]
    fn temporal_value_duplicates_query_without_prev_bev() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&seen), Arc::default()).unwrap();
        let fx = fixture(2);
        let masks = AttnMasks::default();
        let q = query(2);
        layer.forward(q.clone(), &inputs(&fx, &masks)).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.value_dim, Some((4, 4, 4)));
        assert_eq!(seen.value_first, Some(q[[0, 0, 0]]));
        assert_eq!(seen.value_second, Some(q[[1, 0, 0]]));
        assert_eq!(seen.spatial_shapes, vec![SpatialShape::new(2, 2)]);
        assert_eq!(seen.level_start_index, vec![0]);
    }

    #[test]
    fn temporal_value_interleaves_prev_bev_and_query() {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&seen), Arc::default()).unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::default();
        let prev = Array3::<f32>::from_elem((1, 4, 4), -7.0);
        let mut inp = inputs(&fx, &masks);
        inp.prev_bev = Some(prev.view());
        let q = query(1);
        layer.forward(q.clone(), &inp).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.value_dim, Some((2, 4, 4)));
        // b = 1: slot 0 is prev_bev, slot 1 is the query
        assert_eq!(seen.value_first, Some(-7.0));
        assert_eq!(seen.value_second, Some(q[[0, 0, 0]]));
    }

    #[test]
    fn prev_bev_shape_mismatch_is_an_error() {
        let layer = standard_layer(OperationOrder::default(), Arc::default(), Arc::default())
            .unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::default();
        let prev = Array3::<f32>::zeros((1, 9, 4));
        let mut inp = inputs(&fx, &masks);
        inp.prev_bev = Some(prev.view());
        assert!(matches!(
            layer.forward(query(1), &inp),
            Err(BevError::Shape(_))
        ));
    }

    #[test]
    fn hybrid_value_interleaves_prev_and_query_per_batch_item() {
        let q = Array3::from_shape_fn((2, 3, 4), |(b, n, c)| (b * 100 + n * 10 + c) as f32);
        let prev = q.mapv(|v| -v - 1.0);
        let value = hybrid_value(q.view(), Some(prev.view())).unwrap();
        assert_eq!(value.dim(), (4, 3, 4));
        assert_eq!(value.index_axis(Axis(0), 0), prev.index_axis(Axis(0), 0));
        assert_eq!(value.index_axis(Axis(0), 1), q.index_axis(Axis(0), 0));
        assert_eq!(value.index_axis(Axis(0), 2), prev.index_axis(Axis(0), 1));
        assert_eq!(value.index_axis(Axis(0), 3), q.index_axis(Axis(0), 1));
    }

    #[test]
    fn hybrid_value_without_prev_repeats_each_batch_item() {
        let q = Array3::from_shape_fn((3, 2, 2), |(b, n, c)| (b * 4 + n * 2 + c) as f32);
        let value = hybrid_value(q.view(), None).unwrap();
        for b in 0..3 {
            assert_eq!(value.index_axis(Axis(0), 2 * b), q.index_axis(Axis(0), b));
            assert_eq!(value.index_axis(Axis(0), 2 * b + 1), q.index_axis(Axis(0), b));
        }
    }

    /// Caller views outlive the per-call borrows the layer mixes them with.
    fn forward_with_views(
        layer: &AttentionLayer,
        fx: &Fixture,
        query: Array3<f32>,
        prev_bev: ArrayView3<'_, f32>,
        bev_pos: ArrayView3<'_, f32>,
        padding: ArrayView2<'_, bool>,
    ) -> Result<Array3<f32>, BevError> {
        let masks = AttnMasks::default();
        let mut inp = inputs(fx, &masks);
        inp.prev_bev = Some(prev_bev.view());
        inp.bev_pos = Some(bev_pos.view());
        inp.query_pos = Some(bev_pos.view());
        inp.query_key_padding_mask = Some(padding.view());
        inp.key_padding_mask = Some(padding.view());
        layer.forward(query, &inp)
    }

    #[test]
    fn batched_views_from_the_caller_reach_both_attentions() {
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&t), Arc::clone(&s)).unwrap();
        let fx = fixture(2);
        let prev = Array3::<f32>::from_elem((2, 4, 4), 5.0);
        let pos = Array3::<f32>::ones((2, 4, 4));
        let padding = Array2::from_elem((2, 4), false);
        let out = forward_with_views(&layer, &fx, query(2), prev.view(), pos.view(), padding.view())
            .unwrap();
        assert_eq!(out.dim(), (2, 4, 4));
        let t = t.lock().unwrap();
        assert_eq!(t.value_dim, Some((4, 4, 4)));
        // row b = 2 is prev_bev[1]
        assert_eq!(t.value_second, Some(5.0));
        assert!(t.had_pos);
        assert!(s.lock().unwrap().had_pos);
    }

    #[test]
    fn shared_mask_reaches_every_attention() {
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&t), Arc::clone(&s)).unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::Shared(Array2::from_elem((4, 4), -1.0));
        layer.forward(query(1), &inputs(&fx, &masks)).unwrap();
        assert_eq!(t.lock().unwrap().mask, Some(-1.0));
        assert_eq!(s.lock().unwrap().mask, Some(-1.0));
    }

    #[test]
    fn per_attention_masks_route_by_slot() {
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&t), Arc::clone(&s)).unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::PerAttention(vec![None, Some(Array2::from_elem((4, 4), 3.0))]);
        layer.forward(query(1), &inputs(&fx, &masks)).unwrap();
        assert_eq!(t.lock().unwrap().mask, None);
        assert_eq!(s.lock().unwrap().mask, Some(3.0));
    }

    #[test]
    fn wrong_mask_count_is_an_error() {
        let layer = standard_layer(OperationOrder::default(), Arc::default(), Arc::default())
            .unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::PerAttention(vec![None]);
        let err = layer.forward(query(1), &inputs(&fx, &masks)).unwrap_err();
        assert_eq!(
            err,
            BevError::AttentionMaskCount {
                expected: 2,
                found: 1
            }
        );
    }

    #[test]
    fn post_norm_layers_pass_no_residual() {
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&t), Arc::clone(&s)).unwrap();
        assert!(!layer.pre_norm());
        let fx = fixture(1);
        let masks = AttnMasks::default();
        layer.forward(query(1), &inputs(&fx, &masks)).unwrap();
        assert!(!t.lock().unwrap().had_residual);
        assert!(!s.lock().unwrap().had_residual);
    }

    #[test]
    fn pre_norm_layers_pass_identity_as_residual() {
        let order = OperationOrder::parse(&[
            "norm",
            "self_attn",
            "norm",
            "cross_attn",
            "norm",
            "ffn",
        ])
        .unwrap();
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer = standard_layer(order, Arc::clone(&t), Arc::clone(&s)).unwrap();
        assert!(layer.pre_norm());
        let fx = fixture(1);
        let masks = AttnMasks::default();
        layer.forward(query(1), &inputs(&fx, &masks)).unwrap();
        assert!(t.lock().unwrap().had_residual);
        assert!(s.lock().unwrap().had_residual);
    }

    #[test]
    fn pre_norm_ffn_adds_identity_not_normed_query() {
        // norm → ffn: identity is the raw input, the ffn input is its norm
        let order = OperationOrder::parse(&["norm", "ffn"]).unwrap();
        let layer = AttentionLayer::new(
            vec![],
            vec![LayerNorm::with_dims(4, 1e-5)],
            vec![FeedForward::zeros(4, 8)],
            order,
        )
        .unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::default();
        let q = query(1);
        let out = layer.forward(q.clone(), &inputs(&fx, &masks)).unwrap();
        assert_eq!(out, q);
    }

    #[test]
    fn bev_pos_goes_to_temporal_attention_only() {
        let (t, s) = (Arc::new(Mutex::new(Seen::default())), Arc::new(Mutex::new(Seen::default())));
        let layer =
            standard_layer(OperationOrder::default(), Arc::clone(&t), Arc::clone(&s)).unwrap();
        let fx = fixture(1);
        let masks = AttnMasks::default();
        let pos = Array3::<f32>::zeros((1, 4, 4));
        let mut inp = inputs(&fx, &masks);
        inp.bev_pos = Some(pos.view());
        layer.forward(query(1), &inp).unwrap();
        assert!(t.lock().unwrap().had_pos);
        assert!(!s.lock().unwrap().had_pos);
        assert_eq!(s.lock().unwrap().level_start_index, vec![0, 4]);
    }

    #[test]
    fn operation_order_round_trips_through_json() {
        let order = OperationOrder::default();
        let json = serde_json::to_string(&order).unwrap();
        assert_eq!(
            json,
            r#"["self_attn","norm","cross_attn","norm","ffn","norm"]"#
        );
        let back: OperationOrder = serde_json::from_str(&json).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn unknown_tag_fails_to_parse() {
        assert!(OperationOrder::parse(&["self_attn", "mlp"]).is_err());
    }
}
