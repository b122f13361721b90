//! `voxbev-encoder` – multi-camera BEV attention encoder.
//!
//! Fuses multi-camera image features into a bird's-eye-view feature grid by
//! running a stack of attention layers over a BEV query.
//!
//! # Modules
//!
//! - [`attention`] – [`TemporalSelfAttention`][attention::TemporalSelfAttention] /
//!   [`SpatialCrossAttention`][attention::SpatialCrossAttention]: the two
//!   external attention capabilities, plus the
//!   [`CameraFeatures`][attention::CameraFeatures] they sample from.
//! - [`norm`] / [`ffn`] – [`LayerNorm`][norm::LayerNorm] and
//!   [`FeedForward`][ffn::FeedForward] sub-modules.
//! - [`layer`] – [`AttentionLayer`][layer::AttentionLayer]: executes one
//!   [`OperationOrder`][layer::OperationOrder] pass over the query.
//! - [`encoder`] – [`Encoder`][encoder::Encoder]: generates and projects the
//!   reference points once, then drives every layer.
//! - [`config`] – [`EncoderConfig`][config::EncoderConfig]: TOML file and
//!   `VOXBEV_*` environment configuration.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: `tracing`
//!   subscriber with optional OTLP export.

pub mod attention;
pub mod config;
pub mod encoder;
pub mod ffn;
pub mod layer;
pub mod norm;
pub mod telemetry;

pub use attention::{
    Attention, AttentionKind, CameraFeatures, CrossInput, SpatialCrossAttention,
    TemporalInput, TemporalSelfAttention,
};
pub use config::{EncoderConfig, LayerConfig};
pub use encoder::{Encoder, EncoderInputs, EncoderOutput, SubModuleFactory};
pub use layer::{AttentionLayer, AttnMasks, LayerInputs, OperationOrder};

use voxbev_types::BevError;

pub(crate) fn shape_error(e: ndarray::ShapeError) -> BevError {
    BevError::Shape(e.to_string())
}
