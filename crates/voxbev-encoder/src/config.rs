//! Encoder configuration – reads/writes TOML files.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use voxbev_geometry::CameraProjector;
use voxbev_types::{BevError, DepthBounds, ImageSize, PointCloudRange, SpatialShape};

use crate::layer::OperationOrder;

/// Sub-module layout shared by every layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    #[serde(default)]
    pub operation_order: OperationOrder,

    #[serde(default = "default_embed_dims")]
    pub embed_dims: usize,

    /// Hidden width of the feed-forward block.
    #[serde(default = "default_feedforward_channels")]
    pub feedforward_channels: usize,

    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,
}

fn default_embed_dims() -> usize {
    128
}
fn default_feedforward_channels() -> usize {
    256
}
fn default_norm_eps() -> f32 {
    1e-5
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            operation_order: OperationOrder::default(),
            embed_dims: default_embed_dims(),
            feedforward_channels: default_feedforward_channels(),
            norm_eps: default_norm_eps(),
        }
    }
}

/// Encoder configuration stored as TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,

    /// Height samples per pillar (`D`).
    #[serde(default = "default_num_points_in_pillar")]
    pub num_points_in_pillar: usize,

    /// Pillar height in cells (`Z`).
    #[serde(default = "default_pillar_height")]
    pub pillar_height: usize,

    /// Collect every layer output instead of only the last.
    #[serde(default)]
    pub return_intermediate: bool,

    /// `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    #[serde(default)]
    pub pc_range: PointCloudRange,

    /// Final (post-augmentation) image size.
    #[serde(default)]
    pub image_size: ImageSize,

    /// Grid of the temporal reference points. Independent of the BEV grid.
    #[serde(default = "default_temporal_grid")]
    pub temporal_grid: SpatialShape,

    /// When set, projections carry a third, depth channel normalized over
    /// these bounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_bounds: Option<DepthBounds>,

    #[serde(default)]
    pub layer: LayerConfig,
}

fn default_num_layers() -> usize {
    1
}
fn default_num_points_in_pillar() -> usize {
    4
}
fn default_pillar_height() -> usize {
    8
}
fn default_temporal_grid() -> SpatialShape {
    SpatialShape::new(512, 512)
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            num_layers: default_num_layers(),
            num_points_in_pillar: default_num_points_in_pillar(),
            pillar_height: default_pillar_height(),
            return_intermediate: false,
            pc_range: PointCloudRange::default(),
            image_size: ImageSize::default(),
            temporal_grid: default_temporal_grid(),
            depth_bounds: None,
            layer: LayerConfig::default(),
        }
    }
}

impl EncoderConfig {
    /// Reject values no encoder can run with.
    pub fn validate(&self) -> Result<(), BevError> {
        let invalid = |msg: &str| Err(BevError::InvalidConfig(msg.to_string()));

        if self.num_layers == 0 {
            return invalid("num_layers must be at least 1");
        }
        if self.num_points_in_pillar == 0 {
            return invalid("num_points_in_pillar must be at least 1");
        }
        if self.pillar_height == 0 {
            return invalid("pillar_height must be at least 1");
        }
        if (0..3).any(|axis| self.pc_range.extent(axis) <= 0.0) {
            return invalid("pc_range max must exceed min on every axis");
        }
        if self.image_size.height == 0 || self.image_size.width == 0 {
            return invalid("image_size must be non-empty");
        }
        if self.temporal_grid.is_empty() {
            return invalid("temporal_grid must be non-empty");
        }
        if let Some(bounds) = self.depth_bounds
            && bounds.far <= bounds.near
        {
            return invalid("depth_bounds far must exceed near");
        }
        if self.layer.embed_dims == 0 || self.layer.feedforward_channels == 0 {
            return invalid("layer widths must be non-zero");
        }
        if self.layer.norm_eps <= 0.0 {
            return invalid("layer norm_eps must be positive");
        }
        Ok(())
    }

    /// Projector matching `image_size` and `depth_bounds`.
    pub fn projector(&self) -> CameraProjector {
        let projector = CameraProjector::new(self.image_size);
        match self.depth_bounds {
            Some(bounds) => projector.with_depth_channel(bounds),
            None => projector,
        }
    }
}

/// Load the config from `path` and apply `VOXBEV_*` overrides. Returns
/// `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<EncoderConfig>, BevError> {
    let Some(mut cfg) = read_file(path)? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

fn read_file(path: &Path) -> Result<Option<EncoderConfig>, BevError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        BevError::InvalidConfig(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| BevError::InvalidConfig(format!("failed to parse config: {e}")))?;
    Ok(Some(cfg))
}

/// Apply `VOXBEV_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `VOXBEV_NUM_LAYERS` | `num_layers` |
/// | `VOXBEV_NUM_POINTS_IN_PILLAR` | `num_points_in_pillar` |
/// | `VOXBEV_RETURN_INTERMEDIATE` | `return_intermediate` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut EncoderConfig) {
    apply_overrides(cfg, |key| std::env::var(key).ok());
}

/// Override logic behind [`apply_env_overrides`], reading variables through
/// `lookup` so tests need not touch the process environment.
pub(crate) fn apply_overrides(cfg: &mut EncoderConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("VOXBEV_NUM_LAYERS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.num_layers = n;
    }
    if let Some(v) = lookup("VOXBEV_NUM_POINTS_IN_PILLAR")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.num_points_in_pillar = n;
    }
    if let Some(v) = lookup("VOXBEV_RETURN_INTERMEDIATE")
        && let Ok(flag) = v.parse::<bool>()
    {
        cfg.return_intermediate = flag;
    }
}

/// Save the config to `path`, creating parent directories if necessary.
pub fn save_to(cfg: &EncoderConfig, path: &Path) -> Result<(), BevError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BevError::InvalidConfig(format!("failed to create config directory: {e}"))
        })?;
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| BevError::InvalidConfig(format!("failed to serialize config: {e}")))?;
    fs::write(path, raw).map_err(|e| {
        BevError::InvalidConfig(format!("failed to write config at {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use voxbev_types::OperationTag;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EncoderConfig::default();
        cfg.validate().expect("default config must validate");
        assert_eq!(cfg.num_points_in_pillar, 4);
        assert_eq!(cfg.pillar_height, 8);
        assert_eq!(cfg.temporal_grid, SpatialShape::new(512, 512));
        assert_eq!(cfg.layer.operation_order, OperationOrder::default());
    }

    #[test]
    fn missing_file_returns_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(read_file(&dir.path().join("absent.toml")).unwrap().is_none());
    }

    #[test]
    fn save_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join("encoder.toml");

        let cfg = EncoderConfig {
            num_layers: 6,
            return_intermediate: true,
            depth_bounds: Some(DepthBounds::default()),
            temporal_grid: SpatialShape::new(128, 128),
            ..EncoderConfig::default()
        };
        save_to(&cfg, &path).expect("save");
        let loaded = read_file(&path).expect("read").expect("present");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("encoder.toml");
        fs::write(
            &path,
            r#"
num_points_in_pillar = 2
pc_range = [-10.0, -10.0, -1.0, 10.0, 10.0, 3.0]

[layer]
operation_order = ["norm", "self_attn", "norm", "ffn"]
"#,
        )
        .unwrap();

        let cfg = read_file(&path).unwrap().unwrap();
        assert_eq!(cfg.num_points_in_pillar, 2);
        assert_eq!(cfg.num_layers, 1);
        assert_eq!(cfg.pc_range.min, [-10.0, -10.0, -1.0]);
        assert_eq!(cfg.layer.embed_dims, 128);
        assert_eq!(cfg.layer.operation_order.tags()[0], OperationTag::Norm);
        assert!(cfg.layer.operation_order.is_pre_norm());
        assert!(cfg.depth_bounds.is_none());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("encoder.toml");
        fs::write(&path, "num_layers = \"many\"").unwrap();
        assert!(matches!(read_file(&path), Err(BevError::InvalidConfig(_))));
    }

    #[test]
    fn unknown_operation_tag_is_rejected() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("encoder.toml");
        fs::write(&path, "[layer]\noperation_order = [\"mlp\"]\n").unwrap();
        assert!(read_file(&path).is_err());
    }

    #[test]
    fn overrides_apply_parsed_values() {
        let mut cfg = EncoderConfig::default();
        apply_overrides(
            &mut cfg,
            lookup(&[
                ("VOXBEV_NUM_LAYERS", "3"),
                ("VOXBEV_NUM_POINTS_IN_PILLAR", "8"),
                ("VOXBEV_RETURN_INTERMEDIATE", "true"),
            ]),
        );
        assert_eq!(cfg.num_layers, 3);
        assert_eq!(cfg.num_points_in_pillar, 8);
        assert!(cfg.return_intermediate);
    }

    #[test]
    fn unparsable_overrides_are_ignored() {
        let mut cfg = EncoderConfig::default();
        apply_overrides(
            &mut cfg,
            lookup(&[
                ("VOXBEV_NUM_LAYERS", "three"),
                ("VOXBEV_RETURN_INTERMEDIATE", "yes"),
            ]),
        );
        assert_eq!(cfg, EncoderConfig::default());
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let cases = [
            EncoderConfig {
                num_points_in_pillar: 0,
                ..EncoderConfig::default()
            },
            EncoderConfig {
                pc_range: PointCloudRange::from([0.0, 0.0, 0.0, 1.0, 0.0, 1.0]),
                ..EncoderConfig::default()
            },
            EncoderConfig {
                depth_bounds: Some(DepthBounds::new(10.0, 5.0)),
                ..EncoderConfig::default()
            },
            EncoderConfig {
                temporal_grid: SpatialShape::new(0, 512),
                ..EncoderConfig::default()
            },
        ];
        for cfg in cases {
            assert!(
                matches!(cfg.validate(), Err(BevError::InvalidConfig(_))),
                "{cfg:?} should be rejected"
            );
        }
    }

    #[test]
    fn projector_follows_depth_bounds() {
        let mut cfg = EncoderConfig::default();
        assert_eq!(cfg.projector().channels(), 2);
        cfg.depth_bounds = Some(DepthBounds::default());
        assert_eq!(cfg.projector().channels(), 3);
    }
}
