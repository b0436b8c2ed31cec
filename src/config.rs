use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::codec::{DEFAULT_JPEG_QUALITY, MAX_CANVAS_SIDE};
use crate::detect::backends::{
    GridDetector, GridDetectorConfig, RegionProposalConfig, RegionProposalDetector,
    TransformerDetector, TransformerDetectorConfig,
};
use crate::detect::{BackendKind, BackendRegistry, ClassCatalog, DetectionBackend};

pub const CONFIG_ENV: &str = "VISION_CONFIG";

const DEFAULT_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:8080";
const DEFAULT_MAX_REQUEST_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_CONNECTIONS: usize = 32;
const DEFAULT_YOLO11_PATH: &str = "model/yolo11l_finetune.onnx";
const DEFAULT_RTDETR_PATH: &str = "model/rt_detr_finetune.onnx";
const DEFAULT_FASTER_RCNN_PATH: &str = "model/faster_rcnn.onnx";

#[derive(Debug, Deserialize, Default)]
struct ServiceConfigFile {
    addr: Option<String>,
    allowed_origin: Option<String>,
    max_request_bytes: Option<usize>,
    max_connections: Option<usize>,
    crop_quality: Option<u8>,
    default_model: Option<String>,
    models: Option<ModelsConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelsConfigFile {
    yolo11: Option<GridConfigFile>,
    #[serde(rename = "rt-detr")]
    rt_detr: Option<TransformerConfigFile>,
    #[serde(rename = "faster-rcnn")]
    faster_rcnn: Option<RegionProposalConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct GridConfigFile {
    path: Option<PathBuf>,
    labels: Option<PathBuf>,
    confidence: Option<f32>,
    iou: Option<f32>,
    input_size: Option<u32>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct TransformerConfigFile {
    path: Option<PathBuf>,
    labels: Option<PathBuf>,
    confidence: Option<f32>,
    input_size: Option<u32>,
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct RegionProposalConfigFile {
    path: Option<PathBuf>,
    labels: Option<PathBuf>,
    score_threshold: Option<f32>,
    min_size: Option<u32>,
    max_size: Option<u32>,
    enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub addr: String,
    pub allowed_origin: String,
    pub max_request_bytes: usize,
    pub max_connections: usize,
    pub crop_quality: u8,
    pub default_model: String,
    pub yolo11: GridSettings,
    pub rt_detr: TransformerSettings,
    pub faster_rcnn: RegionProposalSettings,
}

#[derive(Debug, Clone)]
pub struct GridSettings {
    pub path: PathBuf,
    pub labels: Option<PathBuf>,
    pub enabled: bool,
    pub detector: GridDetectorConfig,
}

#[derive(Debug, Clone)]
pub struct TransformerSettings {
    pub path: PathBuf,
    pub labels: Option<PathBuf>,
    pub enabled: bool,
    pub detector: TransformerDetectorConfig,
}

#[derive(Debug, Clone)]
pub struct RegionProposalSettings {
    pub path: PathBuf,
    pub labels: Option<PathBuf>,
    pub enabled: bool,
    pub detector: RegionProposalConfig,
}

impl ServiceConfig {
    /// Load from the file named by `VISION_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.map(PathBuf::from).as_deref())
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ServiceConfigFile) -> Self {
        let models = file.models.unwrap_or_default();
        let grid_defaults = GridDetectorConfig::default();
        let yolo = models.yolo11.unwrap_or_default();
        let yolo11 = GridSettings {
            path: yolo.path.unwrap_or_else(|| PathBuf::from(DEFAULT_YOLO11_PATH)),
            labels: yolo.labels,
            enabled: yolo.enabled.unwrap_or(true),
            detector: GridDetectorConfig {
                confidence: yolo.confidence.unwrap_or(grid_defaults.confidence),
                iou: yolo.iou.unwrap_or(grid_defaults.iou),
                input_size: yolo.input_size.unwrap_or(grid_defaults.input_size),
                ..grid_defaults
            },
        };

        let detr_defaults = TransformerDetectorConfig::default();
        let detr = models.rt_detr.unwrap_or_default();
        let rt_detr = TransformerSettings {
            path: detr.path.unwrap_or_else(|| PathBuf::from(DEFAULT_RTDETR_PATH)),
            labels: detr.labels,
            enabled: detr.enabled.unwrap_or(true),
            detector: TransformerDetectorConfig {
                confidence: detr.confidence.unwrap_or(detr_defaults.confidence),
                input_size: detr.input_size.unwrap_or(detr_defaults.input_size),
            },
        };

        let rcnn_defaults = RegionProposalConfig::default();
        let rcnn = models.faster_rcnn.unwrap_or_default();
        let faster_rcnn = RegionProposalSettings {
            path: rcnn
                .path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FASTER_RCNN_PATH)),
            labels: rcnn.labels,
            enabled: rcnn.enabled.unwrap_or(true),
            detector: RegionProposalConfig {
                score_threshold: rcnn.score_threshold.unwrap_or(rcnn_defaults.score_threshold),
                min_size: rcnn.min_size.unwrap_or(rcnn_defaults.min_size),
                max_size: rcnn.max_size.unwrap_or(rcnn_defaults.max_size),
            },
        };

        Self {
            addr: file.addr.unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            allowed_origin: file
                .allowed_origin
                .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGIN.to_string()),
            max_request_bytes: file.max_request_bytes.unwrap_or(DEFAULT_MAX_REQUEST_BYTES),
            max_connections: file.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            crop_quality: file.crop_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            default_model: file
                .default_model
                .unwrap_or_else(|| BackendKind::Grid.name().to_string()),
            yolo11,
            rt_detr,
            faster_rcnn,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(addr) = env_value("VISION_ADDR") {
            self.addr = addr;
        }
        if let Some(origin) = env_value("VISION_ALLOWED_ORIGIN") {
            self.allowed_origin = origin;
        }
        if let Some(model) = env_value("VISION_DEFAULT_MODEL") {
            self.default_model = model;
        }
        if let Some(path) = env_value("VISION_YOLO11_MODEL") {
            self.yolo11.path = PathBuf::from(path);
        }
        if let Some(path) = env_value("VISION_RTDETR_MODEL") {
            self.rt_detr.path = PathBuf::from(path);
        }
        if let Some(path) = env_value("VISION_FASTER_RCNN_MODEL") {
            self.faster_rcnn.path = PathBuf::from(path);
        }
        if let Some(bytes) = env_value("VISION_MAX_REQUEST_BYTES") {
            self.max_request_bytes = bytes
                .trim()
                .parse()
                .map_err(|_| anyhow!("VISION_MAX_REQUEST_BYTES must be an integer number of bytes"))?;
        }
        if let Some(limit) = env_value("VISION_MAX_CONNECTIONS") {
            self.max_connections = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("VISION_MAX_CONNECTIONS must be an integer"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        check_unit("models.yolo11.confidence", self.yolo11.detector.confidence)?;
        check_unit("models.yolo11.iou", self.yolo11.detector.iou)?;
        check_unit("models.rt-detr.confidence", self.rt_detr.detector.confidence)?;
        check_unit(
            "models.faster-rcnn.score_threshold",
            self.faster_rcnn.detector.score_threshold,
        )?;
        if !(1..=100).contains(&self.crop_quality) {
            return Err(anyhow!("crop_quality must be between 1 and 100"));
        }
        if self.max_request_bytes == 0 {
            return Err(anyhow!("max_request_bytes must be greater than zero"));
        }
        if self.max_connections == 0 {
            return Err(anyhow!("max_connections must be greater than zero"));
        }
        check_size("models.yolo11.input_size", self.yolo11.detector.input_size)?;
        check_size("models.rt-detr.input_size", self.rt_detr.detector.input_size)?;
        let rcnn = &self.faster_rcnn.detector;
        check_size("models.faster-rcnn.min_size", rcnn.min_size)?;
        check_size("models.faster-rcnn.max_size", rcnn.max_size)?;
        if rcnn.min_size > rcnn.max_size {
            return Err(anyhow!(
                "faster-rcnn min_size ({}) exceeds max_size ({})",
                rcnn.min_size,
                rcnn.max_size
            ));
        }

        let enabled = self.enabled_models();
        if enabled.is_empty() {
            return Err(anyhow!("at least one model must be enabled"));
        }
        self.default_model = self.default_model.trim().to_string();
        let default_kind: BackendKind = self.default_model.parse()?;
        if !enabled.contains(&default_kind) {
            return Err(anyhow!(
                "default_model '{}' is not enabled",
                self.default_model
            ));
        }
        Ok(())
    }

    /// Enabled backends in registration order.
    pub fn enabled_models(&self) -> Vec<BackendKind> {
        BackendKind::ALL
            .iter()
            .copied()
            .filter(|kind| match kind {
                BackendKind::Grid => self.yolo11.enabled,
                BackendKind::Transformer => self.rt_detr.enabled,
                BackendKind::RegionProposal => self.faster_rcnn.enabled,
            })
            .collect()
    }

    /// Load and warm up every enabled model. Any failure aborts startup.
    pub fn build_registry(&self) -> Result<BackendRegistry> {
        let mut registry = BackendRegistry::new();
        for kind in self.enabled_models() {
            match kind {
                BackendKind::Grid => register(
                    &mut registry,
                    GridDetector::load(
                        &self.yolo11.path,
                        load_labels(self.yolo11.labels.as_deref())?,
                        self.yolo11.detector,
                    )?,
                )?,
                BackendKind::Transformer => register(
                    &mut registry,
                    TransformerDetector::load(
                        &self.rt_detr.path,
                        load_labels(self.rt_detr.labels.as_deref())?,
                        self.rt_detr.detector,
                    )?,
                )?,
                BackendKind::RegionProposal => register(
                    &mut registry,
                    RegionProposalDetector::load(
                        &self.faster_rcnn.path,
                        load_labels(self.faster_rcnn.labels.as_deref())?,
                        self.faster_rcnn.detector,
                    )?,
                )?,
            }
        }
        registry.set_default(&self.default_model)?;
        Ok(registry)
    }
}

fn register<B: DetectionBackend + 'static>(registry: &mut BackendRegistry, mut backend: B) -> Result<()> {
    backend.warm_up()?;
    log::info!("registered backend {}", backend.name());
    registry.register(backend);
    Ok(())
}

fn load_labels(path: Option<&Path>) -> Result<ClassCatalog> {
    match path {
        Some(path) => ClassCatalog::load(path),
        None => Ok(ClassCatalog::default()),
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be between 0 and 1, got {}", name, value));
    }
    Ok(())
}

fn check_size(name: &str, value: u32) -> Result<()> {
    if value == 0 || value > MAX_CANVAS_SIDE {
        return Err(anyhow!(
            "{} must be between 1 and {}, got {}",
            name,
            MAX_CANVAS_SIDE,
            value
        ));
    }
    Ok(())
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<ServiceConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
