use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Result};

use crate::codec::{PixelBuffer, PixelOrder};

/// One model output before normalization.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawDetection {
    /// Absolute corners `[x1, y1, x2, y2]` in source-image pixels. May lie
    /// outside the image.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_index: u32,
}

/// The detection model families the service knows how to drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Single-stage grid/anchor detector (YOLO family).
    Grid,
    /// Set-prediction detection transformer (RT-DETR).
    Transformer,
    /// Two-stage region-proposal detector (Faster R-CNN).
    RegionProposal,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [
        BackendKind::Grid,
        BackendKind::Transformer,
        BackendKind::RegionProposal,
    ];

    /// Name clients use to select the backend.
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Grid => "yolo11",
            BackendKind::Transformer => "rt-detr",
            BackendKind::RegionProposal => "faster-rcnn",
        }
    }

    /// Channel order the model family consumes.
    pub fn pixel_order(self) -> PixelOrder {
        match self {
            BackendKind::Grid | BackendKind::RegionProposal => PixelOrder::Bgr,
            BackendKind::Transformer => PixelOrder::Rgb,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| anyhow!("unknown backend '{}'", s))
    }
}

/// Detection backend trait.
///
/// A backend owns one loaded model and hides its pre- and post-processing.
/// Backends are built once at startup and shared across requests behind the
/// registry's per-backend lock.
pub trait DetectionBackend: Send {
    /// Name clients use to select this backend.
    fn name(&self) -> &str;

    /// Channel order `infer` expects.
    fn pixel_order(&self) -> PixelOrder;

    /// Run one image through the model.
    ///
    /// Boxes come back as absolute corners in the coordinate space of `pixels`.
    fn infer(&mut self, pixels: &PixelBuffer) -> Result<Vec<RawDetection>>;

    /// Human-readable label for a class index.
    fn resolve_class_name(&self, class_index: u32) -> String;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Reject buffers in the wrong channel order.
pub(crate) fn ensure_order(backend: &str, pixels: &PixelBuffer, expected: PixelOrder) -> Result<()> {
    if pixels.order() != expected {
        return Err(anyhow!(
            "backend '{}' expects {:?} pixels, received {:?}",
            backend,
            expected,
            pixels.order()
        ));
    }
    Ok(())
}
