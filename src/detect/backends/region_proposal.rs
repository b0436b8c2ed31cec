use std::path::Path;

use anyhow::{anyhow, Result};

use crate::codec::{PixelBuffer, PixelOrder};
use crate::detect::backend::{ensure_order, BackendKind, DetectionBackend, RawDetection};
use crate::detect::labels::ClassCatalog;
use crate::detect::model::{self, ArrayD, Ix2, IxDyn, ModelRunner, TractModel};
use crate::detect::tensor::{self, ChannelMap};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegionProposalConfig {
    /// Scores at or below this are dropped. Fixed when the detector is built.
    pub score_threshold: f32,
    /// Target length of the shorter image side.
    pub min_size: u32,
    /// Upper bound on the longer image side.
    pub max_size: u32,
}

impl Default for RegionProposalConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.5,
            min_size: 800,
            max_size: 1333,
        }
    }
}

/// Two-stage proposal + classification detector (Faster R-CNN).
///
/// Inputs: BGR samples as raw 0..255 floats in `[1, 3, H, W]` and the original
/// `(height, width)` as `[1, 2]`; the exported graph rescales its boxes to that
/// size. Outputs, in order: boxes `[N, 4]` (corners), scores `[N]`, classes `[N]`.
pub struct RegionProposalDetector {
    model: Box<dyn ModelRunner>,
    catalog: ClassCatalog,
    config: RegionProposalConfig,
}

impl RegionProposalDetector {
    pub fn new(model: Box<dyn ModelRunner>, catalog: ClassCatalog, config: RegionProposalConfig) -> Self {
        Self {
            model,
            catalog,
            config,
        }
    }

    /// Canvas size varies per image, so the input is left dynamic.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        catalog: ClassCatalog,
        config: RegionProposalConfig,
    ) -> Result<Self> {
        let model = TractModel::load(model_path, None)?;
        Ok(Self::new(Box::new(model), catalog, config))
    }

    fn inputs(&self, pixels: &PixelBuffer) -> Result<Vec<ArrayD<f32>>> {
        let (width, height) = tensor::shortest_edge_size(
            pixels.width(),
            pixels.height(),
            self.config.min_size,
            self.config.max_size,
        );
        let resized = tensor::stretch(pixels.channels(), width, height);
        let image = tensor::to_nchw(&resized, ChannelMap::Keep, 1.0);
        let size = ArrayD::from_shape_vec(
            IxDyn(&[1, 2]),
            vec![pixels.height() as f32, pixels.width() as f32],
        )?;
        Ok(vec![image, size])
    }

    fn postprocess(&self, outputs: &[ArrayD<f32>]) -> Result<Vec<RawDetection>> {
        let boxes = model::squeeze_leading(model::output(outputs, 0)?, 2)?.into_dimensionality::<Ix2>()?;
        let scores = model::squeeze_leading(model::output(outputs, 1)?, 1)?;
        let classes = model::squeeze_leading(model::output(outputs, 2)?, 1)?;
        let count = boxes.nrows();
        if boxes.ncols() != 4 || scores.len() != count || classes.len() != count {
            return Err(anyhow!(
                "region proposal outputs disagree: boxes {:?}, scores {}, classes {}",
                boxes.shape(),
                scores.len(),
                classes.len()
            ));
        }

        let mut detections = Vec::new();
        for ((bbox, &score), &class) in boxes.outer_iter().zip(scores.iter()).zip(classes.iter()) {
            if score.is_nan() || score <= self.config.score_threshold {
                continue;
            }
            if !class.is_finite() || class < 0.0 {
                return Err(anyhow!("region proposal produced invalid class id {}", class));
            }
            detections.push(RawDetection {
                bbox: [bbox[0], bbox[1], bbox[2], bbox[3]],
                score,
                class_index: class.round() as u32,
            });
        }
        Ok(detections)
    }
}

impl DetectionBackend for RegionProposalDetector {
    fn name(&self) -> &str {
        BackendKind::RegionProposal.name()
    }

    fn pixel_order(&self) -> PixelOrder {
        BackendKind::RegionProposal.pixel_order()
    }

    fn infer(&mut self, pixels: &PixelBuffer) -> Result<Vec<RawDetection>> {
        ensure_order(self.name(), pixels, self.pixel_order())?;
        let inputs = self.inputs(pixels)?;
        let outputs = self.model.run(inputs)?;
        self.postprocess(&outputs)
    }

    fn resolve_class_name(&self, class_index: u32) -> String {
        self.catalog.resolve(class_index)
    }
}
