use std::path::Path;

use anyhow::{anyhow, Result};

use crate::codec::{PixelBuffer, PixelOrder};
use crate::detect::backend::{ensure_order, BackendKind, DetectionBackend, RawDetection};
use crate::detect::labels::ClassCatalog;
use crate::detect::model::{self, ArrayD, Ix2, ModelRunner, TractModel};
use crate::detect::tensor::{self, ChannelMap};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformerDetectorConfig {
    pub confidence: f32,
    pub input_size: u32,
}

impl Default for TransformerDetectorConfig {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            input_size: 640,
        }
    }
}

/// Set-prediction detector (RT-DETR).
///
/// Takes RGB buffers as-is, stretches them to the square input and reads one
/// prediction per query: normalised centre/size box plus class scores. Query
/// order is kept; there is no NMS stage.
pub struct TransformerDetector {
    model: Box<dyn ModelRunner>,
    labels: ClassCatalog,
    config: TransformerDetectorConfig,
}

impl TransformerDetector {
    pub fn new(
        model: Box<dyn ModelRunner>,
        labels: ClassCatalog,
        config: TransformerDetectorConfig,
    ) -> Self {
        Self {
            model,
            labels,
            config,
        }
    }

    pub fn load<P: AsRef<Path>>(
        model_path: P,
        labels: ClassCatalog,
        config: TransformerDetectorConfig,
    ) -> Result<Self> {
        let size = config.input_size as usize;
        let model = TractModel::load(model_path, Some(&[1, 3, size, size]))?;
        Ok(Self::new(Box::new(model), labels, config))
    }

    fn postprocess(&self, output: &ArrayD<f32>, width: u32, height: u32) -> Result<Vec<RawDetection>> {
        let queries = model::squeeze_leading(output, 2)?.into_dimensionality::<Ix2>()?;
        let features = queries.shape()[1];
        if features < 5 {
            return Err(anyhow!(
                "transformer output has {} values per query, expected 4 box values plus classes",
                features
            ));
        }
        let (scale_x, scale_y) = (width as f32, height as f32);

        let mut detections = Vec::new();
        for query in queries.outer_iter() {
            let mut best = (0usize, f32::NEG_INFINITY);
            for (class_index, &score) in query.iter().skip(4).enumerate() {
                if score > best.1 {
                    best = (class_index, score);
                }
            }
            let (class_index, score) = best;
            if score.is_nan() || score <= self.config.confidence {
                continue;
            }
            let [x1, y1, x2, y2] = tensor::cxcywh_to_corners(query[0], query[1], query[2], query[3]);
            detections.push(RawDetection {
                bbox: [x1 * scale_x, y1 * scale_y, x2 * scale_x, y2 * scale_y],
                score,
                class_index: class_index as u32,
            });
        }
        Ok(detections)
    }
}

impl DetectionBackend for TransformerDetector {
    fn name(&self) -> &str {
        BackendKind::Transformer.name()
    }

    fn pixel_order(&self) -> PixelOrder {
        BackendKind::Transformer.pixel_order()
    }

    fn infer(&mut self, pixels: &PixelBuffer) -> Result<Vec<RawDetection>> {
        ensure_order(self.name(), pixels, self.pixel_order())?;
        let size = self.config.input_size;
        let resized = tensor::stretch(pixels.channels(), size, size);
        let input = tensor::to_nchw(&resized, ChannelMap::Keep, 1.0 / 255.0);
        let outputs = self.model.run(vec![input])?;
        self.postprocess(model::output(&outputs, 0)?, pixels.width(), pixels.height())
    }

    fn resolve_class_name(&self, class_index: u32) -> String {
        self.labels.resolve(class_index)
    }

    /// One blank canvas through the model, so shape mismatches surface at startup.
    fn warm_up(&mut self) -> Result<()> {
        let blank = PixelBuffer::blank(self.config.input_size, self.pixel_order())?;
        self.infer(&blank)
            .map(|_| ())
            .map_err(|err| err.context(format!("{} warm-up failed", self.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::model::tests::{array, CannedModel};

    fn rgb(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_raw(
            vec![0; (width * height * 3) as usize],
            width,
            height,
            PixelOrder::Rgb,
        )
        .unwrap()
    }

    fn detector(output: ArrayD<f32>) -> TransformerDetector {
        TransformerDetector::new(
            Box::new(CannedModel::new(vec![output])),
            ClassCatalog::new(["person", "can"]),
            TransformerDetectorConfig {
                input_size: 32,
                ..TransformerDetectorConfig::default()
            },
        )
    }

    #[test]
    fn scales_normalised_queries_to_source_size() {
        let output = array(
            &[1, 3, 6],
            vec![
                0.3125, 0.364_583_3, 0.3125, 0.3125, 0.92, 0.01, //
                0.5, 0.5, 0.1, 0.1, 0.2, 0.4, //
                0.75, 0.75, 0.1, 0.1, 0.05, 0.7, //
            ],
        );
        let mut detr = detector(output);
        let raw = detr.infer(&rgb(640, 480)).unwrap();
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0].class_index, 0);
        let expected = [100.0, 100.0, 300.0, 250.0];
        for (got, want) in raw[0].bbox.iter().zip(expected) {
            assert!((got - want).abs() < 1e-2, "{got} vs {want}");
        }
        assert_eq!(raw[1].class_index, 1);
        assert_eq!(detr.resolve_class_name(1), "can");
    }

    #[test]
    fn feeds_rgb_tensor_unchanged() {
        let model = CannedModel::new(vec![array(&[1, 1, 6], vec![0.0; 6])]);
        let seen = model.seen.clone();
        let mut detr = TransformerDetector::new(
            Box::new(model),
            ClassCatalog::default(),
            TransformerDetectorConfig {
                input_size: 2,
                ..TransformerDetectorConfig::default()
            },
        );
        let pixels = PixelBuffer::from_raw([255, 0, 0].repeat(4), 2, 2, PixelOrder::Rgb).unwrap();
        assert!(detr.infer(&pixels).unwrap().is_empty());
        let inputs = seen.lock().unwrap();
        assert!((inputs[0][0][[0, 0, 1, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(inputs[0][0][[0, 2, 1, 1]], 0.0);
    }

    #[test]
    fn score_equal_to_confidence_is_dropped() {
        let output = array(
            &[1, 2, 6],
            vec![
                0.5, 0.5, 0.2, 0.2, 0.5, 0.1, //
                0.5, 0.5, 0.2, 0.2, 0.1, 0.51, //
            ],
        );
        let mut detr = detector(output);
        let raw = detr.infer(&rgb(64, 64)).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].class_index, 1);
    }

    #[test]
    fn warm_up_refuses_oversized_canvas() {
        let mut detr = TransformerDetector::new(
            Box::new(CannedModel::new(vec![array(&[1, 1, 6], vec![0.0; 6])])),
            ClassCatalog::default(),
            TransformerDetectorConfig {
                input_size: u32::MAX,
                ..TransformerDetectorConfig::default()
            },
        );
        assert!(detr.warm_up().is_err());
    }

    #[test]
    fn rejects_bgr_buffer() {
        let mut detr = detector(array(&[1, 1, 6], vec![0.0; 6]));
        let bgr = rgb(4, 4).into_order(PixelOrder::Bgr);
        assert!(detr.infer(&bgr).is_err());
    }
}
