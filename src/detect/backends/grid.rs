use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Result};

use crate::codec::{PixelBuffer, PixelOrder};
use crate::detect::backend::{ensure_order, BackendKind, DetectionBackend, RawDetection};
use crate::detect::labels::ClassCatalog;
use crate::detect::model::{self, ArrayD, Ix2, ModelRunner, TractModel};
use crate::detect::tensor::{self, ChannelMap, Letterbox};

/// Tunables for the grid detector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridDetectorConfig {
    pub confidence: f32,
    pub iou: f32,
    pub input_size: u32,
    pub max_detections: usize,
}

impl Default for GridDetectorConfig {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            iou: 0.7,
            input_size: 640,
            max_detections: 300,
        }
    }
}

/// Single-stage grid detector (YOLO family).
///
/// Consumes BGR buffers, letterboxes them into a square RGB tensor and decodes
/// the `[1, 4 + C, anchors]` head: centre/size boxes in canvas pixels followed
/// by per-class scores. Score filtering and class-aware NMS run inside `infer`.
pub struct GridDetector {
    model: Box<dyn ModelRunner>,
    labels: ClassCatalog,
    config: GridDetectorConfig,
}

impl GridDetector {
    pub fn new(model: Box<dyn ModelRunner>, labels: ClassCatalog, config: GridDetectorConfig) -> Self {
        Self {
            model,
            labels,
            config,
        }
    }

    /// Load an ONNX export with a fixed `input_size` canvas.
    pub fn load<P: AsRef<Path>>(
        model_path: P,
        labels: ClassCatalog,
        config: GridDetectorConfig,
    ) -> Result<Self> {
        let size = config.input_size as usize;
        let model = TractModel::load(model_path, Some(&[1, 3, size, size]))?;
        Ok(Self::new(Box::new(model), labels, config))
    }

    fn preprocess(&self, pixels: &PixelBuffer) -> (ArrayD<f32>, Letterbox) {
        let (canvas, letterbox) = tensor::letterbox(pixels.channels(), self.config.input_size);
        (
            tensor::to_nchw(&canvas, ChannelMap::Swap, 1.0 / 255.0),
            letterbox,
        )
    }

    fn postprocess(&self, output: &ArrayD<f32>, letterbox: &Letterbox) -> Result<Vec<RawDetection>> {
        let head = model::squeeze_leading(output, 2)?.into_dimensionality::<Ix2>()?;
        let (rows, cols) = head.dim();
        // Features run along the short axis; anchors along the long one.
        let transposed = rows > cols;
        let (features, anchors) = if transposed { (cols, rows) } else { (rows, cols) };
        if features < 5 {
            return Err(anyhow!(
                "grid head has {} features per anchor, expected 4 box values plus classes",
                features
            ));
        }
        let value = |feature: usize, anchor: usize| {
            if transposed {
                head[[anchor, feature]]
            } else {
                head[[feature, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let (class_index, score) = (4..features)
                .map(|f| (f - 4, value(f, anchor)))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if score.is_nan() || score <= self.config.confidence {
                continue;
            }
            let corners = tensor::cxcywh_to_corners(
                value(0, anchor),
                value(1, anchor),
                value(2, anchor),
                value(3, anchor),
            );
            candidates.push(RawDetection {
                bbox: letterbox.unmap(corners),
                score,
                class_index: class_index as u32,
            });
        }
        log::debug!(
            "grid head: {} anchors, {} above {}",
            anchors,
            candidates.len(),
            self.config.confidence
        );

        let mut kept = nms(candidates, self.config.iou);
        kept.truncate(self.config.max_detections);
        Ok(kept)
    }
}

impl DetectionBackend for GridDetector {
    fn name(&self) -> &str {
        BackendKind::Grid.name()
    }

    fn pixel_order(&self) -> PixelOrder {
        BackendKind::Grid.pixel_order()
    }

    fn infer(&mut self, pixels: &PixelBuffer) -> Result<Vec<RawDetection>> {
        ensure_order(self.name(), pixels, self.pixel_order())?;
        let (input, letterbox) = self.preprocess(pixels);
        let outputs = self.model.run(vec![input])?;
        self.postprocess(model::output(&outputs, 0)?, &letterbox)
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

fn area(b: &[f32; 4]) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = w * h;
    let union = area(a) + area(b) - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Class-aware non-maximum suppression, result ordered by descending score.
fn nms(detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    let mut by_class: HashMap<u32, Vec<RawDetection>> = HashMap::new();
    for detection in detections {
        by_class
            .entry(detection.class_index)
            .or_default()
            .push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(|a, b| b.score.total_cmp(&a.score));
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            kept.push(group[i]);
            for j in (i + 1)..group.len() {
                if !suppressed[j] && iou(&group[i].bbox, &group[j].bbox) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }
    }
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::model::tests::{array, CannedModel};

    /// `[1, 4 + classes, anchors]` head from per-anchor rows, zero-padded so
    /// anchors outnumber features.
    fn head(rows: &[[f32; 6]]) -> ArrayD<f32> {
        let anchors = rows.len().max(8);
        let mut data = vec![0.0; 6 * anchors];
        for (a, row) in rows.iter().enumerate() {
            for (f, v) in row.iter().enumerate() {
                data[f * anchors + a] = *v;
            }
        }
        array(&[1, 6, anchors], data)
    }

    fn empty_head() -> ArrayD<f32> {
        array(&[1, 6, 8], vec![0.0; 48])
    }

    fn detector(output: ArrayD<f32>) -> GridDetector {
        GridDetector::new(
            Box::new(CannedModel::new(vec![output])),
            ClassCatalog::new(["person", "bottle"]),
            GridDetectorConfig {
                input_size: 320,
                ..GridDetectorConfig::default()
            },
        )
    }

    fn bgr(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_raw(
            vec![0; (width * height * 3) as usize],
            width,
            height,
            PixelOrder::Bgr,
        )
        .unwrap()
    }

    #[test]
    fn decodes_letterboxed_boxes_into_source_pixels() {
        // 640x480 into 320: scale 0.5, 40 px of padding top and bottom.
        let output = head(&[
            [100.0, 127.5, 100.0, 75.0, 0.92, 0.1],
            [10.0, 10.0, 4.0, 4.0, 0.2, 0.3],
        ]);
        let mut grid = detector(output);
        let raw = grid.infer(&bgr(640, 480)).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].class_index, 0);
        assert!((raw[0].score - 0.92).abs() < 1e-6);
        assert_eq!(raw[0].bbox, [100.0, 100.0, 300.0, 250.0]);
        assert_eq!(grid.resolve_class_name(raw[0].class_index), "person");
    }

    #[test]
    fn accepts_transposed_head() {
        let mut rows = vec![100.0, 127.5, 100.0, 75.0, 0.1, 0.8];
        // More anchors than features keeps the layout unambiguous.
        for _ in 0..7 {
            rows.extend_from_slice(&[0.0; 6]);
        }
        let output = array(&[1, 8, 6], rows);
        let mut grid = detector(output);
        let raw = grid.infer(&bgr(640, 480)).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].class_index, 1);
    }

    #[test]
    fn nms_suppresses_same_class_overlaps_only() {
        let output = head(&[
            [100.0, 100.0, 50.0, 50.0, 0.9, 0.0],
            [102.0, 100.0, 50.0, 50.0, 0.8, 0.0],
            [102.0, 100.0, 50.0, 50.0, 0.0, 0.85],
        ]);
        let mut grid = detector(output);
        let raw = grid.infer(&bgr(320, 320)).unwrap();
        let scores: Vec<f32> = raw.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.85]);
    }

    #[test]
    fn feeds_rgb_tensor_from_bgr_buffer() {
        let model = CannedModel::new(vec![empty_head()]);
        let seen = model.seen.clone();
        let mut grid = GridDetector::new(
            Box::new(model),
            ClassCatalog::default(),
            GridDetectorConfig {
                input_size: 2,
                ..GridDetectorConfig::default()
            },
        );
        let pixels = PixelBuffer::from_raw([255, 0, 0].repeat(4), 2, 2, PixelOrder::Bgr).unwrap();
        grid.infer(&pixels).unwrap();
        let inputs = seen.lock().unwrap();
        let tensor = &inputs[0][0];
        assert_eq!(tensor.shape(), &[1, 3, 2, 2]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert!((tensor[[0, 2, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn score_equal_to_confidence_is_dropped() {
        let output = head(&[
            [100.0, 100.0, 50.0, 50.0, 0.5, 0.0],
            [200.0, 200.0, 50.0, 50.0, 0.0, 0.51],
        ]);
        let mut grid = detector(output);
        let raw = grid.infer(&bgr(320, 320)).unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].class_index, 1);
    }

    #[test]
    fn rejects_rgb_buffer() {
        let mut grid = detector(empty_head());
        let rgb = bgr(4, 4).into_order(PixelOrder::Rgb);
        assert!(grid.infer(&rgb).is_err());
    }

    #[test]
    fn rejects_head_without_classes() {
        let mut grid = detector(array(&[1, 4, 10], vec![0.0; 40]));
        assert!(grid.infer(&bgr(8, 8)).is_err());
    }

    #[test]
    fn warm_up_runs_blank_canvas() {
        let model = CannedModel::new(vec![empty_head()]);
        let seen = model.seen.clone();
        let mut grid = GridDetector::new(
            Box::new(model),
            ClassCatalog::default(),
            GridDetectorConfig {
                input_size: 32,
                ..GridDetectorConfig::default()
            },
        );
        grid.warm_up().unwrap();
        assert_eq!(seen.lock().unwrap()[0][0].shape(), &[1, 3, 32, 32]);

        let mut broken = detector(array(&[1, 4, 10], vec![0.0; 40]));
        let err = broken.warm_up().unwrap_err();
        assert!(format!("{:#}", err).contains("yolo11 warm-up failed"));
    }

    #[test]
    fn warm_up_refuses_oversized_canvas() {
        let model = CannedModel::new(vec![empty_head()]);
        let seen = model.seen.clone();
        let mut grid = GridDetector::new(
            Box::new(model),
            ClassCatalog::default(),
            GridDetectorConfig {
                input_size: 70_000,
                ..GridDetectorConfig::default()
            },
        );
        assert!(grid.warm_up().is_err());
        assert!(seen.lock().unwrap().is_empty());
    }
}
