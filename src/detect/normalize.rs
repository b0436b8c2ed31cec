use super::backend::{DetectionBackend, RawDetection};
use super::result::{BoundingBox, Detection};

/// Converts raw backend output into canonical detections for one image.
///
/// Boxes are clamped to the image, turned into `x, y, width, height` form and
/// dropped when nothing of them remains inside the frame. A detection is kept
/// only if its crop covers at least one whole pixel, so every surviving box can
/// be cropped.
#[derive(Clone, Copy, Debug)]
pub struct DetectionNormalizer {
    width: u32,
    height: u32,
}

impl DetectionNormalizer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn normalize(&self, raw: &RawDetection, backend: &dyn DetectionBackend) -> Option<Detection> {
        if raw.score.is_nan() {
            return None;
        }
        let bounding_box = BoundingBox::from_corners(raw.bbox, self.width, self.height)?;
        if bounding_box.width <= 0.0 || bounding_box.height <= 0.0 {
            return None;
        }
        let (_, _, crop_w, crop_h) = bounding_box.pixel_region(self.width, self.height);
        if crop_w == 0 || crop_h == 0 {
            return None;
        }
        Some(Detection {
            id: raw.class_index.to_string(),
            class_name: backend.resolve_class_name(raw.class_index),
            confidence: raw.score.clamp(0.0, 1.0),
            bounding_box,
        })
    }

    /// Normalize in backend order.
    pub fn normalize_all(&self, raw: &[RawDetection], backend: &dyn DetectionBackend) -> Vec<Detection> {
        let detections: Vec<Detection> = raw
            .iter()
            .filter_map(|det| self.normalize(det, backend))
            .collect();
        if detections.len() != raw.len() {
            log::debug!(
                "{}: dropped {} of {} detections outside {}x{}",
                backend.name(),
                raw.len() - detections.len(),
                raw.len(),
                self.width,
                self.height
            );
        }
        detections
    }
}
