use serde::{Deserialize, Serialize};

use crate::codec::ImagePayload;

/// Axis-aligned box in source-image pixels, origin top-left.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Clamp corner coordinates into `[0, width] x [0, height]` and convert to
    /// top-left/size form. Returns `None` for non-finite input.
    pub fn from_corners(corners: [f32; 4], image_width: u32, image_height: u32) -> Option<Self> {
        if corners.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let max_x = image_width as f32;
        let max_y = image_height as f32;
        let x1 = corners[0].clamp(0.0, max_x);
        let y1 = corners[1].clamp(0.0, max_y);
        let x2 = corners[2].clamp(0.0, max_x);
        let y2 = corners[3].clamp(0.0, max_y);
        Some(Self {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0.0),
            height: (y2 - y1).max(0.0),
        })
    }

    /// Integer pixel rectangle `(x, y, width, height)` covered by this box.
    ///
    /// Origin and size are each rounded to the nearest pixel, so the crop is
    /// `round(width) x round(height)` unless the image edge cuts it short.
    pub fn pixel_region(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        let round = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let x = round(self.x, image_width);
        let y = round(self.y, image_height);
        let width = round(self.width, image_width - x);
        let height = round(self.height, image_height - y);
        (x, y, width, height)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Backend-agnostic detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Raw class index reported by the backend.
    pub id: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    #[serde(rename = "boundingBox")]
    pub bounding_box: BoundingBox,
}

/// Detections and their crop previews, paired by position.
///
/// Serialize-only: the only way in is `push`, which keeps both lists the same
/// length.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    cropped_images: Vec<ImagePayload>,
}

impl DetectionResult {
    pub fn push(&mut self, detection: Detection, crop: ImagePayload) {
        self.detections.push(detection);
        self.cropped_images.push(crop);
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn cropped_images(&self) -> &[ImagePayload] {
        &self.cropped_images
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Detection, &ImagePayload)> {
        self.detections.iter().zip(self.cropped_images.iter())
    }
}
