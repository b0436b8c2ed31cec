//! Crop previews for detected objects.

use crate::codec::{ImageCodec, ImagePayload, PixelBuffer};
use crate::detect::BoundingBox;
use crate::error::DetectError;

/// Cuts detection regions out of the display image and encodes them as JPEG
/// data URIs.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cropper {
    codec: ImageCodec,
}

impl Cropper {
    pub fn new(codec: ImageCodec) -> Self {
        Self { codec }
    }

    /// Crop `bbox` out of `display`. The encoder writes RGB, so a buffer in
    /// another order still produces a preview in true colors.
    pub fn crop(&self, display: &PixelBuffer, bbox: &BoundingBox) -> Result<ImagePayload, DetectError> {
        let (x, y, width, height) = bbox.pixel_region(display.width(), display.height());
        let region = display
            .region(x, y, width, height)
            .map_err(|e| DetectError::Encode(e.to_string()))?;
        self.codec.encode(&region)
    }
}
