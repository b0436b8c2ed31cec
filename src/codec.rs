//! Image payload codec.
//!
//! - `ImagePayload`: encoded image carried as a data-URI string.
//! - `PixelBuffer`: decoded 8-bit, 3-channel pixels with a tracked channel order.
//! - `ImageCodec`: payload -> pixels (any supported container) and
//!   pixels -> JPEG data URI.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::error::DetectError;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;
/// Largest side accepted for a model input canvas.
pub const MAX_CANVAS_SIDE: u32 = 4096;

const DATA_URI_SCHEME: &str = "data:";
const JPEG_MEDIA_TYPE: &str = "image/jpeg";

/// Channel order of a decoded buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelOrder {
    Rgb,
    Bgr,
}

/// Decoded pixels, shape (height, width, 3), row-major.
///
/// The channel order is part of the value: two buffers with the same bytes but
/// different orders are different images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    image: RgbImage,
    order: PixelOrder,
}

impl PixelBuffer {
    /// Wrap raw interleaved samples. Length must be `width * height * 3`.
    pub fn from_raw(data: Vec<u8>, width: u32, height: u32, order: PixelOrder) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("pixel buffer dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "pixel buffer length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, data)
            .ok_or_else(|| anyhow!("pixel buffer rejected {}x{}", width, height))?;
        Ok(Self { image, order })
    }

    /// All-zero square canvas of side `size`, used to warm up fixed-size models.
    pub fn blank(size: u32, order: PixelOrder) -> Result<Self> {
        if size == 0 || size > MAX_CANVAS_SIDE {
            return Err(anyhow!(
                "canvas side {} outside 1..={}",
                size,
                MAX_CANVAS_SIDE
            ));
        }
        let len = (size as usize)
            .checked_mul(size as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("pixel buffer dimensions overflow"))?;
        Self::from_raw(vec![0; len], size, size, order)
    }

    pub fn from_rgb_image(image: RgbImage) -> Self {
        Self {
            image,
            order: PixelOrder::Rgb,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn order(&self) -> PixelOrder {
        self.order
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Samples at (x, y) in this buffer's own channel order.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        self.image.get_pixel(x, y).0
    }

    /// Samples viewed as a 3-channel image, channels in `self.order()`.
    pub(crate) fn channels(&self) -> &RgbImage {
        &self.image
    }

    /// Convert to `order`, swapping the first and third channel when needed.
    pub fn into_order(mut self, order: PixelOrder) -> Self {
        if self.order != order {
            for pixel in self.image.pixels_mut() {
                pixel.0.swap(0, 2);
            }
            self.order = order;
        }
        self
    }

    pub fn to_order(&self, order: PixelOrder) -> Self {
        self.clone().into_order(order)
    }

    /// Copy a sub-rectangle. The rectangle must lie inside the buffer.
    pub fn region(&self, x: u32, y: u32, width: u32, height: u32) -> Result<Self> {
        let fits_x = x.checked_add(width).is_some_and(|end| end <= self.width());
        let fits_y = y.checked_add(height).is_some_and(|end| end <= self.height());
        if !fits_x || !fits_y {
            return Err(anyhow!(
                "region {}x{}+{}+{} outside {}x{} buffer",
                width,
                height,
                x,
                y,
                self.width(),
                self.height()
            ));
        }
        let image = image::imageops::crop_imm(&self.image, x, y, width, height).to_image();
        Ok(Self {
            image,
            order: self.order,
        })
    }

    /// Display copy in RGB order.
    pub fn to_rgb_image(&self) -> RgbImage {
        self.to_order(PixelOrder::Rgb).image
    }
}

/// Encoded image as a data URI (`data:<media type>;base64,<bytes>`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImagePayload(String);

impl ImagePayload {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Wrap already-encoded container bytes (JPEG, PNG, ...) as a data URI.
    pub fn from_image_bytes(media_type: &str, bytes: &[u8]) -> Self {
        Self(format!("data:{};base64,{}", media_type, B64.encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base64 part, without any data-URI header.
    fn base64_body(&self) -> Result<&str, DetectError> {
        let value = self.0.trim();
        if !value.starts_with(DATA_URI_SCHEME) {
            return Ok(value);
        }
        value
            .split_once(',')
            .map(|(_, body)| body)
            .ok_or_else(|| DetectError::Decode("data URI has no ',' separator".to_string()))
    }
}

impl From<String> for ImagePayload {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Decodes request payloads and encodes crop previews.
#[derive(Clone, Copy, Debug)]
pub struct ImageCodec {
    jpeg_quality: u8,
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl ImageCodec {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Decode a payload into pixels in `order`.
    pub fn decode(
        &self,
        payload: &ImagePayload,
        order: PixelOrder,
    ) -> Result<PixelBuffer, DetectError> {
        let body = payload.base64_body()?;
        if body.is_empty() {
            return Err(DetectError::Decode("empty image payload".to_string()));
        }
        let bytes = B64
            .decode(body)
            .map_err(|e| DetectError::Decode(format!("invalid base64: {}", e)))?;
        if bytes.is_empty() {
            return Err(DetectError::Decode("empty image payload".to_string()));
        }
        let decoded = image::load_from_memory(&bytes)
            .map_err(|e| DetectError::Decode(format!("unsupported image data: {}", e)))?;
        let rgb = decoded.to_rgb8();
        if rgb.width() == 0 || rgb.height() == 0 {
            return Err(DetectError::Decode("image has no pixels".to_string()));
        }
        Ok(PixelBuffer::from_rgb_image(rgb).into_order(order))
    }

    /// Encode pixels as a JPEG data URI. Empty regions are rejected.
    pub fn encode(&self, region: &PixelBuffer) -> Result<ImagePayload, DetectError> {
        if region.width() == 0 || region.height() == 0 {
            return Err(DetectError::Encode(format!(
                "empty region {}x{}",
                region.width(),
                region.height()
            )));
        }
        let rgb = region.to_rgb_image();
        let mut jpeg = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, self.jpeg_quality);
        encoder
            .encode_image(&rgb)
            .map_err(|e| DetectError::Encode(e.to_string()))?;
        Ok(ImagePayload::from_image_bytes(JPEG_MEDIA_TYPE, &jpeg))
    }
}
