//! Pixel buffer -> input tensor conversion shared by the backends.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::tract_ndarray::Array4;

use super::model::ArrayD;

const LETTERBOX_FILL: u8 = 114;

/// Channel order inside the tensor, relative to the buffer's own order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelMap {
    /// Channels copied as stored.
    Keep,
    /// First and third channel swapped (BGR buffer -> RGB tensor).
    Swap,
}

impl ChannelMap {
    fn source(self, channel: usize) -> usize {
        match self {
            ChannelMap::Keep => channel,
            ChannelMap::Swap => 2 - channel,
        }
    }
}

/// Build a `[1, 3, H, W]` tensor, each sample multiplied by `scale`.
pub(crate) fn to_nchw(image: &RgbImage, channels: ChannelMap, scale: f32) -> ArrayD<f32> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let samples = image.as_raw();
    Array4::from_shape_fn((1, 3, height, width), |(_, channel, y, x)| {
        let idx = (y * width + x) * 3 + channels.source(channel);
        samples[idx] as f32 * scale
    })
    .into_dyn()
}

/// Plain resize to `width` x `height`, aspect ratio not preserved.
pub(crate) fn stretch(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}

/// Mapping between source pixels and a letterboxed square canvas.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Scale-to-fit into a `size` square, resized content centred.
    pub fn fit(src_width: u32, src_height: u32, size: u32) -> (Self, u32, u32) {
        let scale = (size as f32 / src_width as f32).min(size as f32 / src_height as f32);
        let new_width = ((src_width as f32 * scale).round() as u32).clamp(1, size);
        let new_height = ((src_height as f32 * scale).round() as u32).clamp(1, size);
        let letterbox = Self {
            scale,
            pad_x: ((size - new_width) / 2) as f32,
            pad_y: ((size - new_height) / 2) as f32,
        };
        (letterbox, new_width, new_height)
    }

    /// Canvas corners back to source-image corners.
    pub fn unmap(&self, corners: [f32; 4]) -> [f32; 4] {
        [
            (corners[0] - self.pad_x) / self.scale,
            (corners[1] - self.pad_y) / self.scale,
            (corners[2] - self.pad_x) / self.scale,
            (corners[3] - self.pad_y) / self.scale,
        ]
    }
}

/// Resize into a `size` square with grey padding.
pub(crate) fn letterbox(image: &RgbImage, size: u32) -> (RgbImage, Letterbox) {
    let (letterbox, new_width, new_height) = Letterbox::fit(image.width(), image.height(), size);
    let resized = stretch(image, new_width, new_height);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_x as i64,
        letterbox.pad_y as i64,
    );
    (canvas, letterbox)
}

/// Output size for a shortest-edge resize capped on the long edge.
pub(crate) fn shortest_edge_size(width: u32, height: u32, min_size: u32, max_size: u32) -> (u32, u32) {
    let short = width.min(height) as f32;
    let long = width.max(height) as f32;
    let mut scale = min_size as f32 / short;
    if long * scale > max_size as f32 {
        scale = max_size as f32 / long;
    }
    let new_width = ((width as f32 * scale).round() as u32).max(1);
    let new_height = ((height as f32 * scale).round() as u32).max(1);
    (new_width, new_height)
}

/// Convert centre/size to corners.
pub(crate) fn cxcywh_to_corners(cx: f32, cy: f32, w: f32, h: f32) -> [f32; 4] {
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}
