//! Waste Vision
//!
//! Object-detection inference service: a client posts one encoded image and
//! names a model family, the service returns normalized detections plus a
//! JPEG crop of every detected object.
//!
//! # Architecture
//!
//! Three model families sit behind one contract:
//!
//! 1. **Grid detector** (`yolo11`): consumes BGR pixels, applies its own NMS.
//! 2. **Transformer detector** (`rt-detr`): consumes RGB pixels, set prediction.
//! 3. **Region-proposal detector** (`faster-rcnn`): consumes BGR pixels and the
//!    original image size; its score threshold is fixed at construction.
//!
//! Whatever the family, detections are clamped to the frame, converted to
//! `x, y, width, height` form and paired by position with their crops.
//!
//! # Module Structure
//!
//! - `codec`: data-URI payloads, pixel buffers, JPEG encoding
//! - `detect`: backend trait, backends, registry, normalizer, result types
//! - `crop`: crop previews from the display image
//! - `dispatch`: one request through one backend
//! - `config`: service configuration (file + environment)
//! - `api`: HTTP surface

pub mod api;
pub mod codec;
pub mod config;
pub mod crop;
pub mod detect;
pub mod dispatch;
pub mod error;

pub use codec::{ImageCodec, ImagePayload, PixelBuffer, PixelOrder};
pub use crop::Cropper;
pub use detect::{
    BackendKind, BackendRegistry, BoundingBox, Detection, DetectionBackend, DetectionNormalizer,
    DetectionResult, RawDetection,
};
pub use dispatch::{AnalyzeRequest, DetectionDispatcher};
pub use error::DetectError;
