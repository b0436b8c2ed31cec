//! Request dispatch: one image through one backend.
//!
//! The flow per request is fixed:
//! - pick the backend (unknown name fails before anything is decoded)
//! - decode the payload once for display (RGB) and derive the backend's order
//! - run inference under the backend's lock; only `infer` runs while it is held
//! - normalize, then crop every surviving detection from the display buffer

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::codec::{ImageCodec, ImagePayload, PixelOrder};
use crate::crop::Cropper;
use crate::detect::{BackendRegistry, Detection, DetectionNormalizer, DetectionResult};
use crate::error::DetectError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    pub image: ImagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AnalyzeRequest {
    pub fn new(image: ImagePayload, model: impl Into<String>) -> Self {
        Self {
            image,
            model: Some(model.into()),
        }
    }
}

pub struct DetectionDispatcher {
    registry: Arc<BackendRegistry>,
    codec: ImageCodec,
    cropper: Cropper,
}

impl DetectionDispatcher {
    pub fn new(registry: Arc<BackendRegistry>, codec: ImageCodec) -> Self {
        Self {
            registry,
            codec,
            cropper: Cropper::new(codec),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn dispatch(&self, request: &AnalyzeRequest) -> Result<DetectionResult, DetectError> {
        let started = Instant::now();
        let (name, backend) = self.registry.resolve(request.model.as_deref())?;

        let display = self.codec.decode(&request.image, PixelOrder::Rgb)?;
        let (width, height) = (display.width(), display.height());
        let normalizer = DetectionNormalizer::new(width, height);

        let order = self
            .registry
            .pixel_order(&name)
            .ok_or_else(|| DetectError::UnsupportedModel(name.clone()))?;
        let converted = (order != display.order()).then(|| display.to_order(order));
        let input = converted.as_ref().unwrap_or(&display);

        let detections: Vec<Detection> = {
            let mut backend = backend
                .lock()
                .map_err(|_| DetectError::Inference(format!("backend '{}' lock poisoned", name)))?;
            let raw = backend.infer(input).map_err(DetectError::inference)?;
            log::debug!("{}: {} raw detections for {}x{}", name, raw.len(), width, height);
            normalizer.normalize_all(&raw, &*backend)
        };

        let mut result = DetectionResult::default();
        for detection in detections {
            match self.cropper.crop(&display, &detection.bounding_box) {
                Ok(crop) => result.push(detection, crop),
                Err(err) => {
                    log::warn!("{}: skipping detection {:?}: {}", name, detection.bounding_box, err);
                }
            }
        }

        log::info!(
            "{}: {} detections in {} ms",
            name,
            result.len(),
            started.elapsed().as_millis()
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tests::png_payload;
    use crate::detect::{ClassCatalog, RawDetection, StubBackend};
    use image::{Rgb, RgbImage};
    use std::sync::atomic::Ordering;

    fn image() -> ImagePayload {
        png_payload(&RgbImage::from_pixel(64, 48, Rgb([10, 200, 30])))
    }

    fn raw(bbox: [f32; 4]) -> RawDetection {
        RawDetection {
            bbox,
            score: 0.8,
            class_index: 0,
        }
    }

    #[test]
    fn unknown_model_fails_before_decoding() {
        let stub = StubBackend::new("yolo11", PixelOrder::Bgr);
        let calls = stub.call_counter();
        let mut registry = BackendRegistry::new();
        registry.register(stub);
        let dispatcher = DetectionDispatcher::new(Arc::new(registry), ImageCodec::default());

        let request = AnalyzeRequest::new(ImagePayload::new("not an image"), "unknown-model");
        assert!(matches!(
            dispatcher.dispatch(&request),
            Err(DetectError::UnsupportedModel(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bad_payload_is_decode_error() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new("yolo11", PixelOrder::Bgr));
        let dispatcher = DetectionDispatcher::new(Arc::new(registry), ImageCodec::default());
        let request = AnalyzeRequest::new(ImagePayload::new("data:image/png;base64,@@@"), "yolo11");
        assert!(matches!(dispatcher.dispatch(&request), Err(DetectError::Decode(_))));
    }

    #[test]
    fn backend_failure_is_inference_error() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new("rt-detr", PixelOrder::Rgb).failing("tensor shape mismatch"));
        let dispatcher = DetectionDispatcher::new(Arc::new(registry), ImageCodec::default());
        match dispatcher.dispatch(&AnalyzeRequest::new(image(), "rt-detr")) {
            Err(DetectError::Inference(msg)) => assert!(msg.contains("tensor shape mismatch")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn bgr_backend_receives_converted_buffer_and_crops_pair_up() {
        let stub = StubBackend::new("yolo11", PixelOrder::Bgr)
            .with_labels(ClassCatalog::new(["bottle"]))
            .with_detections(vec![
                raw([4.0, 4.0, 20.0, 16.0]),
                raw([30.0, 30.0, 30.1, 40.0]),
                raw([-5.0, 10.0, 8.0, 90.0]),
            ]);
        let mut registry = BackendRegistry::new();
        registry.register(stub);
        let dispatcher = DetectionDispatcher::new(Arc::new(registry), ImageCodec::default());

        let request = AnalyzeRequest {
            image: image(),
            model: None,
        };
        let result = dispatcher.dispatch(&request).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result.cropped_images().len(), 2);
        assert_eq!(result.detections()[0].class_name, "bottle");
        assert_eq!(result.detections()[1].bounding_box.x, 0.0);
        assert_eq!(result.detections()[1].bounding_box.height, 38.0);
        for (_, crop) in result.iter() {
            assert!(crop.as_str().starts_with("data:image/jpeg;base64,"));
        }
    }

    #[test]
    fn request_model_field_is_optional() {
        let request: AnalyzeRequest = serde_json::from_str(r#"{"image":"abc"}"#).unwrap();
        assert_eq!(request.model, None);
        let request: AnalyzeRequest =
            serde_json::from_str(r#"{"image":"abc","model":"rt-detr"}"#).unwrap();
        assert_eq!(request.model.as_deref(), Some("rt-detr"));
    }
}
