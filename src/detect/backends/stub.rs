use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::codec::{PixelBuffer, PixelOrder};
use crate::detect::backend::{ensure_order, DetectionBackend, RawDetection};
use crate::detect::labels::ClassCatalog;

/// Stub backend for testing. Returns scripted detections.
///
/// The stub still enforces its pixel order, so a dispatcher that hands it the
/// wrong buffer fails the same way a real backend would.
pub struct StubBackend {
    name: String,
    order: PixelOrder,
    detections: Vec<RawDetection>,
    labels: ClassCatalog,
    failure: Option<String>,
    calls: Arc<AtomicUsize>,
}

impl StubBackend {
    pub fn new(name: impl Into<String>, order: PixelOrder) -> Self {
        Self {
            name: name.into(),
            order,
            detections: Vec::new(),
            labels: ClassCatalog::default(),
            failure: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_detections(mut self, detections: Vec<RawDetection>) -> Self {
        self.detections = detections;
        self
    }

    pub fn with_labels(mut self, labels: ClassCatalog) -> Self {
        self.labels = labels;
        self
    }

    /// Make every `infer` call fail with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Shared counter of `infer` calls; stays valid after registration.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl DetectionBackend for StubBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn pixel_order(&self) -> PixelOrder {
        self.order
    }

    fn infer(&mut self, pixels: &PixelBuffer) -> Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ensure_order(&self.name, pixels, self.order)?;
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        Ok(self.detections.clone())
    }

    fn resolve_class_name(&self, class_index: u32) -> String {
        self.labels.resolve(class_index)
    }
}
