use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::codec::PixelOrder;
use crate::error::DetectError;

use super::backend::DetectionBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectionBackend>>;

/// Thread-safe registry of detection backends.
///
/// Backends are wrapped in `Mutex` because `DetectionBackend::infer` takes
/// `&mut self`; the lock is the only serialization point between concurrent
/// requests that pick the same backend.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    orders: HashMap<String, PixelOrder>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            orders: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend under its own name. The first registered backend
    /// becomes the default.
    pub fn register<B: DetectionBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.orders.insert(name.clone(), backend.pixel_order());
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Pixel order a backend expects, recorded at registration so callers can
    /// prepare input without taking the backend lock.
    pub fn pixel_order(&self, name: &str) -> Option<PixelOrder> {
        self.orders.get(name).copied()
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Pick the backend for a request. `None` selects the default backend.
    pub fn resolve(&self, name: Option<&str>) -> Result<(String, SharedBackend), DetectError> {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => self
                .default_name
                .as_deref()
                .ok_or_else(|| DetectError::UnsupportedModel("<default>".to_string()))?,
        };
        self.get(name)
            .map(|backend| (name.to_string(), backend))
            .ok_or_else(|| DetectError::UnsupportedModel(name.to_string()))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
