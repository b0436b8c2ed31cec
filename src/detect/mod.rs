mod backend;
pub mod backends;
mod labels;
pub mod model;
mod normalize;
mod registry;
mod result;
mod tensor;

pub use backend::{BackendKind, DetectionBackend, RawDetection};
pub use backends::StubBackend;
pub use labels::ClassCatalog;
pub use model::{ModelRunner, TractModel};
pub use normalize::DetectionNormalizer;
pub use registry::{BackendRegistry, SharedBackend};
pub use result::{BoundingBox, Detection, DetectionResult};
