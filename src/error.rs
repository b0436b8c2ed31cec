//! Request-level error taxonomy.
//!
//! Every failure a single detection request can hit is one of these variants.
//! The dispatcher converts backend and codec failures into them, and the HTTP
//! surface maps each variant to a status code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    /// Malformed or unsupported input image.
    #[error("failed to decode image: {0}")]
    Decode(String),
    /// Requested backend is unknown or not loaded.
    #[error("unsupported model '{0}'")]
    UnsupportedModel(String),
    /// The model invocation failed.
    #[error("inference failed: {0}")]
    Inference(String),
    /// A crop region could not be encoded.
    #[error("failed to encode crop: {0}")]
    Encode(String),
}

impl DetectError {
    /// Stable machine-readable kind, used in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            DetectError::Decode(_) => "decode_error",
            DetectError::UnsupportedModel(_) => "unsupported_model",
            DetectError::Inference(_) => "inference_error",
            DetectError::Encode(_) => "encode_error",
        }
    }

    /// Client errors are 400, processing failures are 500.
    pub fn status_code(&self) -> u16 {
        match self {
            DetectError::Decode(_) | DetectError::UnsupportedModel(_) => 400,
            DetectError::Inference(_) | DetectError::Encode(_) => 500,
        }
    }

    pub(crate) fn inference(err: anyhow::Error) -> Self {
        DetectError::Inference(format!("{:#}", err))
    }
}
