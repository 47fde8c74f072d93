//! Error types for the import pipeline

use thiserror::Error;

/// Import pipeline errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("No recognized tensor container found")]
    DataNotFound,

    #[error("Tensor not found: {key}")]
    TensorNotFound { key: String },

    #[error("Cannot determine model version")]
    ModelVersionFailed,

    #[error("Tensor writes failed: expected {expected} tensors, store holds {actual}")]
    TensorWritesFailed { expected: usize, actual: usize },

    #[error("Import interrupted")]
    Interrupted,

    #[error("Embedding parts disagree on multivector length: {lengths:?}")]
    EmbeddingMismatch { lengths: Vec<usize> },

    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("Invalid tensor header: {0}")]
    InvalidHeader(String),

    #[error("Object graph decode error: {0}")]
    Pickle(String),

    #[error("Shape error: {0}")]
    Shape(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Safetensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::Shape(err.to_string())
    }
}

impl Error {
    /// Whether this error is a cooperative cancellation rather than a failure.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    pub(crate) fn tensor_not_found(key: impl Into<String>) -> Self {
        Error::TensorNotFound { key: key.into() }
    }
}

/// Result type for import operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::tensor_not_found("conv_in.weight");
        assert!(err.to_string().contains("conv_in.weight"));

        let err = Error::TensorWritesFailed {
            expected: 686,
            actual: 680,
        };
        assert!(err.to_string().contains("686"));
        assert!(err.to_string().contains("680"));
    }

    #[test]
    fn test_interrupted_is_distinguished() {
        assert!(Error::Interrupted.is_interrupted());
        assert!(!Error::DataNotFound.is_interrupted());
        assert!(!Error::ModelVersionFailed.is_interrupted());
    }

    #[test]
    fn test_shape_error_conversion() {
        let err = ndarray::Array::from_shape_vec((2, 2), vec![1.0f32; 3]).unwrap_err();
        let err: Error = err.into();
        assert!(matches!(err, Error::Shape(_)));
    }
}
