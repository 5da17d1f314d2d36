use super::ModelKind;
use crate::storage::StorageError;

/// Failures while obtaining a model from the cache.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("failed to fetch {kind} model: {source}")]
    Fetch {
        kind: ModelKind,
        #[source]
        source: StorageError,
    },
    #[error("failed to load {kind} model: {reason}")]
    Load { kind: ModelKind, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("image enhancement failed: {0}")]
    Enhancement(String),
    #[error("classification failed: {0}")]
    Classification(String),
}

impl PredictionError {
    /// Stable name reported to API clients as `error_type`.
    pub fn error_type(&self) -> &'static str {
        match self {
            PredictionError::Decode(_) => "DecodeError",
            PredictionError::Model(ModelError::Fetch { .. }) => "ModelFetchError",
            PredictionError::Model(ModelError::Load { .. }) => "ModelLoadError",
            PredictionError::Enhancement(_) => "EnhancementError",
            PredictionError::Classification(_) => "ClassificationError",
        }
    }
}
