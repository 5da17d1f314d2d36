//! Two-stage retinal screening pipeline.
//!
//! An enhancement generator normalizes illumination and contrast, then a
//! TorchScript classifier grades the enhanced image into one of five DR
//! severity levels. Weights are fetched lazily from blob storage and kept in a
//! [`model_cache::ModelCache`].

pub mod adjust;
pub mod classifier;
pub mod error;
pub mod generator;
pub mod loader;
pub mod model_cache;
pub mod predictor;
pub mod preprocess;

use std::fmt;
use std::str::FromStr;
use tch::{TchError, Tensor};

pub use error::{ModelError, PredictionError};
pub use model_cache::ModelCache;
pub use predictor::Predictor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Enhancement,
    Classification,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Enhancement, ModelKind::Classification];

    pub fn as_str(self) -> &'static str {
        match self {
            ModelKind::Enhancement => "enhancement",
            ModelKind::Classification => "classification",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enhancement" => Ok(ModelKind::Enhancement),
            "classification" => Ok(ModelKind::Classification),
            other => Err(format!("unknown model kind: {}", other)),
        }
    }
}

/// A loaded network that maps one input batch to one output batch.
///
/// Implementations move the input to their own device and always hand back a
/// CPU tensor. Calls against one handle are serialized internally.
pub trait ImageModel: Send + Sync {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError>;
}
