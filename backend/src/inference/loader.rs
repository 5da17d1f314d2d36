use std::path::PathBuf;
use std::sync::Arc;
use tch::Device;

use super::classifier::TorchScriptClassifier;
use super::generator::LoadedGenerator;
use super::{ImageModel, ModelKind};

/// Turns fetched weight bytes into a runnable model.
pub trait ModelMaterializer: Send + Sync {
    fn materialize(&self, kind: ModelKind, bytes: &[u8]) -> Result<Arc<dyn ImageModel>, String>;
}

#[derive(Debug, Clone)]
pub struct TorchMaterializer {
    device: Device,
    scratch_dir: Option<PathBuf>,
}

impl TorchMaterializer {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }
}

impl ModelMaterializer for TorchMaterializer {
    fn materialize(&self, kind: ModelKind, bytes: &[u8]) -> Result<Arc<dyn ImageModel>, String> {
        let model: Arc<dyn ImageModel> = match kind {
            ModelKind::Enhancement => Arc::new(
                LoadedGenerator::load(bytes, self.device).map_err(|e| e.to_string())?,
            ),
            ModelKind::Classification => Arc::new(
                TorchScriptClassifier::load(bytes, self.device, self.scratch_dir.as_deref())
                    .map_err(|e| e.to_string())?,
            ),
        };
        log::info!(
            "Materialized {} model ({} bytes) on {:?}",
            kind,
            bytes.len(),
            self.device
        );
        Ok(model)
    }
}
