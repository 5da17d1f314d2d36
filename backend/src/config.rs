use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tch::Device;

use crate::inference::ModelKind;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidVar { name: &'static str, value: String },
    #[error("failed to read pipeline config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse pipeline config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Pipeline settings read from `config/pipeline.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: ModelsConfig,
    pub enhancement: EnhancementConfig,
    pub classification: ClassificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub enhancement_key: String,
    pub classification_key: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            enhancement_key: "enhanced_gan_models.ot".to_string(),
            classification_key: "DR_model_final.pt".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn key(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Enhancement => &self.enhancement_key,
            ModelKind::Classification => &self.classification_key,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementConfig {
    pub input_size: u32,
    pub contrast: f32,
    pub sharpness: f32,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            input_size: 256,
            contrast: 1.6,
            sharpness: 1.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub input_size: u32,
    /// `[1, H, W, 3]` input when true, `[1, 3, H, W]` otherwise.
    pub channels_last: bool,
    /// Set for models that emit logits rather than probabilities.
    pub apply_softmax: bool,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            channels_last: true,
            apply_softmax: false,
        }
    }
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path)?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(config_str)?;
        Ok(config)
    }

    /// Falls back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            log::info!("Loading pipeline config from {}", path.display());
            Self::load(path)
        } else {
            log::warn!(
                "Pipeline config {} not found, using defaults",
                path.display()
            );
            Ok(Self::default())
        }
    }
}

/// Service settings taken from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub model_bucket: String,
    pub image_bucket: String,
    pub patients_table: String,
    pub reports_table: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub openai_base_url: Option<String>,
    pub pipeline_config: String,
    pub model_scratch_dir: Option<String>,
    pub device: Device,
    pub preload_models: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::MissingVar(name));

        let port_str = lookup("PORT").unwrap_or_else(|| "8081".to_string());
        let port = port_str.parse().map_err(|_| ConfigError::InvalidVar {
            name: "PORT",
            value: port_str.clone(),
        })?;

        let model_bucket = required("AWS_BUCKET_NAME")?;
        let image_bucket = lookup("IMAGE_BUCKET_NAME").unwrap_or_else(|| model_bucket.clone());

        let device = match lookup("INFERENCE_DEVICE").as_deref() {
            None | Some("cpu") => Device::Cpu,
            Some("cuda") => Device::cuda_if_available(),
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "INFERENCE_DEVICE",
                    value: other.to_string(),
                });
            }
        };

        let preload_models = match lookup("PRELOAD_MODELS").as_deref() {
            None | Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                return Err(ConfigError::InvalidVar {
                    name: "PRELOAD_MODELS",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            port,
            model_bucket,
            image_bucket,
            patients_table: required("DYNAMODB_PATIENTS_TABLE")?,
            reports_table: required("DYNAMODB_REPORTS_TABLE")?,
            openai_api_key: required("OPENAI_API_KEY")?,
            openai_model: lookup("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_base_url: lookup("OPENAI_BASE_URL"),
            pipeline_config: lookup("PIPELINE_CONFIG")
                .unwrap_or_else(|| "config/pipeline.yaml".to_string()),
            model_scratch_dir: lookup("MODEL_SCRATCH_DIR"),
            device,
            preload_models,
        })
    }
}
