use image::RgbImage;
use log::{debug, info};
use retina_shared::PredictionResult;
use std::any::Any;
use std::sync::Arc;
use tch::{Kind, TchError};

use super::preprocess::{self, IMAGENET_MEAN, IMAGENET_STD};
use super::{ImageModel, ModelCache, ModelKind, PredictionError, adjust};
use crate::config::{ClassificationConfig, EnhancementConfig, PipelineConfig};

/// Runs decode → enhancement → classification → label mapping for one image.
#[derive(Clone)]
pub struct Predictor {
    cache: Arc<ModelCache>,
    enhancement: EnhancementConfig,
    classification: ClassificationConfig,
}

impl Predictor {
    pub fn new(cache: Arc<ModelCache>, config: &PipelineConfig) -> Self {
        Self {
            cache,
            enhancement: config.enhancement.clone(),
            classification: config.classification.clone(),
        }
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    /// Either a complete result or an error; nothing partial is returned.
    pub async fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, PredictionError> {
        let image = preprocess::decode_rgb(image_bytes)?;
        debug!("Decoded {}x{} image", image.width(), image.height());

        let generator = self.cache.obtain(ModelKind::Enhancement).await?;
        let settings = self.enhancement.clone();
        let enhanced = run_stage(move || enhance(generator.as_ref(), &image, &settings))
            .await
            .map_err(PredictionError::Enhancement)?;

        let classifier = self.cache.obtain(ModelKind::Classification).await?;
        let settings = self.classification.clone();
        let probabilities = run_stage(move || classify(classifier.as_ref(), &enhanced, &settings))
            .await
            .map_err(PredictionError::Classification)?;

        let result = PredictionResult::from_probabilities(&probabilities)
            .map_err(|e| PredictionError::Classification(e.to_string()))?;
        info!(
            "Prediction: {} ({}) with confidence {:.3}",
            result.severity_level, result.dr_status, result.confidence
        );
        Ok(result)
    }
}

/// Generator pass plus denormalization and the contrast/sharpness boost.
pub fn enhance(
    model: &dyn ImageModel,
    image: &RgbImage,
    settings: &EnhancementConfig,
) -> Result<RgbImage, TchError> {
    let size = settings.input_size;
    let prepared = preprocess::resize_and_center_crop(image, size);
    let normalized = preprocess::normalize_chw(&prepared, &IMAGENET_MEAN, &IMAGENET_STD);

    let output = model.forward(&preprocess::batch_tensor(normalized))?;
    let output = preprocess::unbatch_chw(&output)?;
    if output.dim() != (3, size as usize, size as usize) {
        return Err(TchError::Shape(format!(
            "generator changed the image shape to {:?}",
            output.dim()
        )));
    }

    let restored = preprocess::denormalize_chw(&output, &IMAGENET_MEAN, &IMAGENET_STD);
    let raster = preprocess::chw_to_rgb(&restored);
    let raster = adjust::contrast(&raster, settings.contrast);
    Ok(adjust::sharpness(&raster, settings.sharpness))
}

/// Classifier pass on `/255` scaled pixels; returns the raw class vector.
pub fn classify(
    model: &dyn ImageModel,
    image: &RgbImage,
    settings: &ClassificationConfig,
) -> Result<Vec<f32>, TchError> {
    let scaled = preprocess::scale_hwc(image, settings.input_size);
    let input = if settings.channels_last {
        preprocess::batch_tensor(scaled)
    } else {
        preprocess::batch_tensor(scaled.permuted_axes([2, 0, 1]))
    };
    debug!("Classifier input shape {:?}", input.size());

    let output = model.forward(&input)?;
    let output = if settings.apply_softmax {
        output.softmax(-1, Kind::Float)
    } else {
        output
    };
    preprocess::flatten_probabilities(&output)
}

async fn run_stage<T, F>(stage: F) -> Result<T, String>
where
    F: FnOnce() -> Result<T, TchError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(stage).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
        Err(e) => Err(e.to_string()),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "stage panicked".to_string()
    }
}
