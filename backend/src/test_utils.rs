//! In-memory doubles shared by the unit and handler tests.

use async_trait::async_trait;
use chrono::NaiveDate;
use image::{ImageFormat, Rgb, RgbImage};
use retina_shared::PredictionResult;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tch::{TchError, Tensor};

use crate::config::ModelsConfig;
use crate::db::models::{Gender, NewPatient, Patient, Report};
use crate::db::{PatientStore, ReportStore, RepositoryError};
use crate::inference::loader::ModelMaterializer;
use crate::inference::{ImageModel, ModelKind};
use crate::report::{ReportError, ReportGenerator, ReportSections};
use crate::storage::s3_service::S3Service;
use crate::storage::{BlobStore, ImageStore, StorageError};

pub fn test_models_config() -> ModelsConfig {
    ModelsConfig {
        enhancement_key: "test/enhancer.ot".to_string(),
        classification_key: "test/classifier.pt".to_string(),
    }
}

/// Blob store that counts every `get` per key.
#[derive(Default)]
pub struct CountingBlobStore {
    objects: HashMap<String, Vec<u8>>,
    fetches: Mutex<HashMap<String, usize>>,
    failures_left: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingBlobStore {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_models() -> Self {
        let models = test_models_config();
        Self::empty()
            .with_object(&models.enhancement_key, b"enhancer weights".to_vec())
            .with_object(&models.classification_key, b"classifier weights".to_vec())
    }

    pub fn with_object(mut self, key: &str, bytes: Vec<u8>) -> Self {
        self.objects.insert(key.to_string(), bytes);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `n` fetches fail with a transport error.
    pub fn failing_first(self, n: usize) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn fetches(&self, key: &str) -> usize {
        self.fetches.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> usize {
        self.fetches.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl BlobStore for CountingBlobStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        *self.fetches.lock().unwrap().entry(key.to_string()).or_default() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::S3("connection reset".to_string()));
        }

        self.objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

struct IdentityEnhancer;

impl ImageModel for IdentityEnhancer {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TchError> {
        Ok(input.shallow_clone())
    }
}

struct FixedClassifier(Vec<f32>);

impl ImageModel for FixedClassifier {
    fn forward(&self, _input: &Tensor) -> Result<Tensor, TchError> {
        Ok(Tensor::from_slice(&self.0).view([1, self.0.len() as i64]))
    }
}

pub enum FailingModel {
    Error,
    Panic,
}

impl ImageModel for FailingModel {
    fn forward(&self, _input: &Tensor) -> Result<Tensor, TchError> {
        match self {
            FailingModel::Error => Err(TchError::Torch("out of memory".to_string())),
            FailingModel::Panic => panic!("generator exploded"),
        }
    }
}

/// Builds stand-in models without touching libtorch serialization.
/// Blobs equal to `b"corrupt"` fail to load.
pub struct StubMaterializer {
    classifier_output: Vec<f32>,
    enhancer: Option<Arc<dyn ImageModel>>,
}

impl StubMaterializer {
    pub fn new(probabilities: [f32; 5]) -> Self {
        Self::with_classifier_output(probabilities.to_vec())
    }

    pub fn with_classifier_output(output: Vec<f32>) -> Self {
        Self {
            classifier_output: output,
            enhancer: None,
        }
    }

    pub fn with_enhancer(mut self, enhancer: Arc<dyn ImageModel>) -> Self {
        self.enhancer = Some(enhancer);
        self
    }
}

impl ModelMaterializer for StubMaterializer {
    fn materialize(&self, kind: ModelKind, bytes: &[u8]) -> Result<Arc<dyn ImageModel>, String> {
        if bytes == b"corrupt" {
            return Err(format!("{} weights are corrupt", kind));
        }
        Ok(match kind {
            ModelKind::Enhancement => match &self.enhancer {
                Some(enhancer) => Arc::clone(enhancer),
                None => Arc::new(IdentityEnhancer),
            },
            ModelKind::Classification => Arc::new(FixedClassifier(self.classifier_output.clone())),
        })
    }
}

/// A dark frame with a reddish disc, roughly the look of a fundus photograph.
pub fn synthetic_fundus_png(width: u32, height: u32) -> Vec<u8> {
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let radius = cx.min(cy) * 0.9;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let distance = ((x as f32 - cx).powi(2) + (y as f32 - cy).powi(2)).sqrt();
        if distance > radius {
            Rgb([0, 0, 0])
        } else {
            let falloff = 1.0 - distance / radius;
            Rgb([
                (120.0 + 100.0 * falloff) as u8,
                (40.0 + 60.0 * falloff) as u8,
                (20.0 + 20.0 * falloff) as u8,
            ])
        }
    });

    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn sample_new_patient(patient_id: &str) -> NewPatient {
    NewPatient {
        patient_name: "Grace Hopper".to_string(),
        patient_id: patient_id.to_string(),
        date_of_birth: NaiveDate::from_ymd_opt(1956, 12, 9).unwrap(),
        gender: Gender::Female,
        vision_problems: None,
        visual_acuity_right: 0.7,
        visual_acuity_left: 0.5,
        blood_sugar_fasting: Some(142.0),
        blood_pressure: Some("140/90".to_string()),
    }
}

pub fn sample_patient(patient_id: &str) -> Patient {
    Patient::from_new(sample_new_patient(patient_id))
}

#[derive(Default)]
pub struct InMemoryPatientStore {
    patients: Mutex<HashMap<String, Patient>>,
    reject_writes: bool,
}

impl InMemoryPatientStore {
    pub fn with_patient(patient: Patient) -> Self {
        let store = Self::default();
        store
            .patients
            .lock()
            .unwrap()
            .insert(patient.patient_id.clone(), patient);
        store
    }

    /// Updates fail as if the table were unreachable; reads still work.
    pub fn rejecting_writes(mut self) -> Self {
        self.reject_writes = true;
        self
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.reject_writes {
            return Err(RepositoryError::DynamoDb("throughput exceeded".to_string()));
        }
        Ok(())
    }

    pub fn patient(&self, patient_id: &str) -> Option<Patient> {
        self.patients.lock().unwrap().get(patient_id).cloned()
    }
}

#[async_trait]
impl PatientStore for InMemoryPatientStore {
    async fn create_patient(&self, patient: &Patient) -> Result<(), RepositoryError> {
        let mut patients = self.patients.lock().unwrap();
        if patients.contains_key(&patient.patient_id) {
            return Err(RepositoryError::AlreadyExists);
        }
        patients.insert(patient.patient_id.clone(), patient.clone());
        Ok(())
    }

    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>, RepositoryError> {
        Ok(self.patient(patient_id))
    }

    async fn update_image_url(&self, patient_id: &str, image_url: &str) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut patients = self.patients.lock().unwrap();
        let patient = patients.get_mut(patient_id).ok_or(RepositoryError::NotFound)?;
        patient.image_url = Some(image_url.to_string());
        Ok(())
    }

    async fn update_prediction(
        &self,
        patient_id: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut patients = self.patients.lock().unwrap();
        let patient = patients.get_mut(patient_id).ok_or(RepositoryError::NotFound)?;
        patient.prediction = Some(prediction.clone());
        Ok(())
    }

    async fn record_upload(
        &self,
        patient_id: &str,
        image_url: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut patients = self.patients.lock().unwrap();
        let patient = patients.get_mut(patient_id).ok_or(RepositoryError::NotFound)?;
        patient.image_url = Some(image_url.to_string());
        patient.prediction = Some(prediction.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryReportStore {
    reports: Mutex<Vec<Report>>,
}

impl InMemoryReportStore {
    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn create_report(&self, report: &Report) -> Result<(), RepositoryError> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<Report>, RepositoryError> {
        Ok(self
            .reports
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.report_id == report_id)
            .cloned())
    }

    async fn list_reports(&self) -> Result<Vec<Report>, RepositoryError> {
        Ok(self.reports.lock().unwrap().clone())
    }
}

/// Keeps uploads in memory under the same key layout as the S3 store.
#[derive(Default)]
pub struct InMemoryImageStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryImageStore {
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageStore for InMemoryImageStore {
    async fn store_image(
        &self,
        patient_id: &str,
        image_data: &[u8],
        mime_type: &str,
    ) -> Result<String, StorageError> {
        S3Service::validate_image_size(image_data)?;
        let extension = S3Service::extract_file_extension(mime_type)?;
        let hash = S3Service::calculate_image_hash(image_data);
        let key = S3Service::generate_s3_key(patient_id, &hash, extension);
        self.objects
            .lock()
            .unwrap()
            .insert(key.clone(), image_data.to_vec());
        Ok(format!("memory://{}", key))
    }
}

pub struct StubReportGenerator {
    fail: bool,
    calls: AtomicUsize,
}

impl StubReportGenerator {
    pub fn new() -> Self {
        Self {
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReportGenerator for StubReportGenerator {
    async fn generate(
        &self,
        patient: &Patient,
        prediction: &PredictionResult,
    ) -> Result<ReportSections, ReportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ReportError::Api("429 Too Many Requests".to_string()));
        }
        Ok(ReportSections {
            patient_medical_assessment: format!("Assessment for {}", patient.patient_name),
            dr_status_analysis: format!("{} screening", prediction.dr_status),
            classification_details: prediction.severity_level.to_string(),
            follow_up_plan: "Re-screen in 12 months".to_string(),
            ..ReportSections::default()
        })
    }
}
