pub mod dynamodb_repository;
pub mod models;

use async_trait::async_trait;
use retina_shared::PredictionResult;

use models::{Patient, Report};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("DynamoDB error: {0}")]
    DynamoDb(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Item not found")]
    NotFound,
    #[error("Item already exists")]
    AlreadyExists,
    #[error("Invalid data format: {0}")]
    InvalidData(String),
}

#[async_trait]
pub trait PatientStore: Send + Sync {
    async fn create_patient(&self, patient: &Patient) -> Result<(), RepositoryError>;
    async fn get_patient(&self, patient_id: &str) -> Result<Option<Patient>, RepositoryError>;
    async fn update_image_url(&self, patient_id: &str, image_url: &str) -> Result<(), RepositoryError>;
    async fn update_prediction(
        &self,
        patient_id: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError>;
    /// Stores the image URL and its prediction together; a failure leaves both unset.
    async fn record_upload(
        &self,
        patient_id: &str,
        image_url: &str,
        prediction: &PredictionResult,
    ) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn create_report(&self, report: &Report) -> Result<(), RepositoryError>;
    async fn get_report(&self, report_id: &str) -> Result<Option<Report>, RepositoryError>;
    async fn list_reports(&self) -> Result<Vec<Report>, RepositoryError>;
}
