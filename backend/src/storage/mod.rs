pub mod s3_service;

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3(String),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid file format")]
    InvalidFormat,
    #[error("File too large")]
    FileTooLarge,
}

/// Read access to serialized model weights.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}

/// Durable storage for uploaded retinal photographs.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Stores the image and returns the URL recorded on the patient.
    async fn store_image(
        &self,
        patient_id: &str,
        image_data: &[u8],
        mime_type: &str,
    ) -> Result<String, StorageError>;
}
