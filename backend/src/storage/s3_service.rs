use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use sha2::{Digest, Sha256};

use super::{BlobStore, ImageStore, StorageError};

pub const MAX_IMAGE_SIZE: usize = 50 * 1024 * 1024;

#[derive(Clone)]
pub struct S3Service {
    client: Client,
    bucket_name: String,
}

impl S3Service {
    pub fn new(client: Client, bucket_name: String) -> Self {
        Self {
            client,
            bucket_name,
        }
    }

    pub fn calculate_image_hash(image_data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(image_data);
        hex::encode(hasher.finalize())
    }

    pub fn generate_s3_key(patient_id: &str, image_hash: &str, file_extension: &str) -> String {
        format!("retinal_images/{}/{}.{}", patient_id, image_hash, file_extension)
    }

    pub fn extract_file_extension(mime_type: &str) -> Result<&'static str, StorageError> {
        match mime_type {
            "image/jpeg" | "image/jpg" => Ok("jpg"),
            "image/png" => Ok("png"),
            "image/webp" => Ok("webp"),
            "image/tiff" => Ok("tiff"),
            "image/bmp" => Ok("bmp"),
            _ => Err(StorageError::InvalidFormat),
        }
    }

    pub fn validate_image_size(image_data: &[u8]) -> Result<(), StorageError> {
        if image_data.len() > MAX_IMAGE_SIZE {
            return Err(StorageError::FileTooLarge);
        }
        Ok(())
    }

    pub fn object_url(&self, s3_key: &str) -> String {
        format!("s3://{}/{}", self.bucket_name, s3_key)
    }

    pub async fn upload_object(
        &self,
        data: &[u8],
        s3_key: &str,
        mime_type: &str,
    ) -> Result<(), StorageError> {
        let body = ByteStream::from(data.to_vec());

        self.client
            .put_object()
            .bucket(&self.bucket_name)
            .key(s3_key)
            .body(body)
            .content_type(mime_type)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(())
    }

    pub async fn get_object(&self, s3_key: &str) -> Result<Vec<u8>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket_name)
            .key(s3_key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    StorageError::NotFound(s3_key.to_string())
                } else {
                    StorageError::S3(service_error.to_string())
                }
            })?;

        let body = result
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }
}

#[async_trait]
impl BlobStore for S3Service {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        log::debug!("Downloading s3://{}/{}", self.bucket_name, key);
        let bytes = self.get_object(key).await?;
        log::debug!("Downloaded {} bytes from {}", bytes.len(), key);
        Ok(bytes)
    }
}

#[async_trait]
impl ImageStore for S3Service {
    async fn store_image(
        &self,
        patient_id: &str,
        image_data: &[u8],
        mime_type: &str,
    ) -> Result<String, StorageError> {
        S3Service::validate_image_size(image_data)?;
        let file_extension = S3Service::extract_file_extension(mime_type)?;
        let image_hash = S3Service::calculate_image_hash(image_data);
        let s3_key = S3Service::generate_s3_key(patient_id, &image_hash, file_extension);

        self.upload_object(image_data, &s3_key, mime_type).await?;
        log::info!("Stored retinal image for patient {} at {}", patient_id, s3_key);
        Ok(self.object_url(&s3_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_content_addressed_per_patient() {
        let hash = S3Service::calculate_image_hash(b"fundus");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, S3Service::calculate_image_hash(b"fundus"));
        assert_eq!(
            S3Service::generate_s3_key("p-1", &hash, "png"),
            format!("retinal_images/p-1/{}.png", hash)
        );
    }

    #[test]
    fn only_raster_mime_types_are_accepted() {
        assert_eq!(S3Service::extract_file_extension("image/jpeg").unwrap(), "jpg");
        assert_eq!(S3Service::extract_file_extension("image/png").unwrap(), "png");
        assert!(matches!(
            S3Service::extract_file_extension("application/pdf"),
            Err(StorageError::InvalidFormat)
        ));
    }

    #[test]
    fn oversized_images_are_rejected() {
        assert!(S3Service::validate_image_size(&[0u8; 16]).is_ok());
        let oversized = vec![0u8; MAX_IMAGE_SIZE + 1];
        assert!(matches!(
            S3Service::validate_image_size(&oversized),
            Err(StorageError::FileTooLarge)
        ));
    }
}
