//! Image blob store adapters
//!
//! `upload_image` turns raw bytes into a durable URL. A failure affects only
//! the one image; the stage tracker retries and reports it.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::models::StageName;

const USER_AGENT: &str = concat!("agp-verify/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Store rejected image ({0}): {1}")]
    Rejected(u16, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Upload timed out after {0:?}")]
    Timeout(Duration),
}

/// One image as submitted by the farmer
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Ownership metadata stored with every image
#[derive(Debug, Clone)]
pub struct UploadContext {
    pub farmer_id: String,
    pub batch_id: Uuid,
    pub stage: StageName,
}

#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn upload_image(&self, image: &ImageUpload, context: &UploadContext) -> Result<String, StorageError>;
}

/// Stores images under `<root>/images/<batch_id>/<stage>/` and returns `file://` URLs
pub struct LocalImageStore {
    images_dir: PathBuf,
}

impl LocalImageStore {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }
}

/// Extension of the submitted file name, restricted to ASCII alphanumerics
fn safe_extension(file_name: &str) -> Option<String> {
    let ext = file_name.rsplit_once('.')?.1.to_ascii_lowercase();
    (!ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric())).then_some(ext)
}

#[async_trait]
impl ImageStore for LocalImageStore {
    async fn upload_image(&self, image: &ImageUpload, context: &UploadContext) -> Result<String, StorageError> {
        let dir = self
            .images_dir
            .join(context.batch_id.to_string())
            .join(context.stage.as_str().to_ascii_lowercase());
        tokio::fs::create_dir_all(&dir).await?;

        let name = match safe_extension(&image.file_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = dir.join(name);
        tokio::fs::write(&path, &image.bytes).await?;

        tracing::debug!(path = %path.display(), bytes = image.bytes.len(), "Stored image locally");
        Ok(format!("file://{}", path.display()))
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: String,
}

/// HTTP client for a remote blob store
///
/// Sends the raw bytes to `POST {base_url}/images` with the ownership
/// metadata as query parameters; expects `{"url": "..."}` back.
pub struct HttpImageStore {
    http_client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpImageStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, StorageError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| StorageError::NetworkError(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl ImageStore for HttpImageStore {
    async fn upload_image(&self, image: &ImageUpload, context: &UploadContext) -> Result<String, StorageError> {
        let batch_id = context.batch_id.to_string();
        let params = [
            ("farmer_id", context.farmer_id.as_str()),
            ("batch_id", batch_id.as_str()),
            ("stage", context.stage.as_str()),
            ("file_name", image.file_name.as_str()),
        ];

        let response = self
            .http_client
            .post(format!("{}/images", self.base_url))
            .query(&params)
            .header(
                reqwest::header::CONTENT_TYPE,
                image.content_type.as_deref().unwrap_or("application/octet-stream"),
            )
            .body(image.bytes.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    StorageError::Timeout(self.timeout)
                } else {
                    StorageError::NetworkError(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(StorageError::Rejected(status.as_u16(), error_text));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| StorageError::ParseError(e.to_string()))?;

        Ok(body.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_safe_extension() {
        assert_eq!(safe_extension("field.JPG").as_deref(), Some("jpg"));
        assert_eq!(safe_extension("../../etc/passwd"), None);
        assert_eq!(safe_extension("noext"), None);
        assert_eq!(safe_extension("weird.j/g"), None);
    }

    #[tokio::test]
    async fn test_local_store_writes_under_batch_and_stage() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalImageStore::new(temp_dir.path().join("images"));
        let context = UploadContext {
            farmer_id: "farmer-1".to_string(),
            batch_id: Uuid::new_v4(),
            stage: StageName::PostHarvest,
        };
        let image = ImageUpload {
            file_name: "bags.png".to_string(),
            content_type: Some("image/png".to_string()),
            bytes: vec![1, 2, 3],
        };

        let url = store.upload_image(&image, &context).await.unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with(".png"));
        assert!(url.contains("post_harvest"));

        let path = url.trim_start_matches("file://");
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);

        // Same image twice gets two distinct URLs
        let second = store.upload_image(&image, &context).await.unwrap();
        assert_ne!(url, second);
    }
}
