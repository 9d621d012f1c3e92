//! Object storage uploads for image attachments.

use chat_core::{ChatError, ImageAttachment, attachment_extension};
use reqwest::Client;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::http::{SupabaseConfig, authorize, check_status, map_reqwest_error};

pub const DEFAULT_IMAGE_BUCKET: &str = "message-images";

#[derive(Debug, Clone)]
pub struct StorageApi {
    http: Client,
    config: SupabaseConfig,
}

impl StorageApi {
    pub fn new(http: Client, config: SupabaseConfig) -> Self {
        Self { http, config }
    }

    /// Upload under a fresh `<uuid>.<ext>` name and return its public URL.
    pub async fn upload_image(
        &self,
        bucket: &str,
        attachment: &ImageAttachment,
        access_token: Option<&str>,
    ) -> Result<String, ChatError> {
        let object_path = object_path_for(attachment);
        let url = self
            .config
            .endpoint(&format!("storage/v1/object/{bucket}/{object_path}"))?;

        let response = authorize(self.http.post(url), &self.config, access_token)
            .header(reqwest::header::CONTENT_TYPE, &attachment.content_type)
            .header("x-upsert", "false")
            .body(attachment.data.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;
        check_status(response).await?;

        let public = public_url(&self.config, bucket, &object_path)?;
        info!(bucket, object_path, bytes = attachment.data.len(), "image uploaded");
        Ok(public.to_string())
    }
}

pub(crate) fn object_path_for(attachment: &ImageAttachment) -> String {
    format!(
        "{}.{}",
        Uuid::new_v4(),
        attachment_extension(&attachment.file_name, &attachment.content_type)
    )
}

pub fn public_url(config: &SupabaseConfig, bucket: &str, object_path: &str) -> Result<Url, ChatError> {
    config.endpoint(&format!("storage/v1/object/public/{bucket}/{object_path}"))
}
