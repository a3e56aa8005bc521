use async_trait::async_trait;
use aws_sdk_s3::{error::DisplayErrorContext, Client};
use tracing::{debug, info, instrument};

use super::{ObjectBody, ObjectEntry, ObjectStore};
use crate::config::StagingConfig;
use crate::error::{MigrateError, Result};

#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    pub fn new(sdk_config: &aws_config::SdkConfig, config: &StagingConfig) -> Self {
        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config);

        // MinIO and other S3-compatible endpoints need path-style addressing
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Storage {
    #[instrument(skip(self))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        debug!("Listing objects in s3://{}/{}", self.bucket, prefix);

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    MigrateError::object_store(format!(
                        "Failed to list s3://{}/{}: {}",
                        self.bucket,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            entries.extend(response.contents().iter().filter_map(|obj| {
                obj.key().map(|key| ObjectEntry {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0),
                    e_tag: obj.e_tag().map(|t| t.to_string()),
                })
            }));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        debug!("Listed {} objects under s3://{}/{}", entries.len(), self.bucket, prefix);
        Ok(entries)
    }

    #[instrument(skip(self))]
    async fn get_object(&self, key: &str) -> Result<ObjectBody> {
        debug!("Getting stream from s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                MigrateError::object_store(format!(
                    "Failed to download s3://{}/{}: {}",
                    self.bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(Box::pin(response.body.into_async_read()))
    }
}
