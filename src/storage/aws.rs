//! AWS S3 blob store.
//!
//! Grants are SigV4 presigned requests produced by the SDK; the service
//! itself only issues control-plane calls (create/complete/abort a
//! multipart upload, delete an object).
//!
//! Key mapping: `{prefix}{storage_key}`
//!
//! Credentials are resolved via the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.) unless explicit
//! keys are configured.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tracing::debug;

use super::backend::{BlobStore, CompleteOutcome};
use crate::config::AwsStorageConfig;

/// Blob store backed by a single S3 bucket.
pub struct S3BlobStore {
    /// AWS S3 SDK client.
    client: Client,
    /// Bucket clients upload into.
    bucket: String,
    /// Key prefix for all objects in the bucket.
    prefix: String,
}

impl S3BlobStore {
    /// Create a new S3 blob store from its config section.
    pub async fn new(config: &AwsStorageConfig) -> anyhow::Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if !config.endpoint_url.is_empty() {
            config_loader = config_loader.endpoint_url(&config.endpoint_url);
        }

        // If explicit credentials are provided, inject them as static credentials.
        if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let creds = aws_sdk_s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None, // session_token
                None, // expiry
                "dropvault-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
        })
    }

    /// Map a storage key to the key inside the bucket.
    fn s3_key(&self, storage_key: &str) -> String {
        format!("{}{}", self.prefix, storage_key)
    }

    /// HEAD the bucket key. `Ok(false)` when the object is missing.
    async fn head_object(&self, s3_key: &str) -> anyhow::Result<bool> {
        debug!("AWS head_object: bucket={} key={}", self.bucket, s3_key);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(s3_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(Self::map_sdk_error("head_object", service_err))
                }
            }
        }
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }

    fn presigning(ttl: Duration) -> anyhow::Result<PresigningConfig> {
        PresigningConfig::expires_in(ttl).map_err(|e| Self::map_sdk_error("presigning config", e))
    }
}

impl BlobStore for S3BlobStore {
    fn put_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            let presigned = self
                .client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .presigned(Self::presigning(ttl)?)
                .await
                .map_err(|e| Self::map_sdk_error("presign put_object", e))?;
            Ok(presigned.uri().to_string())
        })
    }

    fn get_object_grant(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            let presigned = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .presigned(Self::presigning(ttl)?)
                .await
                .map_err(|e| Self::map_sdk_error("presign get_object", e))?;
            Ok(presigned.uri().to_string())
        })
    }

    fn create_multipart_session(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            debug!(
                "AWS create_multipart_upload: bucket={} key={}",
                self.bucket, s3_key
            );

            let resp = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("create_multipart_upload", e))?;

            resp.upload_id()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("AWS S3 create_multipart_upload: no upload id"))
        })
    }

    fn put_part_grant(
        &self,
        key: &str,
        session_id: &str,
        part_number: u32,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        let session_id = session_id.to_string();
        Box::pin(async move {
            let presigned = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&session_id)
                .part_number(part_number as i32)
                .presigned(Self::presigning(ttl)?)
                .await
                .map_err(|e| Self::map_sdk_error("presign upload_part", e))?;
            Ok(presigned.uri().to_string())
        })
    }

    fn complete_multipart_session(
        &self,
        key: &str,
        session_id: &str,
        parts: Vec<(u32, String)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CompleteOutcome>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        let session_id = session_id.to_string();
        Box::pin(async move {
            debug!(
                "AWS complete_multipart_upload: key={} upload_id={} parts={}",
                s3_key,
                session_id,
                parts.len()
            );

            let completed_parts = parts
                .iter()
                .map(|(part_number, etag)| {
                    CompletedPart::builder()
                        .e_tag(etag)
                        .part_number(*part_number as i32)
                        .build()
                })
                .collect::<Vec<_>>();

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(completed_parts))
                .build();

            match self
                .client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&session_id)
                .multipart_upload(completed_upload)
                .send()
                .await
            {
                Ok(_) => Ok(CompleteOutcome::Completed),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.meta().code() != Some("NoSuchUpload") {
                        return Err(Self::map_sdk_error("complete_multipart_upload", service_err));
                    }
                    // Aborted and expired sessions answer NoSuchUpload too;
                    // only the object tells them apart from a merged one.
                    if self.head_object(&s3_key).await? {
                        debug!(
                            "AWS complete_multipart_upload: upload_id={} already merged",
                            session_id
                        );
                        Ok(CompleteOutcome::AlreadyCompleted)
                    } else {
                        Err(anyhow::anyhow!(
                            "AWS S3 complete_multipart_upload: upload {session_id} no longer \
                             exists and {s3_key} was never written"
                        ))
                    }
                }
            }
        })
    }

    fn abort_multipart_session(
        &self,
        key: &str,
        session_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        let session_id = session_id.to_string();
        Box::pin(async move {
            debug!(
                "AWS abort_multipart_upload: key={} upload_id={}",
                s3_key, session_id
            );

            match self
                .client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&s3_key)
                .upload_id(&session_id)
                .send()
                .await
            {
                Ok(_) => Ok(()),
                Err(e) => {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_upload() {
                        Ok(())
                    } else {
                        Err(Self::map_sdk_error("abort_multipart_upload", service_err))
                    }
                }
            }
        })
    }

    fn object_exists(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        Box::pin(async move { self.head_object(&s3_key).await })
    }

    fn delete_object(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let s3_key = self.s3_key(key);
        Box::pin(async move {
            debug!("AWS delete_object: bucket={} key={}", self.bucket, s3_key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e))?;

            Ok(())
        })
    }
}

// -- Tests -------------------------------------------------------------------
