//! S3 artifact store (issuer side).
//!
//! Holds write credentials through the standard AWS credential chain.
//! Every put requests server-side encryption.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::ServerSideEncryption;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use radcert_common::{ArtifactKind, ArtifactMetadata};
use radcert_config::{Encryption, StoreConfig};
use tracing::{debug, trace};

use super::{object_key, ArtifactSink, ArtifactSource, StoreError};

/// Artifact store backed by an S3 bucket
#[derive(Debug, Clone)]
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    prefix: String,
    encryption: ServerSideEncryption,
    kms_key_id: Option<String>,
    timeout: Duration,
}

impl S3ArtifactStore {
    /// Build a store from the shared AWS configuration and `[store]`
    pub fn from_config(
        sdk_config: &aws_config::SdkConfig,
        config: &StoreConfig,
        prefix: String,
    ) -> Result<Self, StoreError> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| StoreError::Config("store.bucket is not set".to_string()))?;

        let mut builder = aws_sdk_s3::config::Builder::from(sdk_config)
            .force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let encryption = match config.encryption {
            Encryption::Aes256 => ServerSideEncryption::Aes256,
            Encryption::AwsKms => ServerSideEncryption::AwsKms,
        };

        debug!(bucket = %bucket, prefix = %prefix, "Configured S3 artifact store");

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket,
            prefix,
            encryption,
            kms_key_id: config.kms_key_id.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn key(&self, kind: ArtifactKind) -> String {
        object_key(&self.prefix, kind)
    }

    async fn bounded<T, E, F>(&self, kind: ArtifactKind, operation: &str, call: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, SdkError<E>>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(sdk_error(kind, e)),
            Err(_) => Err(StoreError::Timeout {
                operation: format!("{} {}", operation, self.key(kind)),
            }),
        }
    }
}

fn sdk_error<E>(kind: ArtifactKind, err: SdkError<E>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    match status {
        Some(404) => StoreError::NotFound { kind },
        Some(401) | Some(403) => StoreError::Forbidden {
            kind,
            message: DisplayErrorContext(&err).to_string(),
        },
        Some(status) => StoreError::Status { kind, status },
        None => StoreError::Transport(DisplayErrorContext(&err).to_string()),
    }
}

fn to_chrono(ts: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts.secs(), ts.subsec_nanos())
}

#[async_trait]
impl ArtifactSource for S3ArtifactStore {
    async fn head_metadata(&self, kind: ArtifactKind) -> Result<ArtifactMetadata, StoreError> {
        let key = self.key(kind);
        let output = self
            .bounded(
                kind,
                "HEAD",
                self.client.head_object().bucket(&self.bucket).key(&key).send(),
            )
            .await?;

        let etag = output
            .e_tag()
            .map(str::to_string)
            .ok_or(StoreError::MissingMetadata { kind })?;
        trace!(key = %key, etag = %etag, "Fetched S3 object metadata");

        Ok(ArtifactMetadata::new(
            etag,
            output.last_modified().and_then(to_chrono),
        ))
    }

    async fn get(&self, kind: ArtifactKind) -> Result<Bytes, StoreError> {
        let key = self.key(kind);
        let output = self
            .bounded(
                kind,
                "GET",
                self.client.get_object().bucket(&self.bucket).key(&key).send(),
            )
            .await?;

        let body = tokio::time::timeout(self.timeout, output.body.collect())
            .await
            .map_err(|_| StoreError::Timeout {
                operation: format!("GET {} body", key),
            })?
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        Ok(body.into_bytes())
    }
}

#[async_trait]
impl ArtifactSink for S3ArtifactStore {
    async fn put(&self, kind: ArtifactKind, body: Bytes) -> Result<(), StoreError> {
        let key = self.key(kind);
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type("application/x-pem-file")
            .server_side_encryption(self.encryption.clone())
            .body(ByteStream::from(body));
        if let Some(kms_key_id) = &self.kms_key_id {
            request = request.ssekms_key_id(kms_key_id);
        }

        self.bounded(kind, "PUT", request.send()).await?;
        debug!(bucket = %self.bucket, key = %key, "Uploaded artifact");
        Ok(())
    }

    async fn delete(&self, kind: ArtifactKind) -> Result<(), StoreError> {
        let key = self.key(kind);
        match self
            .bounded(
                kind,
                "DELETE",
                self.client.delete_object().bucket(&self.bucket).key(&key).send(),
            )
            .await
        {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
