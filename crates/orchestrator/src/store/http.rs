//! Credential-less HTTP read path (consumer side).
//!
//! The bucket policy admits the consumer by network origin, so requests
//! carry no signature. `HEAD` supplies the entity tag and last-modified
//! time used for change detection; `GET` fetches bodies.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use radcert_common::{ArtifactKind, ArtifactMetadata};
use reqwest::header::{ETAG, LAST_MODIFIED};
use reqwest::{Client, StatusCode};
use tracing::{debug, trace};
use url::Url;

use super::{object_key, ArtifactSource, StoreError};

/// Read-only artifact source over plain HTTP(S)
#[derive(Debug, Clone)]
pub struct HttpArtifactSource {
    client: Client,
    base_url: Url,
    prefix: String,
}

impl HttpArtifactSource {
    /// Create a source rooted at `base_url`, bounding every request by `timeout`
    pub fn new(base_url: &str, prefix: String, timeout: Duration) -> Result<Self, StoreError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| StoreError::Config(format!("invalid base URL {}: {}", base_url, e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        debug!(base_url = %base_url, prefix = %prefix, "Configured HTTP artifact source");

        Ok(Self {
            client,
            base_url,
            prefix,
        })
    }

    fn url(&self, kind: ArtifactKind) -> Result<Url, StoreError> {
        self.base_url
            .join(&object_key(&self.prefix, kind))
            .map_err(|e| StoreError::Config(e.to_string()))
    }

    async fn send(
        &self,
        kind: ArtifactKind,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, StoreError> {
        let response = request.send().await.map_err(|e| transport_error(kind, e))?;
        check_status(kind, response.status())?;
        Ok(response)
    }
}

fn transport_error(kind: ArtifactKind, err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout {
            operation: format!("fetch {}", kind),
        }
    } else {
        StoreError::Transport(err.to_string())
    }
}

fn check_status(kind: ArtifactKind, status: StatusCode) -> Result<(), StoreError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound { kind }),
        StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => Err(StoreError::Forbidden {
            kind,
            message: format!("HTTP {}", status.as_u16()),
        }),
        s => Err(StoreError::Status {
            kind,
            status: s.as_u16(),
        }),
    }
}

fn parse_last_modified(value: &str) -> Option<DateTime<Utc>> {
    httpdate::parse_http_date(value).ok().map(DateTime::<Utc>::from)
}

#[async_trait]
impl ArtifactSource for HttpArtifactSource {
    async fn head_metadata(&self, kind: ArtifactKind) -> Result<ArtifactMetadata, StoreError> {
        let url = self.url(kind)?;
        let response = self.send(kind, self.client.head(url.clone())).await?;

        let headers = response.headers();
        let etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(StoreError::MissingMetadata { kind })?;
        let last_modified = headers
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_last_modified);

        trace!(url = %url, etag = %etag, "Fetched artifact metadata");
        Ok(ArtifactMetadata::new(etag, last_modified))
    }

    async fn get(&self, kind: ArtifactKind) -> Result<Bytes, StoreError> {
        let url = self.url(kind)?;
        let response = self.send(kind, self.client.get(url.clone())).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(kind, e))?;

        debug!(url = %url, bytes = body.len(), "Fetched artifact");
        Ok(body)
    }
}
