//! HTTP content store client (pinning-service style API).
//!
//! Upload: POST multipart `file` to `upload_url`, bearer token auth.
//! Verify: HEAD `{gateway_url}/{cid}`.
//! Pin: POST `{"cid": ...}` to `pin_url` when configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;

use super::{Artifact, ProviderError, StorageProvider};

/// HTTP storage provider
pub struct HttpStorageProvider {
    name: String,
    upload_url: String,
    gateway_url: String,
    pin_url: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

/// Upload response; accepts the field names common pinning services use
#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "IpfsHash", alias = "contentId", alias = "Hash")]
    cid: String,
}

impl HttpStorageProvider {
    /// Create a new client
    pub fn new(name: impl Into<String>, upload_url: impl Into<String>, gateway_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            upload_url: upload_url.into(),
            gateway_url: gateway_url.into(),
            pin_url: None,
            token: None,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_pin_url(mut self, pin_url: impl Into<String>) -> Self {
        self.pin_url = Some(pin_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn content_url(&self, content_id: &str) -> String {
        format!("{}/{}", self.gateway_url.trim_end_matches('/'), content_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn map_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout.as_secs())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

async fn status_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ProviderError::Status { status, body }
}

#[async_trait]
impl StorageProvider for HttpStorageProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, artifact: &Artifact) -> Result<String, ProviderError> {
        let part = Part::bytes(artifact.bytes.clone()).file_name(artifact.name.clone());
        let mut form = Form::new().part("file", part);

        if !artifact.metadata.is_empty() {
            let metadata = serde_json::to_string(&artifact.metadata)
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;
            form = form.text("metadata", metadata);
        }

        let request = self
            .client
            .post(&self.upload_url)
            .timeout(self.timeout)
            .multipart(form);

        let response = self.authorize(request).send().await.map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        if body.cid.trim().is_empty() {
            return Err(ProviderError::InvalidResponse("empty content id".to_string()));
        }

        Ok(body.cid)
    }

    async fn exists(&self, content_id: &str) -> Result<bool, ProviderError> {
        let request = self.client.head(self.content_url(content_id)).timeout(self.timeout);
        let response = self.authorize(request).send().await.map_err(|e| self.map_error(e))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn pin(&self, content_id: &str) -> Result<(), ProviderError> {
        let Some(pin_url) = &self.pin_url else {
            // Content is retained by the upload itself
            return Ok(());
        };

        let request = self
            .client
            .post(pin_url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "cid": content_id }));

        let response = self.authorize(request).send().await.map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}
