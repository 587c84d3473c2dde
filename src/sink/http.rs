//! Registry webhook client.
//!
//! Endpoint: POST {url} with the completion notification as JSON
//! Auth: Bearer token (optional)

use std::time::Duration;

use async_trait::async_trait;

use super::{RegistrySink, SinkError};
use crate::domain::CompletionNotification;

pub struct HttpRegistrySink {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRegistrySink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RegistrySink for HttpRegistrySink {
    fn name(&self) -> &str {
        "http"
    }

    async fn deliver(&self, notification: &CompletionNotification) -> Result<(), SinkError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(notification);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected { status, body });
        }

        Ok(())
    }
}
