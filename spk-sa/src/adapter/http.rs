//! HTTP implementation of the ML adapter
//!
//! `POST {base_url}/analyze/{stage}` with the session context as JSON body;
//! `GET {base_url}/health` for reachability.

use async_trait::async_trait;
use serde_json::Value;
use spk_common::events::StageName;
use std::time::Duration;
use tracing::debug;

use super::{AdapterError, MlAdapter, SessionContext};

pub struct HttpMlAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMlAdapter {
    /// Create adapter; `connect_timeout` bounds connection setup only, stage timeouts are
    /// applied by the orchestrator
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("spk-sa/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AdapterError::Unavailable(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stage_url(&self, stage: StageName) -> String {
        format!("{}/analyze/{}", self.base_url, stage)
    }
}

fn transport_error(e: reqwest::Error) -> AdapterError {
    if e.is_connect() || e.is_timeout() {
        AdapterError::Unavailable(e.to_string())
    } else {
        AdapterError::Failed(e.to_string())
    }
}

#[async_trait]
impl MlAdapter for HttpMlAdapter {
    async fn invoke(&self, stage: StageName, context: &SessionContext) -> Result<Value, AdapterError> {
        let url = self.stage_url(stage);
        debug!(session_id = %context.session_id, stage = %stage, url = %url, "Invoking ML stage");

        let response = self
            .client
            .post(&url)
            .json(context)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = if body.is_empty() {
                status.to_string()
            } else {
                format!("{}: {}", status, body.chars().take(200).collect::<String>())
            };
            return Err(AdapterError::Failed(detail));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::InvalidResponse(e.to_string()))?;

        if payload.is_null() {
            return Err(AdapterError::InvalidResponse("empty payload".to_string()));
        }
        Ok(payload)
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AdapterError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Unavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }
}
