//! Default `InferenceClient` adapter (§6 "External inference server").
//!
//! The exact wire protocol of the inference server is explicitly out of
//! scope — this adapter assumes the common convention of a `GET
//! /v1/models` endpoint returning `{"data":[{"id": "..."}]}` (the
//! OpenAI-compatible shape the teacher's provider adapters already speak),
//! and exists so the daemon is runnable against a real process without
//! requiring every deployment to supply its own `InferenceClient`.
//! Deployments targeting a different inference server swap this out for
//! their own implementation of the trait.

use std::time::Duration;

use async_trait::async_trait;
use sd_domain::agent::InferenceClient;
use sd_domain::error::{Error, Result};
use serde::Deserialize;

pub struct HttpInferenceClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn list_loaded_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/v1/models", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    Error::LmxConnectionRefused
                } else if e.is_timeout() {
                    Error::LmxTimeout
                } else {
                    Error::Other(format!("inference server request failed: {e}"))
                }
            })?;

        let parsed: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| Error::Other(format!("inference server returned malformed model list: {e}")))?;

        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}
