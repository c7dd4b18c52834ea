//! Ollama Client
//!
//! Secondary AI provider: a locally-hosted model, slower than the cloud
//! provider but independent of it. The router calls it unconditionally when
//! the primary fails, so `ask` must degrade to an `Err`, not hang or panic.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, RouterError};
use crate::provider::{Provider, ProviderStatus};

const TAGS_TIMEOUT: Duration = Duration::from_secs(5);

/// Ollama local model client
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Debug, Deserialize)]
struct ModelTag {
    name: String,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.ollama_url, &config.ollama_model, config.ollama_timeout)
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);

        debug!("Calling Ollama: model={}, prompt_len={}", self.model, prompt.len());

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&serde_json::json!({
                "model": self.model,
                "prompt": prompt,
                "stream": false,
                "options": {
                    "temperature": 0.7,
                    "top_p": 0.9,
                    "top_k": 40
                }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(RouterError::ProviderCall(format!("ollama HTTP {status}")));
        }

        let result: GenerateResponse = response.json().await?;
        let text = result.response.trim().to_string();
        if text.is_empty() {
            return Err(RouterError::ProviderCall(
                "ollama returned empty response".to_string(),
            ));
        }
        Ok(text)
    }

    /// List locally installed models.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(TAGS_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RouterError::ProviderCall(format!(
                "ollama tags HTTP {}",
                response.status()
            )));
        }
        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Whether the configured model is installed (`:latest` tolerated).
    pub async fn is_model_installed(&self) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|name| {
                name == &self.model
                    || name == &format!("{}:latest", self.model)
                    || name.trim_end_matches(":latest") == self.model
            }),
            Err(e) => {
                warn!("Ollama model listing failed: {}", e);
                false
            }
        }
    }
}

#[async_trait]
impl Provider for OllamaClient {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self.client.get(&url).timeout(TAGS_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        self.generate(prompt).await
    }

    async fn status(&self) -> ProviderStatus {
        if !self.is_available().await {
            return ProviderStatus::unavailable(
                "Ollama service not running (start with: ollama serve)",
            );
        }
        if !self.is_model_installed().await {
            let mut status = ProviderStatus::error(&format!(
                "model '{}' not found (install with: ollama pull {})",
                self.model, self.model
            ));
            status.status = "model_missing".to_string();
            return status;
        }
        let mut status = ProviderStatus::available("service running with model installed");
        status.model = Some(self.model.clone());
        status
    }
}
