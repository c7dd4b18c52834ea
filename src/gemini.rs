//! Gemini API Client
//!
//! Primary AI provider. Availability is a config check (key present);
//! transport errors, non-200 responses, and missing payload fields are all
//! ordinary failures that hand control to the fallback chain.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, RouterError};
use crate::provider::{Provider, ProviderStatus};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Gemini API client
#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(rename = "safetySettings")]
    safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topK")]
    top_k: u32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SafetySetting {
    category: &'static str,
    threshold: &'static str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

impl GeminiClient {
    pub fn new(api_key: Option<&str>, model: &str, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.map(|s| s.to_string()),
            model: model.to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.gemini_api_key.as_deref(),
            &config.gemini_model,
            config.gemini_timeout,
        )
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(RouterError::ProviderUnavailable("gemini"))?;

        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: Some(prompt.to_string()),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.7,
                top_k: 40,
                top_p: 0.95,
                max_output_tokens: 1024,
            },
            safety_settings: vec![
                SafetySetting {
                    category: "HARM_CATEGORY_HARASSMENT",
                    threshold: "BLOCK_MEDIUM_AND_ABOVE",
                },
                SafetySetting {
                    category: "HARM_CATEGORY_HATE_SPEECH",
                    threshold: "BLOCK_MEDIUM_AND_ABOVE",
                },
            ],
        };

        let url = format!(
            "{GEMINI_BASE_URL}/{}:generateContent?key={api_key}",
            self.model
        );

        debug!("Calling Gemini: model={}, prompt_len={}", self.model, prompt.len());

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::ProviderCall(format!(
                "gemini HTTP {status}: {body}"
            )));
        }

        let result: GenerateResponse = response.json().await?;

        let text = result
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|c| c.parts.into_iter().next())
            .and_then(|p| p.text)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                RouterError::ProviderCall("gemini returned no response text".to_string())
            })?;

        Ok(text)
    }
}

#[async_trait]
impl Provider for GeminiClient {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn ask(&self, prompt: &str) -> Result<String> {
        self.generate(prompt).await
    }

    async fn status(&self) -> ProviderStatus {
        if self.api_key.is_none() {
            return ProviderStatus::unavailable("API key not configured");
        }
        // Synthetic round-trip: the key being present says nothing about
        // quota or reachability.
        match self.generate("Hello").await {
            Ok(_) => {
                let mut status = ProviderStatus::available("API responding normally");
                status.model = Some(self.model.clone());
                status
            }
            Err(e) => {
                warn!("Gemini status probe failed: {}", e);
                ProviderStatus::error("API not responding")
            }
        }
    }
}
