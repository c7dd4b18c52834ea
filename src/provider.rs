//! Provider seam
//!
//! Both AI clients share one contract so the router can walk a priority
//! chain without knowing transports. A failed call is an ordinary `Err`,
//! never a panic: the router must always be able to advance to the next
//! provider.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Diagnostic status for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatus {
    pub status: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl ProviderStatus {
    pub fn available(reason: &str) -> Self {
        Self {
            status: "available".to_string(),
            reason: reason.to_string(),
            model: None,
        }
    }

    pub fn unavailable(reason: &str) -> Self {
        Self {
            status: "unavailable".to_string(),
            reason: reason.to_string(),
            model: None,
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            status: "error".to_string(),
            reason: reason.to_string(),
            model: None,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap reachability/config probe.
    async fn is_available(&self) -> bool;

    /// Send an enriched prompt, return the extracted answer text.
    async fn ask(&self, prompt: &str) -> Result<String>;

    /// Richer diagnostic for the status API.
    async fn status(&self) -> ProviderStatus;
}
