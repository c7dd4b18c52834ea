//! AI Router
//!
//! The orchestrator behind `/api/ask`: rate limit, conversation lookup,
//! cache lookup, then the provider fallback chain (primary, secondary,
//! canned). Persistence failures along the way degrade to warnings; the
//! only hard rule is that the caller always gets an answer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::cache::{CacheStats, CacheStore, ConnectionStatus};
use crate::conversation::ConversationStore;
use crate::provider::{Provider, ProviderStatus};

/// Baseline store knowledge injected ahead of every provider prompt.
const STORE_CONTEXT: &str = "\
You are a helpful AI assistant for GreenCart, an online grocery store.
GreenCart sells fresh produce, dairy, bakery goods, pantry staples and
household essentials, with same-day delivery in selected areas.
Answer questions about products, orders, delivery and the store itself.
Keep answers friendly, concise and on topic.";

/// Which layer produced the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cache,
    Primary,
    Secondary,
    Fallback,
    RateLimited,
    Error,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cache => "cache",
            Source::Primary => "primary",
            Source::Secondary => "secondary",
            Source::Fallback => "fallback",
            Source::RateLimited => "rate_limited",
            Source::Error => "error",
        }
    }
}

/// Per-request caller identity and extra context fields
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestContext {
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub client_ip: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Timing and size metadata attached to every answer
#[derive(Debug, Clone, Serialize)]
pub struct AskMetadata {
    pub processing_time_ms: u64,
    pub prompt_length: usize,
    pub response_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<i64>,
}

/// The full answer envelope returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct AskResponse {
    pub response: String,
    pub source: Source,
    pub timestamp: i64,
    pub metadata: AskMetadata,
}

/// Snapshot of every layer for the status API
#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub primary: ProviderStatus,
    pub secondary: ProviderStatus,
    pub cache: ConnectionStatus,
    pub cache_stats: CacheStats,
}

/// Request orchestrator
pub struct AiRouter {
    cache: CacheStore,
    primary: Arc<dyn Provider>,
    secondary: Arc<dyn Provider>,
    conversations: Arc<Mutex<ConversationStore>>,
    audit: Arc<Mutex<AuditLog>>,
}

impl AiRouter {
    pub fn new(
        cache: CacheStore,
        primary: Arc<dyn Provider>,
        secondary: Arc<dyn Provider>,
        conversations: Arc<Mutex<ConversationStore>>,
        audit: Arc<Mutex<AuditLog>>,
    ) -> Self {
        Self {
            cache,
            primary,
            secondary,
            conversations,
            audit,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn audit(&self) -> Arc<Mutex<AuditLog>> {
        Arc::clone(&self.audit)
    }

    /// Answer a question. Never returns an error to the caller: every
    /// failure mode maps to an answer envelope with a degraded source.
    pub async fn ask(&self, prompt: &str, ctx: &RequestContext) -> AskResponse {
        let started = Instant::now();
        let prompt = prompt.trim();

        if prompt.is_empty() {
            return self.envelope(
                "Please ask me a question about GreenCart!".to_string(),
                Source::Error,
                prompt,
                started,
                None,
            );
        }

        let identifier = ctx
            .client_ip
            .clone()
            .or_else(|| ctx.session_id.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        if !self.cache.check_rate_limit(&identifier).await {
            let response = self.envelope(
                "You're asking questions faster than we can pick them! \
                 Please wait a moment and try again."
                    .to_string(),
                Source::RateLimited,
                prompt,
                started,
                None,
            );
            self.record(prompt, &response, ctx);
            return response;
        }

        // Conversation tracking is best-effort: a broken store never blocks
        // an answer.
        let conversation_id = self.track_user_message(prompt, ctx);

        if let Some(hit) = self.cache.get(prompt).await {
            let response = self.envelope(
                hit.response,
                Source::Cache,
                prompt,
                started,
                Some(hit.cached_at),
            );
            self.record(prompt, &response, ctx);
            self.track_ai_message(conversation_id.as_deref(), &response);
            return response;
        }

        let enriched = self.enrich(prompt, conversation_id.as_deref(), ctx);

        let (text, source) = self.run_fallback_chain(prompt, &enriched).await;

        // Only real provider answers are worth memoizing.
        if matches!(source, Source::Primary | Source::Secondary) {
            self.cache.put(prompt, &text, None).await;
        }

        let response = self.envelope(text, source, prompt, started, None);
        self.record(prompt, &response, ctx);
        self.track_ai_message(conversation_id.as_deref(), &response);
        response
    }

    async fn run_fallback_chain(&self, prompt: &str, enriched: &str) -> (String, Source) {
        if self.primary.is_available().await {
            match self.primary.ask(enriched).await {
                Ok(text) => {
                    info!("Answered by {} provider", self.primary.name());
                    return (text, Source::Primary);
                }
                Err(e) => warn!("Primary provider failed: {}", e),
            }
        } else {
            warn!("Primary provider not available, skipping");
        }

        match self.secondary.ask(enriched).await {
            Ok(text) => {
                info!("Answered by {} provider", self.secondary.name());
                return (text, Source::Secondary);
            }
            Err(e) => warn!("Secondary provider failed: {}", e),
        }

        info!("All providers down, serving canned fallback");
        (canned_fallback(prompt).to_string(), Source::Fallback)
    }

    /// Build the provider prompt: store context, conversation history,
    /// extra request fields, then the actual question.
    fn enrich(&self, prompt: &str, conversation_id: Option<&str>, ctx: &RequestContext) -> String {
        let mut enriched = String::from(STORE_CONTEXT);
        enriched.push_str("\n\n");

        if let Some(cid) = conversation_id {
            match self.conversations.lock().get_context(cid) {
                Ok(context) if !context.is_empty() => {
                    enriched.push_str(&context);
                    enriched.push('\n');
                }
                Ok(_) => {}
                Err(e) => warn!("Conversation context unavailable: {}", e),
            }
        }

        // Flatten scalar extras ("page": "checkout") into the prompt.
        for (key, value) in &ctx.extra {
            match value {
                serde_json::Value::String(s) => {
                    enriched.push_str(&format!("{key}: {s}\n"));
                }
                serde_json::Value::Number(n) => {
                    enriched.push_str(&format!("{key}: {n}\n"));
                }
                _ => {}
            }
        }

        enriched.push_str(&format!("\nCurrent User Question: {prompt}\n"));
        enriched.push_str("\nRespond in plain text without markdown formatting.");
        enriched
    }

    fn track_user_message(&self, prompt: &str, ctx: &RequestContext) -> Option<String> {
        let session_id = ctx.session_id.as_deref().unwrap_or("anonymous");
        let store = self.conversations.lock();

        let conversation = match store.get_or_create(ctx.user_id, session_id) {
            Ok(c) => c,
            Err(e) => {
                warn!("Conversation lookup failed: {}", e);
                return None;
            }
        };

        let is_first = store
            .message_count(&conversation.conversation_id)
            .unwrap_or(0)
            == 0;

        if let Err(e) =
            store.add_message(&conversation.conversation_id, "user", prompt, None, None)
        {
            warn!("Failed to record user message: {}", e);
        }

        if is_first {
            if let Err(e) = store.update_title(&conversation.conversation_id, prompt) {
                warn!("Failed to set conversation title: {}", e);
            }
        }

        Some(conversation.conversation_id)
    }

    fn track_ai_message(&self, conversation_id: Option<&str>, response: &AskResponse) {
        let Some(cid) = conversation_id else {
            return;
        };
        let seconds = response.metadata.processing_time_ms as f64 / 1000.0;
        if let Err(e) = self.conversations.lock().add_message(
            cid,
            "ai",
            &response.response,
            Some(response.source.as_str()),
            Some(seconds),
        ) {
            warn!("Failed to record AI message: {}", e);
        }
    }

    fn record(&self, prompt: &str, response: &AskResponse, ctx: &RequestContext) {
        let seconds = response.metadata.processing_time_ms as f64 / 1000.0;
        if let Err(e) = self.audit.lock().record(
            prompt,
            &response.response,
            response.source.as_str(),
            ctx.client_ip.as_deref(),
            ctx.user_id,
            seconds,
        ) {
            warn!("Audit write failed: {}", e);
        }
    }

    fn envelope(
        &self,
        text: String,
        source: Source,
        prompt: &str,
        started: Instant,
        cached_at: Option<i64>,
    ) -> AskResponse {
        AskResponse {
            metadata: AskMetadata {
                processing_time_ms: started.elapsed().as_millis() as u64,
                prompt_length: prompt.len(),
                response_length: text.len(),
                cached_at,
            },
            response: text,
            source,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Status snapshot across providers and cache.
    pub async fn status(&self) -> SystemStatus {
        SystemStatus {
            primary: self.primary.status().await,
            secondary: self.secondary.status().await,
            cache: self.cache.test_connection().await,
            cache_stats: self.cache.stats().await,
        }
    }

    /// Drop cached answers matching the pattern. Returns entries removed.
    pub async fn clear_cache(&self, pattern: &str) -> usize {
        self.cache.clear(pattern).await
    }
}

/// Keyword category used when every provider is down.
fn fallback_category(prompt: &str) -> &'static str {
    let lower = prompt.to_lowercase();
    if ["product", "vegetable", "fruit", "item", "grocery", "stock"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "products"
    } else if ["delivery", "deliver", "shipping", "order"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "delivery"
    } else if ["help", "support", "contact", "problem", "refund"]
        .iter()
        .any(|k| lower.contains(k))
    {
        "support"
    } else {
        "general"
    }
}

/// Last-resort canned answer, keyed off keywords in the question.
pub fn canned_fallback(prompt: &str) -> &'static str {
    match fallback_category(prompt) {
        "products" => {
            "We stock fresh fruits, vegetables, dairy, bakery goods and \
             pantry staples. Browse the catalog for today's availability, \
             or search for a specific item from the home page."
        }
        "delivery" => {
            "We offer same-day delivery in selected areas for orders placed \
             before 2pm. You can check delivery options for your address at \
             checkout, and track active orders from your account page."
        }
        "support" => {
            "Our support team is happy to help! Reach us through the contact \
             form on the website or reply to your order confirmation email, \
             and we'll get back to you as soon as we can."
        }
        _ => {
            "Thanks for your question! Our assistant is temporarily \
             unavailable, but you can browse products, manage orders and \
             find store information right here on the site."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_category_keywords() {
        assert_eq!(fallback_category("Do you have fresh fruit?"), "products");
        assert_eq!(fallback_category("What VEGETABLES are in stock"), "products");
        assert_eq!(fallback_category("when will my delivery arrive"), "delivery");
        assert_eq!(fallback_category("shipping to zip 90210?"), "delivery");
        assert_eq!(fallback_category("I need help with a refund"), "support");
        assert_eq!(fallback_category("how do I contact you"), "support");
        assert_eq!(fallback_category("hello there"), "general");
    }

    #[test]
    fn test_canned_fallback_nonempty_for_all_categories() {
        for prompt in ["fruit", "delivery", "support", "anything else"] {
            assert!(!canned_fallback(prompt).is_empty());
        }
    }

    #[test]
    fn test_source_serialization() {
        assert_eq!(
            serde_json::to_string(&Source::RateLimited).unwrap(),
            "\"rate_limited\""
        );
        assert_eq!(serde_json::to_string(&Source::Cache).unwrap(), "\"cache\"");
        assert_eq!(Source::Secondary.as_str(), "secondary");
    }

    #[test]
    fn test_request_context_flattens_extras() {
        let ctx: RequestContext = serde_json::from_str(
            r#"{"user_id": 7, "session_id": "s1", "page": "checkout", "cart_total": 42}"#,
        )
        .unwrap();
        assert_eq!(ctx.user_id, Some(7));
        assert_eq!(ctx.extra.get("page").and_then(|v| v.as_str()), Some("checkout"));
        assert_eq!(ctx.extra.get("cart_total").and_then(|v| v.as_i64()), Some(42));
    }
}
