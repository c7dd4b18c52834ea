//! AI Router Integration Tests
//!
//! End-to-end fallback chain behavior with scripted providers: cache
//! reuse, provider ordering, canned answers and rate limiting.

use async_trait::async_trait;
use grocer_ai::audit::AuditLog;
use grocer_ai::cache::CacheStore;
use grocer_ai::conversation::ConversationStore;
use grocer_ai::error::{Result, RouterError};
use grocer_ai::provider::{Provider, ProviderStatus};
use grocer_ai::router::{AiRouter, RequestContext, Source};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

struct ScriptedProvider {
    name: &'static str,
    available: bool,
    answer: Option<&'static str>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn answering(name: &'static str, answer: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            available: true,
            answer: Some(answer),
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            available: true,
            answer: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn offline(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            available: false,
            answer: None,
            calls: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn ask(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.answer {
            Some(text) => Ok(text.to_string()),
            None => Err(RouterError::ProviderCall("scripted failure".to_string())),
        }
    }

    async fn status(&self) -> ProviderStatus {
        if self.available {
            ProviderStatus::available("scripted")
        } else {
            ProviderStatus::unavailable("scripted")
        }
    }
}

struct Harness {
    router: AiRouter,
    audit: Arc<Mutex<AuditLog>>,
    _temp: TempDir,
}

fn harness(
    primary: Arc<ScriptedProvider>,
    secondary: Arc<ScriptedProvider>,
    rate_max: u32,
) -> Harness {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let cache = CacheStore::file_backed(&temp.path().join("cache"), 3600, rate_max, 60)
        .expect("Failed to create cache");
    let conversations = Arc::new(Mutex::new(
        ConversationStore::open(&temp.path().join("conv.db")).expect("Failed to open store"),
    ));
    let audit = Arc::new(Mutex::new(
        AuditLog::open(&temp.path().join("audit.db")).expect("Failed to open audit log"),
    ));
    let router = AiRouter::new(
        cache,
        primary,
        secondary,
        conversations,
        Arc::clone(&audit),
    );
    Harness {
        router,
        audit,
        _temp: temp,
    }
}

fn ctx(ip: &str) -> RequestContext {
    RequestContext {
        user_id: Some(1),
        session_id: Some("test-session".to_string()),
        client_ip: Some(ip.to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_primary_answers_and_is_audited() {
    let primary = ScriptedProvider::answering("gemini", "We have fresh kale today.");
    let secondary = ScriptedProvider::answering("ollama", "secondary answer");
    let h = harness(Arc::clone(&primary), Arc::clone(&secondary), 100);

    let answer = h.router.ask("Do you have kale?", &ctx("10.0.0.1")).await;

    assert_eq!(answer.source, Source::Primary);
    assert_eq!(answer.response, "We have fresh kale today.");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 0);

    let entries = h.audit.lock().recent(10).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].source, "primary");
    assert_eq!(entries[0].prompt, "Do you have kale?");
    assert_eq!(entries[0].ip_address.as_deref(), Some("10.0.0.1"));
}

#[tokio::test]
async fn test_repeat_question_served_from_cache() {
    let primary = ScriptedProvider::answering("gemini", "Delivery is free over $50.");
    let secondary = ScriptedProvider::failing("ollama");
    let h = harness(Arc::clone(&primary), secondary, 100);

    let first = h.router.ask("Is delivery free?", &ctx("10.0.0.2")).await;
    assert_eq!(first.source, Source::Primary);

    // Normalization makes the variant hit the same key.
    let second = h.router.ask("  is DELIVERY free??  ", &ctx("10.0.0.2")).await;
    assert_eq!(second.source, Source::Cache);
    assert_eq!(second.response, "Delivery is free over $50.");
    assert!(second.metadata.cached_at.is_some());
    assert_eq!(primary.call_count(), 1);

    let entries = h.audit.lock().recent(10).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].source, "cache");
}

#[tokio::test]
async fn test_empty_prompt_short_circuits() {
    let primary = ScriptedProvider::answering("gemini", "unused");
    let secondary = ScriptedProvider::answering("ollama", "unused");
    let h = harness(Arc::clone(&primary), Arc::clone(&secondary), 100);

    let answer = h.router.ask("   ", &ctx("10.0.0.3")).await;

    assert_eq!(answer.source, Source::Error);
    assert!(answer.response.contains("GreenCart"));
    assert_eq!(primary.call_count(), 0);
    assert_eq!(secondary.call_count(), 0);
    assert!(h.audit.lock().recent(10).unwrap().is_empty());
}

#[tokio::test]
async fn test_secondary_takes_over_when_primary_fails() {
    let primary = ScriptedProvider::failing("gemini");
    let secondary = ScriptedProvider::answering("ollama", "Answered locally.");
    let h = harness(Arc::clone(&primary), Arc::clone(&secondary), 100);

    let answer = h.router.ask("store hours?", &ctx("10.0.0.4")).await;

    assert_eq!(answer.source, Source::Secondary);
    assert_eq!(answer.response, "Answered locally.");
    assert_eq!(primary.call_count(), 1);
    assert_eq!(secondary.call_count(), 1);
}

#[tokio::test]
async fn test_unavailable_primary_is_skipped_without_call() {
    let primary = ScriptedProvider::offline("gemini");
    let secondary = ScriptedProvider::answering("ollama", "Answered locally.");
    let h = harness(Arc::clone(&primary), Arc::clone(&secondary), 100);

    let answer = h.router.ask("store hours?", &ctx("10.0.0.5")).await;

    assert_eq!(answer.source, Source::Secondary);
    assert_eq!(primary.call_count(), 0);
    assert_eq!(secondary.call_count(), 1);
}

#[tokio::test]
async fn test_canned_fallback_when_all_providers_down() {
    let primary = ScriptedProvider::offline("gemini");
    let secondary = ScriptedProvider::failing("ollama");
    let h = harness(primary, Arc::clone(&secondary), 100);

    let answer = h.router.ask("when is my delivery?", &ctx("10.0.0.6")).await;
    assert_eq!(answer.source, Source::Fallback);
    assert!(answer.response.contains("delivery"));

    // Canned answers are never cached: the same question hits the chain again.
    let again = h.router.ask("when is my delivery?", &ctx("10.0.0.6")).await;
    assert_eq!(again.source, Source::Fallback);
    assert_eq!(secondary.call_count(), 2);

    let entries = h.audit.lock().recent(10).unwrap();
    assert!(entries.iter().all(|e| e.source == "fallback"));
}

#[tokio::test]
async fn test_rate_limit_rejects_after_budget() {
    let primary = ScriptedProvider::answering("gemini", "ok");
    let secondary = ScriptedProvider::failing("ollama");
    // Two requests per window.
    let h = harness(Arc::clone(&primary), secondary, 2);

    let q = ["q one", "q two", "q three"];
    assert_eq!(h.router.ask(q[0], &ctx("10.9.9.9")).await.source, Source::Primary);
    assert_eq!(h.router.ask(q[1], &ctx("10.9.9.9")).await.source, Source::Primary);

    let rejected = h.router.ask(q[2], &ctx("10.9.9.9")).await;
    assert_eq!(rejected.source, Source::RateLimited);
    assert_eq!(primary.call_count(), 2);

    // A different client is unaffected.
    assert_eq!(h.router.ask(q[2], &ctx("10.8.8.8")).await.source, Source::Primary);

    let entries = h.audit.lock().recent(10).unwrap();
    assert!(entries.iter().any(|e| e.source == "rate_limited"));
}

#[tokio::test]
async fn test_ask_records_conversation_turns() {
    let primary = ScriptedProvider::answering("gemini", "Aisle three.");
    let secondary = ScriptedProvider::failing("ollama");
    let h = harness(primary, secondary, 100);

    let context = ctx("10.0.0.7");
    h.router.ask("Where is the pasta?", &context).await;
    let followup = h.router.ask("And the sauce?", &context).await;

    // The enriched second prompt carried the first exchange, so the
    // conversation store must have recorded both turns of each ask.
    assert_eq!(followup.source, Source::Primary);
    let entries = h.audit.lock().recent(10).unwrap();
    assert_eq!(entries.len(), 2);
}
