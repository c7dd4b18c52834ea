//! GreenCart AI Assistant Core
//!
//! Conversational assistant backend for the GreenCart online grocery store.
//!
//! # Features
//!
//! - **Fallback Chain**: Gemini primary, Ollama secondary, canned answers last
//! - **Response Caching**: normalized SHA256 keys, Redis with file degradation
//! - **Rate Limiting**: fixed-window per client, fails open
//! - **Conversations**: day-scoped history with rolling retention
//! - **Audit Log**: every answered request with source and latency
//! - **Health Monitor**: database, providers, cache, containers, disk, errors
//! - **Backups**: full/incremental SQL dumps, zip compression, idempotent restore
//!
//! # Architecture
//!
//! ```text
//! Storefront ──► HTTP API ──► AiRouter ──► Gemini API
//!                 (axum)         │
//!                                ├── Cache (Redis / file)
//!                                ├── Fallback (Ollama, canned)
//!                                ├── Conversations (SQLite)
//!                                ├── Audit Log (SQLite)
//!                                ├── Health Monitor (7 checks)
//!                                └── Backup Manager (SQL dumps + zip)
//! ```

pub mod audit;
pub mod backup;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gemini;
pub mod health;
pub mod ollama;
pub mod provider;
pub mod router;
pub mod server;

pub use audit::{AuditEntry, AuditLog};
pub use backup::{BackupKind, BackupManager, BackupRecord, ScheduleOutcome};
pub use cache::{CacheStats, CacheStore, CachedEntry, ConnectionStatus};
pub use config::Config;
pub use conversation::{Conversation, ConversationStats, ConversationStore, Message};
pub use error::{Result, RouterError};
pub use gemini::GeminiClient;
pub use health::{CheckResult, CheckStatus, HealthMonitor, HealthReport};
pub use ollama::OllamaClient;
pub use provider::{Provider, ProviderStatus};
pub use router::{AiRouter, AskMetadata, AskResponse, RequestContext, Source, SystemStatus};
pub use server::{serve, AppState};
