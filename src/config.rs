//! Configuration management
//!
//! One `Config` is built from the environment at process start and injected
//! into every component constructor. Components never read env state.

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Gemini API key (optional - primary provider is skipped without it)
    pub gemini_api_key: Option<String>,
    /// Gemini model name
    pub gemini_model: String,
    /// Gemini request timeout
    pub gemini_timeout: Duration,

    /// Ollama base URL
    pub ollama_url: String,
    /// Ollama model name
    pub ollama_model: String,
    /// Ollama request timeout (local inference is slow)
    pub ollama_timeout: Duration,

    /// Redis URL for the response cache (optional - file fallback otherwise)
    pub redis_url: Option<String>,
    /// Default cache TTL in seconds
    pub cache_ttl_secs: u64,
    /// Directory for the file-backed cache fallback
    pub cache_dir: PathBuf,

    /// Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,

    /// SQLite database path (conversations, audit, health, backup logs)
    pub db_path: PathBuf,
    /// Max messages kept per conversation
    pub max_conversation_history: usize,
    /// Messages rendered into the prompt context
    pub context_window: usize,

    /// Health thresholds
    pub max_response_time_secs: f64,
    pub max_error_rate_percent: f64,
    pub min_cache_hit_rate_percent: f64,
    pub disk_space_warning_percent: f64,
    /// Container names probed by the infra liveness check
    pub infra_containers: Vec<String>,
    /// Alerting
    pub health_alerts_enabled: bool,
    pub alert_webhook_url: Option<String>,
    /// Health history retention in days
    pub health_history_days: u32,

    /// Backups
    pub backup_dir: PathBuf,
    pub max_backups: usize,
    pub backup_compression: bool,

    /// Interaction log retention in days
    pub log_retention_days: u32,

    /// HTTP bind address
    pub bind_addr: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_str("GROCER_AI_DATA_DIR", "./data"));

        Ok(Self {
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            gemini_model: env_str("GEMINI_MODEL", "gemini-1.5-flash-latest"),
            gemini_timeout: Duration::from_secs(env_parse("GEMINI_TIMEOUT_SECS", 30)),

            ollama_url: env_str("OLLAMA_URL", "http://localhost:11434"),
            ollama_model: env_str("OLLAMA_MODEL", "phi3"),
            ollama_timeout: Duration::from_secs(env_parse("OLLAMA_TIMEOUT_SECS", 60)),

            redis_url: std::env::var("REDIS_URL").ok(),
            cache_ttl_secs: env_parse("CACHE_TTL", 3600),
            cache_dir: std::env::var("CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("cache")),

            rate_limit_enabled: env_bool("RATE_LIMIT_ENABLED", true),
            rate_limit_max_requests: env_parse("MAX_REQUESTS_PER_MINUTE", 10),
            rate_limit_window_secs: env_parse("RATE_LIMIT_WINDOW_SECS", 60),

            db_path: std::env::var("GROCER_AI_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("grocer_ai.db")),
            max_conversation_history: env_parse("MAX_CONVERSATION_HISTORY", 50),
            context_window: env_parse("CONVERSATION_CONTEXT_WINDOW", 5),

            max_response_time_secs: env_parse("MAX_RESPONSE_TIME", 10.0),
            max_error_rate_percent: env_parse("MAX_ERROR_RATE", 10.0),
            min_cache_hit_rate_percent: env_parse("MIN_CACHE_HIT_RATE", 30.0),
            disk_space_warning_percent: env_parse("DISK_SPACE_WARNING", 85.0),
            infra_containers: std::env::var("INFRA_CONTAINERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| {
                    vec!["greencart-redis".to_string(), "greencart-ollama".to_string()]
                }),
            health_alerts_enabled: env_bool("HEALTH_ALERTS_ENABLED", true),
            alert_webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok(),
            health_history_days: env_parse("HEALTH_HISTORY_DAYS", 7),

            backup_dir: std::env::var("BACKUP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("backups")),
            max_backups: env_parse("MAX_BACKUPS", 30),
            backup_compression: env_bool("BACKUP_COMPRESSION", true),

            log_retention_days: env_parse("LOG_RETENTION_DAYS", 30),

            bind_addr: env_str("GROCER_AI_BIND", "127.0.0.1:8088"),
        })
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("GROCER_AI_TEST_PARSE", "not-a-number");
        let v: u64 = env_parse("GROCER_AI_TEST_PARSE", 42);
        assert_eq!(v, 42);
        std::env::remove_var("GROCER_AI_TEST_PARSE");
    }

    #[test]
    fn test_documented_limits_hold() {
        let config = Config::from_env().unwrap();
        // Pruning must never starve the context window.
        assert!(config.max_conversation_history >= config.context_window);
        assert!(config.rate_limit_window_secs > 0);
    }
}
