//! GreenCart AI Assistant - Entry Point
//!
//! Modes:
//! - Default: HTTP API server
//! - --health-check: run the check battery once and print the report
//! - --backup [full|incremental|auto]: run a backup and exit
//! - --restore <path>: replay a backup into the live database
//! - --purge-logs: drop audit entries past the retention horizon

use grocer_ai::{
    AiRouter, AppState, AuditLog, BackupManager, CacheStore, CheckStatus, Config,
    ConversationStore, GeminiClient, HealthMonitor, OllamaClient,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    let help_mode = args.iter().any(|a| a == "--help" || a == "-h");
    let health_mode = args.iter().any(|a| a == "--health-check");
    let purge_mode = args.iter().any(|a| a == "--purge-logs");
    let backup_mode = args
        .iter()
        .position(|a| a == "--backup")
        .map(|i| args.get(i + 1).cloned().unwrap_or_else(|| "auto".to_string()));
    let restore_mode = args
        .iter()
        .position(|a| a == "--restore")
        .and_then(|i| args.get(i + 1).cloned());

    if help_mode {
        println!("GreenCart AI Assistant v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: grocer-ai [OPTIONS]");
        println!();
        println!("Options:");
        println!("  --health-check              Run health checks once and exit");
        println!("  --backup [full|incremental|auto]  Run a backup and exit");
        println!("  --restore <path>            Restore a backup and exit");
        println!("  --purge-logs                Purge expired audit entries and exit");
        println!("  --help, -h                  Show this help");
        println!();
        println!("Default: Run the HTTP API server");
        println!();
        println!("Environment variables:");
        println!("  GEMINI_API_KEY           Primary provider API key");
        println!("  OLLAMA_URL               Secondary provider URL (default: http://localhost:11434)");
        println!("  REDIS_URL                Response cache (file fallback without it)");
        println!("  GROCER_AI_BIND           HTTP bind address (default: 127.0.0.1:8088)");
        println!("  GROCER_AI_DATA_DIR       Data directory (default: ./data)");
        println!("  MAX_REQUESTS_PER_MINUTE  Rate limit per client (default: 10)");
        return Ok(());
    }

    // Setup logging based on mode
    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    let one_shot =
        health_mode || purge_mode || backup_mode.is_some() || restore_mode.is_some();
    if one_shot {
        // Cron-style modes - plain stderr, machine-friendly
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;

    if let Some(kind) = backup_mode {
        let manager = BackupManager::new(&config)?;
        match kind.as_str() {
            "full" => {
                let path = manager.create_full()?;
                println!("{}", path.display());
            }
            "incremental" => {
                let path = manager.create_incremental()?;
                println!("{}", path.display());
            }
            _ => {
                let outcome = manager.run_scheduled()?;
                println!("{}", serde_json::to_string(&outcome)?);
            }
        }
        return Ok(());
    }

    if let Some(path) = restore_mode {
        let manager = BackupManager::new(&config)?;
        let tables = manager.restore(&PathBuf::from(path))?;
        println!("Restored {tables} tables");
        return Ok(());
    }

    if purge_mode {
        let audit = AuditLog::open(&config.db_path)?;
        let removed = audit.purge_older_than(config.log_retention_days)?;
        println!("Purged {removed} audit entries");
        return Ok(());
    }

    info!("GreenCart AI Assistant v{}", env!("CARGO_PKG_VERSION"));

    let cache = CacheStore::connect(&config).await;
    let primary = Arc::new(GeminiClient::from_config(&config));
    let secondary = Arc::new(OllamaClient::from_config(&config));
    let conversations = Arc::new(Mutex::new(ConversationStore::open_with_config(
        &config.db_path,
        config.max_conversation_history,
        config.context_window,
    )?));
    let audit = Arc::new(Mutex::new(AuditLog::open(&config.db_path)?));

    let router = Arc::new(AiRouter::new(
        cache,
        primary,
        secondary,
        conversations,
        audit,
    ));

    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&router),
        &config,
        &config.db_path,
    )?);

    if health_mode {
        let report = health.run_checks().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if report.overall == CheckStatus::Critical {
            std::process::exit(2);
        }
        return Ok(());
    }

    let backups = Arc::new(Mutex::new(BackupManager::new(&config)?));

    let state = AppState {
        router,
        health,
        backups,
    };

    grocer_ai::serve(state, &config.bind_addr).await?;
    Ok(())
}
