//! Health Monitor
//!
//! Runs a battery of checks over the database, AI providers, cache,
//! containers, latency, disk and error rates, reduces them to a single
//! overall status and persists the report for trend history. Alerts fire
//! on any non-healthy report.

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::router::AiRouter;

/// Severity of a single check, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Healthy,
    Warning,
    Critical,
}

impl CheckStatus {
    fn rank(self) -> u8 {
        match self {
            CheckStatus::Healthy => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Healthy => "healthy",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
        }
    }
}

/// One named check's outcome
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
    pub details: serde_json::Value,
}

impl CheckResult {
    fn healthy(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: CheckStatus::Healthy,
            message: message.into(),
            details,
        }
    }

    fn warning(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: CheckStatus::Warning,
            message: message.into(),
            details,
        }
    }

    fn critical(message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: CheckStatus::Critical,
            message: message.into(),
            details,
        }
    }
}

/// Full report: every check plus the worst-of reduction
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub overall: CheckStatus,
    pub timestamp: i64,
    pub checks: Vec<(String, CheckResult)>,
}

/// Worst single check wins; an empty report is healthy.
pub fn overall_status(checks: &[(String, CheckResult)]) -> CheckStatus {
    checks
        .iter()
        .map(|(_, c)| c.status)
        .max_by_key(|s| s.rank())
        .unwrap_or(CheckStatus::Healthy)
}

/// Alert and trend thresholds, copied out of the config at construction
#[derive(Debug, Clone)]
struct Thresholds {
    max_response_time_secs: f64,
    max_error_rate_percent: f64,
    min_cache_hit_rate_percent: f64,
    disk_warning_percent: f64,
}

/// Health monitor with its own report history table
pub struct HealthMonitor {
    router: Arc<AiRouter>,
    conn: Mutex<Connection>,
    thresholds: Thresholds,
    containers: Vec<String>,
    alerts_enabled: bool,
    webhook_url: Option<String>,
    history_days: u32,
    http: reqwest::Client,
}

impl HealthMonitor {
    pub fn new(router: Arc<AiRouter>, config: &Config, db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        // Several stores share this file; writers must wait, not fail.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS health_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                overall TEXT NOT NULL,
                report TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_logs_created
                ON health_logs(created_at DESC);
            "#,
        )?;

        Ok(Self {
            router,
            conn: Mutex::new(conn),
            thresholds: Thresholds {
                max_response_time_secs: config.max_response_time_secs,
                max_error_rate_percent: config.max_error_rate_percent,
                min_cache_hit_rate_percent: config.min_cache_hit_rate_percent,
                disk_warning_percent: config.disk_space_warning_percent,
            },
            containers: config.infra_containers.clone(),
            alerts_enabled: config.health_alerts_enabled,
            webhook_url: config.alert_webhook_url.clone(),
            history_days: config.health_history_days,
            http: reqwest::Client::new(),
        })
    }

    /// Run all checks, persist the report, alert if degraded.
    pub async fn run_checks(&self) -> HealthReport {
        let mut checks: Vec<(String, CheckResult)> = Vec::with_capacity(7);

        checks.push(("database".to_string(), self.check_database()));
        checks.push(("ai_services".to_string(), self.check_ai_services().await));
        checks.push(("cache".to_string(), self.check_cache().await));
        checks.push(("containers".to_string(), self.check_containers().await));
        checks.push(("performance".to_string(), self.check_performance()));
        checks.push(("disk_space".to_string(), self.check_disk_space().await));
        checks.push(("error_rates".to_string(), self.check_error_rates()));

        let report = HealthReport {
            overall: overall_status(&checks),
            timestamp: chrono::Utc::now().timestamp(),
            checks,
        };

        if let Err(e) = self.persist(&report) {
            warn!("Failed to persist health report: {}", e);
        }

        if report.overall != CheckStatus::Healthy {
            self.alert(&report).await;
        } else {
            info!("Health check passed: all systems healthy");
        }

        report
    }

    fn check_database(&self) -> CheckResult {
        let started = Instant::now();
        let probe: rusqlite::Result<i64> =
            self.conn.lock().query_row("SELECT 1", [], |row| row.get(0));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match probe {
            Ok(_) if elapsed_ms > 1000 => CheckResult::warning(
                format!("Database responding slowly ({elapsed_ms}ms)"),
                json!({ "query_time_ms": elapsed_ms }),
            ),
            Ok(_) => CheckResult::healthy(
                "Database connection OK",
                json!({ "query_time_ms": elapsed_ms }),
            ),
            Err(e) => CheckResult::critical(
                format!("Database unreachable: {e}"),
                json!({ "error": e.to_string() }),
            ),
        }
    }

    async fn check_ai_services(&self) -> CheckResult {
        let status = self.router.status().await;
        let primary_up = status.primary.status == "available";
        let secondary_up = status.secondary.status == "available";
        let details = json!({
            "primary": status.primary,
            "secondary": status.secondary,
        });

        if primary_up && secondary_up {
            CheckResult::healthy("Both AI providers available", details)
        } else if primary_up || secondary_up {
            CheckResult::warning("One AI provider down, fallback active", details)
        } else {
            CheckResult::critical("All AI providers down, serving canned answers", details)
        }
    }

    async fn check_cache(&self) -> CheckResult {
        let connection = self.router.cache().test_connection().await;
        let stats = self.router.cache().stats().await;
        let details = json!({
            "backend": stats.backend,
            "total_keys": stats.total_keys,
            "hit_rate_percent": stats.hit_rate_percent,
        });

        if connection.status != "connected" {
            return CheckResult::warning(
                format!("Cache degraded: {}", connection.message),
                details,
            );
        }

        // Hit rate only means something once there is traffic to measure.
        let sampled = stats.hits + stats.misses;
        if sampled >= 20 && stats.hit_rate_percent < self.thresholds.min_cache_hit_rate_percent {
            return CheckResult::warning(
                format!(
                    "Cache hit rate {:.1}% below target {:.1}%",
                    stats.hit_rate_percent, self.thresholds.min_cache_hit_rate_percent
                ),
                details,
            );
        }

        CheckResult::healthy("Cache operating normally", details)
    }

    async fn check_containers(&self) -> CheckResult {
        if self.containers.is_empty() {
            return CheckResult::healthy("No containers configured", json!({}));
        }

        let mut missing = Vec::new();
        for name in &self.containers {
            let running = tokio::process::Command::new("docker")
                .args([
                    "ps",
                    "--filter",
                    &format!("name={name}"),
                    "--filter",
                    "status=running",
                    "--format",
                    "{{.Names}}",
                ])
                .output()
                .await;

            match running {
                Ok(out) => {
                    let stdout = String::from_utf8_lossy(&out.stdout);
                    if !stdout.lines().any(|line| line.trim() == name) {
                        missing.push(name.clone());
                    }
                }
                Err(e) => {
                    // No docker binary: container checks are not applicable.
                    return CheckResult::healthy(
                        "Container runtime not present, skipping",
                        json!({ "error": e.to_string() }),
                    );
                }
            }
        }

        if missing.is_empty() {
            CheckResult::healthy(
                "All infrastructure containers running",
                json!({ "containers": self.containers }),
            )
        } else {
            CheckResult::warning(
                format!("Containers not running: {}", missing.join(", ")),
                json!({ "missing": missing }),
            )
        }
    }

    fn check_performance(&self) -> CheckResult {
        let window = self.router.audit();
        let result = window.lock().performance_window(3600);
        match result {
            Ok((_, 0)) => CheckResult::healthy("No traffic in the last hour", json!({})),
            Ok((avg_secs, count)) => {
                let details = json!({
                    "avg_response_time_secs": avg_secs,
                    "requests_last_hour": count,
                });
                if avg_secs > self.thresholds.max_response_time_secs {
                    CheckResult::warning(
                        format!(
                            "Average response time {:.2}s exceeds {:.2}s",
                            avg_secs, self.thresholds.max_response_time_secs
                        ),
                        details,
                    )
                } else {
                    CheckResult::healthy(
                        format!("Average response time {avg_secs:.2}s"),
                        details,
                    )
                }
            }
            Err(e) => CheckResult::warning(
                format!("Cannot read performance window: {e}"),
                json!({ "error": e.to_string() }),
            ),
        }
    }

    async fn check_disk_space(&self) -> CheckResult {
        let output = tokio::process::Command::new("df")
            .args(["-Pk", "/"])
            .output()
            .await;

        let output = match output {
            Ok(out) if out.status.success() => out,
            Ok(out) => {
                return CheckResult::warning(
                    "df exited nonzero",
                    json!({ "stderr": String::from_utf8_lossy(&out.stderr) }),
                )
            }
            Err(e) => {
                return CheckResult::warning(
                    format!("Cannot check disk space: {e}"),
                    json!({ "error": e.to_string() }),
                )
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let used_percent = stdout
            .lines()
            .nth(1)
            .and_then(|line| line.split_whitespace().nth(4))
            .and_then(|field| field.trim_end_matches('%').parse::<f64>().ok());

        match used_percent {
            Some(percent) if percent >= self.thresholds.disk_warning_percent => {
                CheckResult::warning(
                    format!("Disk usage at {percent:.0}%"),
                    json!({ "used_percent": percent }),
                )
            }
            Some(percent) => CheckResult::healthy(
                format!("Disk usage at {percent:.0}%"),
                json!({ "used_percent": percent }),
            ),
            None => CheckResult::warning("Cannot parse df output", json!({})),
        }
    }

    fn check_error_rates(&self) -> CheckResult {
        let audit = self.router.audit();
        let guard = audit.lock();
        let rate = guard.fallback_rate_window(3600);
        let breakdown = guard.source_breakdown(3600).unwrap_or_default();
        drop(guard);
        match rate {
            Ok(percent) => {
                let details = json!({
                    "fallback_rate_percent": percent,
                    "sources_last_hour": breakdown,
                });
                if percent > self.thresholds.max_error_rate_percent {
                    CheckResult::warning(
                        format!(
                            "Fallback rate {:.1}% exceeds {:.1}%",
                            percent, self.thresholds.max_error_rate_percent
                        ),
                        details,
                    )
                } else {
                    CheckResult::healthy(
                        format!("Fallback rate {percent:.1}%"),
                        details,
                    )
                }
            }
            Err(e) => CheckResult::warning(
                format!("Cannot read error rates: {e}"),
                json!({ "error": e.to_string() }),
            ),
        }
    }

    fn persist(&self, report: &HealthReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO health_logs (overall, report, created_at) VALUES (?1, ?2, ?3)",
            params![report.overall.as_str(), json, report.timestamp * 1000],
        )?;
        // Trim old reports on every write so the table never needs a
        // separate maintenance pass.
        let cutoff =
            chrono::Utc::now().timestamp_millis() - i64::from(self.history_days) * 86_400_000;
        conn.execute("DELETE FROM health_logs WHERE created_at < ?1", params![cutoff])?;
        Ok(())
    }

    async fn alert(&self, report: &HealthReport) {
        let degraded: Vec<String> = report
            .checks
            .iter()
            .filter(|(_, c)| c.status != CheckStatus::Healthy)
            .map(|(name, c)| format!("{name}: {}", c.message))
            .collect();

        error!(
            "Health check {}: {}",
            report.overall.as_str(),
            degraded.join("; ")
        );

        if !self.alerts_enabled {
            return;
        }
        let Some(url) = &self.webhook_url else {
            return;
        };

        let payload = json!({
            "service": "grocer-ai",
            "overall": report.overall.as_str(),
            "timestamp": report.timestamp,
            "degraded_checks": degraded,
        });

        if let Err(e) = self.http.post(url).json(&payload).send().await {
            warn!("Alert webhook delivery failed: {}", e);
        }
    }

    /// Persisted reports from the trailing window, newest first.
    pub fn history(&self, hours: u32) -> Result<Vec<(i64, String, String)>> {
        let since = chrono::Utc::now().timestamp_millis() - i64::from(hours) * 3_600_000;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT created_at, overall, report
             FROM health_logs
             WHERE created_at >= ?1
             ORDER BY created_at DESC",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}
