//! Interaction Audit Log
//!
//! Every answered request lands here regardless of which source produced
//! it. The health monitor reads this table back for latency and fallback
//! rate windows.

use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;

/// One audited interaction
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub prompt: String,
    pub response: String,
    pub source: String,
    pub ip_address: Option<String>,
    pub user_id: Option<i64>,
    pub processing_time: f64,
    pub created_at: i64,
}

/// Append-only interaction log with SQLite backend
pub struct AuditLog {
    conn: Connection,
}

impl AuditLog {
    /// Open or create the audit database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // Several stores share this file; writers must wait, not fail.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let log = Self { conn };
        log.init_schema()?;
        info!("Audit log opened: {}", path.display());
        Ok(log)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ai_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                prompt TEXT NOT NULL,
                response TEXT NOT NULL,
                source TEXT NOT NULL,
                ip_address TEXT,
                user_id INTEGER,
                processing_time REAL NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_ai_logs_created
                ON ai_logs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_ai_logs_source
                ON ai_logs(source, created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Record one interaction. `processing_time` is wall-clock seconds.
    pub fn record(
        &self,
        prompt: &str,
        response: &str,
        source: &str,
        ip_address: Option<&str>,
        user_id: Option<i64>,
        processing_time: f64,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();
        self.conn.execute(
            "INSERT INTO ai_logs
                (prompt, response, source, ip_address, user_id, processing_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![prompt, response, source, ip_address, user_id, processing_time, now],
        )?;
        debug!("Audit: source={}, took={:.3}s", source, processing_time);
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, prompt, response, source, ip_address, user_id,
                    processing_time, created_at
             FROM ai_logs
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    prompt: row.get(1)?,
                    response: row.get(2)?,
                    source: row.get(3)?,
                    ip_address: row.get(4)?,
                    user_id: row.get(5)?,
                    processing_time: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Average response time and request count over the trailing window.
    pub fn performance_window(&self, window_secs: i64) -> Result<(f64, usize)> {
        let since = chrono::Utc::now().timestamp_millis() - window_secs * 1000;
        let (avg, count): (f64, i64) = self.conn.query_row(
            "SELECT COALESCE(AVG(processing_time), 0), COUNT(*)
             FROM ai_logs
             WHERE created_at >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((avg, count as usize))
    }

    /// Percentage of requests served by the canned fallback or rejected
    /// outright over the trailing window. Zero when there is no traffic.
    pub fn fallback_rate_window(&self, window_secs: i64) -> Result<f64> {
        let since = chrono::Utc::now().timestamp_millis() - window_secs * 1000;
        let (degraded, total): (i64, i64) = self.conn.query_row(
            "SELECT
                COUNT(CASE WHEN source IN ('fallback', 'error', 'rate_limited') THEN 1 END),
                COUNT(*)
             FROM ai_logs
             WHERE created_at >= ?1",
            params![since],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(degraded as f64 * 100.0 / total as f64)
    }

    /// Per-source request counts over the trailing window.
    pub fn source_breakdown(&self, window_secs: i64) -> Result<Vec<(String, usize)>> {
        let since = chrono::Utc::now().timestamp_millis() - window_secs * 1000;
        let mut stmt = self.conn.prepare(
            "SELECT source, COUNT(*)
             FROM ai_logs
             WHERE created_at >= ?1
             GROUP BY source
             ORDER BY COUNT(*) DESC",
        )?;
        let rows = stmt
            .query_map(params![since], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Drop entries older than the retention horizon. Returns rows removed.
    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - i64::from(days) * 86_400_000;
        let removed = self.conn.execute(
            "DELETE FROM ai_logs WHERE created_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!("Purged {} audit entries older than {} days", removed, days);
        }
        Ok(removed)
    }
}
