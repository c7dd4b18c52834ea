//! Backup Manager
//!
//! Produces SQL dump backups of the operational tables, full or
//! incremental, optionally zip-compressed, with a JSON manifest per run.
//! Dumps use `CREATE TABLE IF NOT EXISTS` schema and `INSERT OR IGNORE`
//! rows, so restoring over a live database is idempotent.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::config::Config;
use crate::error::{Result, RouterError};

/// Tables included in every backup run
const BACKED_UP_TABLES: &[&str] = &[
    "ai_logs",
    "health_logs",
    "conversations",
    "conversation_messages",
];

const FULL_INTERVAL_SECS: i64 = 24 * 3600;
const INCREMENTAL_INTERVAL_SECS: i64 = 6 * 3600;

/// What kind of backup a run produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

impl BackupKind {
    fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Incremental => "incremental",
        }
    }
}

/// Outcome of a scheduled run
#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ScheduleOutcome {
    Created { kind: BackupKind, path: PathBuf },
    Skipped { next_due_secs: i64 },
}

/// One completed backup on disk
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub id: i64,
    pub kind: String,
    pub file_path: String,
    pub file_size: u64,
    pub status: String,
    pub created_at: i64,
}

/// Backup/restore over the operational database
pub struct BackupManager {
    conn: Connection,
    backup_dir: PathBuf,
    max_backups: usize,
    compression: bool,
}

impl BackupManager {
    pub fn new(config: &Config) -> Result<Self> {
        std::fs::create_dir_all(&config.backup_dir)?;
        let conn = Connection::open(&config.db_path)?;
        // Several stores share this file; writers must wait, not fail.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS backup_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn,
            backup_dir: config.backup_dir.clone(),
            max_backups: config.max_backups,
            compression: config.backup_compression,
        })
    }

    /// Full backup: every row of every operational table.
    pub fn create_full(&self) -> Result<PathBuf> {
        self.create(BackupKind::Full, None)
    }

    /// Incremental backup: rows created since the last successful backup.
    /// Falls back to a full dump when no prior backup exists.
    pub fn create_incremental(&self) -> Result<PathBuf> {
        match self.last_backup_at(None)? {
            Some(since) => self.create(BackupKind::Incremental, Some(since)),
            None => {
                info!("No prior backup, promoting incremental to full");
                self.create(BackupKind::Full, None)
            }
        }
    }

    /// Decide full vs incremental vs skip based on elapsed time.
    pub fn run_scheduled(&self) -> Result<ScheduleOutcome> {
        let now = chrono::Utc::now().timestamp_millis();

        let last_full = self.last_backup_at(Some("full"))?;
        let full_due = match last_full {
            Some(at) => now - at >= FULL_INTERVAL_SECS * 1000,
            None => true,
        };
        if full_due {
            let path = self.create_full()?;
            return Ok(ScheduleOutcome::Created {
                kind: BackupKind::Full,
                path,
            });
        }

        let last_any = self.last_backup_at(None)?;
        let incremental_due = match last_any {
            Some(at) => now - at >= INCREMENTAL_INTERVAL_SECS * 1000,
            None => true,
        };
        if incremental_due {
            let path = self.create_incremental()?;
            return Ok(ScheduleOutcome::Created {
                kind: BackupKind::Incremental,
                path,
            });
        }

        let next_due_secs = last_any
            .map(|at| (at + INCREMENTAL_INTERVAL_SECS * 1000 - now) / 1000)
            .unwrap_or(0)
            .max(0);
        Ok(ScheduleOutcome::Skipped { next_due_secs })
    }

    fn create(&self, kind: BackupKind, since_millis: Option<i64>) -> Result<PathBuf> {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let base = format!("grocer_ai_{}_{stamp}", kind.as_str());
        let work_dir = self.backup_dir.join(&base);
        std::fs::create_dir_all(&work_dir)?;

        let mut manifest_tables = serde_json::Map::new();
        let mut total_rows = 0usize;

        for table in BACKED_UP_TABLES {
            let (sql, rows) = self.dump_table(table, since_millis)?;
            std::fs::write(work_dir.join(format!("{table}.sql")), sql)?;
            manifest_tables.insert((*table).to_string(), json!(rows));
            total_rows += rows;
        }

        let manifest = json!({
            "kind": kind.as_str(),
            "created_at": chrono::Utc::now().timestamp(),
            "since": since_millis,
            "tables": manifest_tables,
            "total_rows": total_rows,
        });
        std::fs::write(
            work_dir.join("manifest.json"),
            serde_json::to_string_pretty(&manifest)?,
        )?;

        let final_path = if self.compression {
            let zip_path = self.backup_dir.join(format!("{base}.zip"));
            self.compress_dir(&work_dir, &zip_path)?;
            std::fs::remove_dir_all(&work_dir)?;
            zip_path
        } else {
            work_dir
        };

        let size = file_size(&final_path)?;
        self.conn.execute(
            "INSERT INTO backup_logs (kind, file_path, file_size, status, created_at)
             VALUES (?1, ?2, ?3, 'completed', ?4)",
            params![
                kind.as_str(),
                final_path.to_string_lossy().into_owned(),
                size as i64,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;

        info!(
            "Created {} backup: {} ({} rows, {} bytes)",
            kind.as_str(),
            final_path.display(),
            total_rows,
            size
        );

        self.cleanup()?;
        Ok(final_path)
    }

    /// Render one table as restorable SQL. Schema comes straight from
    /// sqlite_master so the dump matches whatever migrations produced.
    fn dump_table(&self, table: &str, since_millis: Option<i64>) -> Result<(String, usize)> {
        let schema: Option<String> = self
            .conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .ok();

        let Some(schema) = schema else {
            // Table not created yet on this deployment; emit an empty dump.
            return Ok((format!("-- table {table} not present\n"), 0));
        };

        let mut sql = String::new();
        sql.push_str(&schema.replacen("CREATE TABLE", "CREATE TABLE IF NOT EXISTS", 1));
        sql.push_str(";\n");

        let query = match since_millis {
            Some(_) => format!("SELECT * FROM {table} WHERE created_at >= ?1"),
            None => format!("SELECT * FROM {table}"),
        };
        let mut stmt = self.conn.prepare(&query)?;
        let column_count = stmt.column_count();

        let mut rows = match since_millis {
            Some(since) => stmt.query(params![since])?,
            None => stmt.query([])?,
        };

        let mut count = 0usize;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                values.push(render_value(row.get_ref(i)?));
            }
            sql.push_str(&format!(
                "INSERT OR IGNORE INTO {table} VALUES ({});\n",
                values.join(", ")
            ));
            count += 1;
        }

        Ok((sql, count))
    }

    fn compress_dir(&self, dir: &Path, zip_path: &Path) -> Result<()> {
        let file = File::create(zip_path)?;
        let mut zip = ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| RouterError::Backup("non-utf8 backup filename".to_string()))?;
            zip.start_file(name, options)
                .map_err(|e| RouterError::Backup(e.to_string()))?;
            let contents = std::fs::read(&path)?;
            zip.write_all(&contents)?;
        }

        zip.finish()
            .map_err(|e| RouterError::Backup(e.to_string()))?;
        Ok(())
    }

    /// Replay a backup's SQL dumps into the live database. Accepts either
    /// a directory backup or a zip archive.
    pub fn restore(&self, backup_path: &Path) -> Result<usize> {
        let (dump_dir, cleanup): (PathBuf, Option<PathBuf>) =
            if backup_path.extension().and_then(|e| e.to_str()) == Some("zip") {
                let temp = self
                    .backup_dir
                    .join(format!(".restore_{}", uuid::Uuid::new_v4()));
                extract_zip(backup_path, &temp)?;
                (temp.clone(), Some(temp))
            } else if backup_path.is_dir() {
                (backup_path.to_path_buf(), None)
            } else {
                return Err(RouterError::Backup(format!(
                    "not a backup: {}",
                    backup_path.display()
                )));
            };

        let mut restored_tables = 0usize;
        let result = (|| -> Result<()> {
            for table in BACKED_UP_TABLES {
                let sql_path = dump_dir.join(format!("{table}.sql"));
                if !sql_path.is_file() {
                    continue;
                }
                let sql = std::fs::read_to_string(&sql_path)?;
                self.conn.execute_batch(&sql)?;
                restored_tables += 1;
            }
            Ok(())
        })();

        if let Some(temp) = cleanup {
            if let Err(e) = std::fs::remove_dir_all(&temp) {
                warn!("Failed to remove restore scratch dir: {}", e);
            }
        }

        result?;
        info!(
            "Restored {} tables from {}",
            restored_tables,
            backup_path.display()
        );
        Ok(restored_tables)
    }

    /// Drop the oldest backups past the retention count, files and rows.
    fn cleanup(&self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_path FROM backup_logs
             WHERE status = 'completed'
             ORDER BY created_at DESC",
        )?;
        let all: Vec<(i64, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        for (id, file_path) in all.iter().skip(self.max_backups) {
            let path = Path::new(file_path);
            let removed = if path.is_dir() {
                std::fs::remove_dir_all(path)
            } else if path.is_file() {
                std::fs::remove_file(path)
            } else {
                Ok(())
            };
            if let Err(e) = removed {
                warn!("Failed to remove expired backup {}: {}", file_path, e);
                continue;
            }
            self.conn
                .execute("DELETE FROM backup_logs WHERE id = ?1", params![id])?;
            info!("Removed expired backup {}", file_path);
        }
        Ok(())
    }

    fn last_backup_at(&self, kind: Option<&str>) -> Result<Option<i64>> {
        let at: Option<i64> = match kind {
            Some(kind) => self.conn.query_row(
                "SELECT MAX(created_at) FROM backup_logs
                 WHERE status = 'completed' AND kind = ?1",
                params![kind],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT MAX(created_at) FROM backup_logs WHERE status = 'completed'",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(at)
    }

    /// Completed backup records, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<BackupRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, file_path, file_size, status, created_at
             FROM backup_logs
             ORDER BY created_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(BackupRecord {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    file_path: row.get(2)?,
                    file_size: row.get::<_, i64>(3)? as u64,
                    status: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

/// SQL literal rendering for a dumped column value.
fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => {
            let text = String::from_utf8_lossy(t);
            format!("'{}'", text.replace('\'', "''"))
        }
        ValueRef::Blob(b) => format!("X'{}'", hex::encode(b)),
    }
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let file = File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| RouterError::Backup(e.to_string()))?;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| RouterError::Backup(e.to_string()))?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let out_path = dest.join(name);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&out_path)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn file_size(path: &Path) -> Result<u64> {
    if path.is_file() {
        return Ok(std::fs::metadata(path)?.len());
    }
    // Directory backup: sum the dump files.
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_value_literals() {
        assert_eq!(render_value(ValueRef::Null), "NULL");
        assert_eq!(render_value(ValueRef::Integer(42)), "42");
        assert_eq!(render_value(ValueRef::Real(1.5)), "1.5");
        assert_eq!(
            render_value(ValueRef::Text(b"it's fresh")),
            "'it''s fresh'"
        );
        assert_eq!(render_value(ValueRef::Blob(&[0xde, 0xad])), "X'dead'");
    }

    #[test]
    fn test_backup_kind_labels() {
        assert_eq!(BackupKind::Full.as_str(), "full");
        assert_eq!(BackupKind::Incremental.as_str(), "incremental");
    }
}
