//! Conversation Store
//!
//! Persists per-user/per-session message turns so the router can build
//! contextual prompts. Conversations are day-scoped: all messages from the
//! same user (or guest session) on the same calendar date share one
//! conversation id. A rolling cap prunes old messages on insert.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::Result;

/// Default rolling cap on messages per conversation
const DEFAULT_MAX_HISTORY: usize = 50;

/// Default number of messages rendered into the prompt context
const DEFAULT_CONTEXT_WINDOW: usize = 5;

/// A conversation header row
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub user_id: Option<i64>,
    pub session_id: String,
    pub conversation_id: String,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_active: bool,
}

/// A single message turn
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    pub ai_source: Option<String>,
    pub processing_time: Option<f64>,
    pub created_at: i64,
}

/// Aggregate statistics across all conversations
#[derive(Debug, Clone, Serialize)]
pub struct ConversationStats {
    pub total_conversations: usize,
    pub total_messages: usize,
    pub user_messages: usize,
    pub ai_messages: usize,
    pub avg_processing_time: f64,
}

/// Conversation store with SQLite backend
pub struct ConversationStore {
    conn: Connection,
    max_history: usize,
    context_window: usize,
}

impl ConversationStore {
    /// Open or create the conversation database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        // Several stores share this file; writers must wait, not fail.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let store = Self {
            conn,
            max_history: DEFAULT_MAX_HISTORY,
            context_window: DEFAULT_CONTEXT_WINDOW,
        };
        store.init_schema()?;

        info!("Conversation store opened: {}", path.display());
        Ok(store)
    }

    /// Open with custom limits
    pub fn open_with_config(path: &Path, max_history: usize, context_window: usize) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.max_history = max_history;
        store.context_window = context_window;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER,
                session_id TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            -- Only one ACTIVE row per derived id: archiving frees the id so
            -- the same user/day can start a fresh conversation.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_active_id
                ON conversations(conversation_id) WHERE is_active = 1;
            CREATE INDEX IF NOT EXISTS idx_conversations_user
                ON conversations(user_id);
            CREATE INDEX IF NOT EXISTS idx_conversations_session
                ON conversations(session_id);

            CREATE TABLE IF NOT EXISTS conversation_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK(role IN ('user', 'ai')),
                content TEXT NOT NULL,
                ai_source TEXT,
                processing_time REAL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON conversation_messages(conversation_id, created_at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Deterministic day-scoped id: same user/session + same date = same id.
    fn derive_id(user_id: Option<i64>, session_id: &str, date: &str) -> String {
        match user_id {
            Some(uid) => format!("user_{uid}_{date}"),
            None => format!("session_{session_id}_{date}"),
        }
    }

    /// Get today's conversation for the caller, creating it lazily.
    /// Idempotent within a calendar day.
    pub fn get_or_create(&self, user_id: Option<i64>, session_id: &str) -> Result<Conversation> {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let conversation_id = Self::derive_id(user_id, session_id, &date);

        if let Some(existing) = self.find(&conversation_id)? {
            return Ok(existing);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let title = match user_id {
            Some(_) => format!("Chat - {}", chrono::Local::now().format("%b %e, %Y")),
            None => format!("Guest Chat - {}", chrono::Local::now().format("%b %e, %Y")),
        };

        self.conn.execute(
            "INSERT INTO conversations
                (user_id, session_id, conversation_id, title, created_at, updated_at, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 1)",
            params![user_id, session_id, conversation_id, title, now],
        )?;

        debug!("Created conversation {}", conversation_id);

        Ok(Conversation {
            id: self.conn.last_insert_rowid(),
            user_id,
            session_id: session_id.to_string(),
            conversation_id,
            title,
            created_at: now,
            updated_at: now,
            is_active: true,
        })
    }

    fn find(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, user_id, session_id, conversation_id, title,
                        created_at, updated_at, is_active
                 FROM conversations
                 WHERE conversation_id = ?1 AND is_active = 1",
                params![conversation_id],
                Self::map_conversation,
            )
            .optional()?;
        Ok(row)
    }

    fn map_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
        Ok(Conversation {
            id: row.get(0)?,
            user_id: row.get(1)?,
            session_id: row.get(2)?,
            conversation_id: row.get(3)?,
            title: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            is_active: row.get::<_, i64>(7)? != 0,
        })
    }

    /// Insert a message, bump the conversation's updated_at and prune
    /// beyond the rolling cap.
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        ai_source: Option<&str>,
        processing_time: Option<f64>,
    ) -> Result<i64> {
        let now = chrono::Utc::now().timestamp_millis();

        self.conn.execute(
            "INSERT INTO conversation_messages
                (conversation_id, role, content, ai_source, processing_time, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![conversation_id, role, content, ai_source, processing_time, now],
        )?;
        let message_id = self.conn.last_insert_rowid();

        self.conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE conversation_id = ?2",
            params![now, conversation_id],
        )?;

        self.prune(conversation_id)?;

        debug!("Added {} message to {}", role, conversation_id);
        Ok(message_id)
    }

    fn prune(&self, conversation_id: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM conversation_messages
             WHERE conversation_id = ?1 AND id NOT IN (
                 SELECT id FROM conversation_messages
                 WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?2
             )",
            params![conversation_id, self.max_history],
        )?;
        Ok(())
    }

    /// Most recent `limit` messages in chronological (oldest first) order.
    pub fn get_history(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT id, conversation_id, role, content, ai_source, processing_time, created_at
             FROM conversation_messages
             WHERE conversation_id = ?1
             ORDER BY created_at DESC, id DESC
             LIMIT ?2",
        )?;

        let mut messages: Vec<Message> = stmt
            .query_map(params![conversation_id, limit], |row| {
                Ok(Message {
                    id: row.get(0)?,
                    conversation_id: row.get(1)?,
                    role: row.get(2)?,
                    content: row.get(3)?,
                    ai_source: row.get(4)?,
                    processing_time: row.get(5)?,
                    created_at: row.get(6)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        messages.reverse();
        Ok(messages)
    }

    /// Number of messages currently stored for a conversation.
    pub fn message_count(&self, conversation_id: &str) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Render the last context-window messages as a transcript for prompt
    /// enrichment. Empty string when there is no history.
    pub fn get_context(&self, conversation_id: &str) -> Result<String> {
        let history = self.get_history(conversation_id, self.context_window)?;
        if history.is_empty() {
            return Ok(String::new());
        }

        let mut context = String::from("Previous conversation context:\n");
        for message in history {
            let role = if message.role == "user" { "User" } else { "Assistant" };
            context.push_str(&format!("{role}: {}\n", message.content));
        }
        Ok(context)
    }

    /// Set the title from the first user message (50 chars + ellipsis).
    pub fn update_title(&self, conversation_id: &str, first_message: &str) -> Result<()> {
        let mut title: String = first_message.chars().take(50).collect();
        if first_message.chars().count() > 50 {
            title.push_str("...");
        }
        self.conn.execute(
            "UPDATE conversations SET title = ?1 WHERE conversation_id = ?2",
            params![title, conversation_id],
        )?;
        Ok(())
    }

    /// Soft-delete. The derived id becomes free again, so the next
    /// get_or_create for the same caller starts a fresh active row.
    pub fn archive(&self, conversation_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE conversations SET is_active = 0 WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(rows > 0)
    }

    /// Hard-delete a conversation and all of its messages.
    pub fn delete(&self, conversation_id: &str) -> Result<bool> {
        self.conn.execute(
            "DELETE FROM conversation_messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        let rows = self.conn.execute(
            "DELETE FROM conversations WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        info!("Deleted conversation {}", conversation_id);
        Ok(rows > 0)
    }

    /// Conversations whose messages contain the query text.
    pub fn search(
        &self,
        query: &str,
        user_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let like = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT c.id, c.user_id, c.session_id, c.conversation_id, c.title,
                    c.created_at, c.updated_at, c.is_active
             FROM conversations c
             JOIN conversation_messages cm ON c.conversation_id = cm.conversation_id
             WHERE cm.content LIKE ?1 ESCAPE '\\'
               AND (?2 IS NULL OR c.user_id = ?2)
             ORDER BY c.updated_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![like, user_id, limit], Self::map_conversation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Active conversations for a logged-in user, most recent first.
    pub fn list_for_user(&self, user_id: i64, limit: usize) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, session_id, conversation_id, title,
                    created_at, updated_at, is_active
             FROM conversations
             WHERE user_id = ?1 AND is_active = 1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![user_id, limit], Self::map_conversation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Active guest conversations for a session, most recent first.
    pub fn list_for_session(&self, session_id: &str, limit: usize) -> Result<Vec<Conversation>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, session_id, conversation_id, title,
                    created_at, updated_at, is_active
             FROM conversations
             WHERE session_id = ?1 AND user_id IS NULL AND is_active = 1
             ORDER BY updated_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, limit], Self::map_conversation)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Plain-text transcript export of a full conversation.
    pub fn export(&self, conversation_id: &str) -> Result<Option<String>> {
        let conversation = match self.find(conversation_id)? {
            Some(c) => c,
            None => return Ok(None),
        };

        let messages = self.get_history(conversation_id, usize::MAX)?;

        let mut out = String::from("GreenCart AI Conversation Export\n");
        out.push_str("=================================\n");
        out.push_str(&format!("Title: {}\n", conversation.title));
        out.push_str(&format!(
            "Exported: {}\n\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        ));

        for message in messages {
            let role = if message.role == "user" { "You" } else { "AI Assistant" };
            out.push_str(&format!("{role}: {}\n\n", message.content));
        }

        Ok(Some(out))
    }

    /// Aggregate statistics, optionally scoped to a user.
    pub fn stats(&self, user_id: Option<i64>) -> Result<ConversationStats> {
        let stats = self.conn.query_row(
            "SELECT
                COUNT(DISTINCT c.id),
                COUNT(cm.id),
                COUNT(CASE WHEN cm.role = 'user' THEN 1 END),
                COUNT(CASE WHEN cm.role = 'ai' THEN 1 END),
                COALESCE(AVG(cm.processing_time), 0)
             FROM conversations c
             LEFT JOIN conversation_messages cm
                ON c.conversation_id = cm.conversation_id
             WHERE (?1 IS NULL OR c.user_id = ?1)",
            params![user_id],
            |row| {
                Ok(ConversationStats {
                    total_conversations: row.get::<_, i64>(0)? as usize,
                    total_messages: row.get::<_, i64>(1)? as usize,
                    user_messages: row.get::<_, i64>(2)? as usize,
                    ai_messages: row.get::<_, i64>(3)? as usize,
                    avg_processing_time: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (ConversationStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(&dir.path().join("conv.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn test_id_derivation() {
        assert_eq!(
            ConversationStore::derive_id(Some(7), "abc", "2026-08-23"),
            "user_7_2026-08-23"
        );
        assert_eq!(
            ConversationStore::derive_id(None, "abc", "2026-08-23"),
            "session_abc_2026-08-23"
        );
    }

    #[test]
    fn test_get_or_create_idempotent_same_day() {
        let (store, _dir) = test_store();
        let first = store.get_or_create(Some(42), "sess-1").unwrap();
        let second = store.get_or_create(Some(42), "sess-1").unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn test_guest_and_user_get_distinct_conversations() {
        let (store, _dir) = test_store();
        let user = store.get_or_create(Some(1), "shared-session").unwrap();
        let guest = store.get_or_create(None, "shared-session").unwrap();
        assert_ne!(user.conversation_id, guest.conversation_id);
    }

    #[test]
    fn test_title_truncation() {
        let (store, _dir) = test_store();
        let conv = store.get_or_create(None, "s1").unwrap();

        let long = "a".repeat(60);
        store.update_title(&conv.conversation_id, &long).unwrap();
        let found = store.find(&conv.conversation_id).unwrap().unwrap();
        assert_eq!(found.title.len(), 53);
        assert!(found.title.ends_with("..."));

        store.update_title(&conv.conversation_id, "short").unwrap();
        let found = store.find(&conv.conversation_id).unwrap().unwrap();
        assert_eq!(found.title, "short");
    }

    #[test]
    fn test_history_chronological_order() {
        let (store, _dir) = test_store();
        let conv = store.get_or_create(None, "s2").unwrap();
        let cid = &conv.conversation_id;

        store.add_message(cid, "user", "first", None, None).unwrap();
        store.add_message(cid, "ai", "second", Some("primary"), Some(0.5)).unwrap();
        store.add_message(cid, "user", "third", None, None).unwrap();

        let history = store.get_history(cid, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "first");
        assert_eq!(history[2].content, "third");
        assert_eq!(history[1].ai_source.as_deref(), Some("primary"));
    }

    #[test]
    fn test_retention_cap() {
        let dir = TempDir::new().unwrap();
        let store =
            ConversationStore::open_with_config(&dir.path().join("conv.db"), 5, 3).unwrap();
        let conv = store.get_or_create(None, "s3").unwrap();
        let cid = &conv.conversation_id;

        for i in 0..8 {
            store
                .add_message(cid, "user", &format!("message {i}"), None, None)
                .unwrap();
        }

        let history = store.get_history(cid, 100).unwrap();
        assert_eq!(history.len(), 5);
        assert_eq!(history[0].content, "message 3");
        assert_eq!(history[4].content, "message 7");
    }

    #[test]
    fn test_context_rendering() {
        let (store, _dir) = test_store();
        let conv = store.get_or_create(None, "s4").unwrap();
        let cid = &conv.conversation_id;

        assert_eq!(store.get_context(cid).unwrap(), "");

        store.add_message(cid, "user", "Do you have kale?", None, None).unwrap();
        store
            .add_message(cid, "ai", "Yes, fresh from the farm.", Some("primary"), None)
            .unwrap();

        let context = store.get_context(cid).unwrap();
        assert!(context.starts_with("Previous conversation context:"));
        assert!(context.contains("User: Do you have kale?"));
        assert!(context.contains("Assistant: Yes, fresh from the farm."));
    }

    #[test]
    fn test_archive_allows_same_day_recreation() {
        let (store, _dir) = test_store();
        let conv = store.get_or_create(Some(9), "s5").unwrap();
        store.add_message(&conv.conversation_id, "user", "hello", None, None).unwrap();

        assert!(store.archive(&conv.conversation_id).unwrap());

        // A fresh active row replaces the archived one on the next ask.
        let fresh = store.get_or_create(Some(9), "s5").unwrap();
        assert_eq!(fresh.conversation_id, conv.conversation_id);
        assert_ne!(fresh.id, conv.id);
        assert!(fresh.is_active);

        // Messages are keyed by the derived id, so history carries over.
        assert_eq!(store.message_count(&fresh.conversation_id).unwrap(), 1);
    }

    #[test]
    fn test_delete_cascades_messages() {
        let (store, _dir) = test_store();
        let conv = store.get_or_create(None, "s6").unwrap();
        let cid = conv.conversation_id.clone();
        store.add_message(&cid, "user", "bye", None, None).unwrap();

        assert!(store.delete(&cid).unwrap());
        assert_eq!(store.message_count(&cid).unwrap(), 0);
        assert!(store.find(&cid).unwrap().is_none());
    }

    #[test]
    fn test_search_scoped_to_user() {
        let (store, _dir) = test_store();
        let mine = store.get_or_create(Some(1), "s7").unwrap();
        let theirs = store.get_or_create(Some(2), "s8").unwrap();
        store.add_message(&mine.conversation_id, "user", "organic apples", None, None).unwrap();
        store.add_message(&theirs.conversation_id, "user", "organic pears", None, None).unwrap();

        let hits = store.search("organic", Some(1), 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].conversation_id, mine.conversation_id);

        let all = store.search("organic", None, 10).unwrap();
        assert_eq!(all.len(), 2);
    }
}
