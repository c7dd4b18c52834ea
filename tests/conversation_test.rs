//! Conversation Store Integration Tests
//!
//! Tests for conversation persistence, retention and prompt context.

use grocer_ai::audit::AuditLog;
use grocer_ai::conversation::ConversationStore;
use tempfile::TempDir;

fn create_test_store(name: &str) -> (ConversationStore, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join(format!("{}.db", name));
    let store = ConversationStore::open(&db_path).expect("Failed to create store");
    (store, temp_dir)
}

#[test]
fn test_store_and_retrieve_messages() {
    let (store, _temp) = create_test_store("retrieve");
    let conv = store.get_or_create(Some(12345), "sess").unwrap();
    let cid = &conv.conversation_id;

    store.add_message(cid, "user", "Do you have oat milk?", None, None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    store
        .add_message(cid, "ai", "Yes, three brands in stock.", Some("primary"), Some(0.4))
        .unwrap();

    let history = store.get_history(cid, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, "user");
    assert!(history[0].content.contains("oat milk"));
    assert_eq!(history[1].role, "ai");
    assert_eq!(history[1].ai_source.as_deref(), Some("primary"));
}

#[test]
fn test_same_day_reuses_conversation() {
    let (store, _temp) = create_test_store("sameday");

    let first = store.get_or_create(Some(7), "s1").unwrap();
    store.add_message(&first.conversation_id, "user", "hi", None, None).unwrap();

    let second = store.get_or_create(Some(7), "s1").unwrap();
    assert_eq!(first.conversation_id, second.conversation_id);
    assert_eq!(store.get_history(&second.conversation_id, 10).unwrap().len(), 1);
}

#[test]
fn test_guest_sessions_are_isolated() {
    let (store, _temp) = create_test_store("guests");

    let a = store.get_or_create(None, "guest-a").unwrap();
    let b = store.get_or_create(None, "guest-b").unwrap();
    store.add_message(&a.conversation_id, "user", "apples", None, None).unwrap();

    assert_ne!(a.conversation_id, b.conversation_id);
    assert!(store.get_history(&b.conversation_id, 10).unwrap().is_empty());
}

#[test]
fn test_rolling_window() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("rolling.db");
    let store = ConversationStore::open_with_config(&db_path, 5, 3).unwrap();
    let conv = store.get_or_create(None, "roll").unwrap();
    let cid = &conv.conversation_id;

    for i in 0..10 {
        store.add_message(cid, "user", &format!("Message {}", i), None, None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let history = store.get_history(cid, 100).unwrap();
    assert_eq!(history.len(), 5); // Only last 5 kept
    assert!(history[4].content.contains("Message 9"));
    assert!(history[0].content.contains("Message 5"));
}

#[test]
fn test_context_uses_most_recent_window() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("context.db");
    let store = ConversationStore::open_with_config(&db_path, 50, 2).unwrap();
    let conv = store.get_or_create(None, "ctx").unwrap();
    let cid = &conv.conversation_id;

    store.add_message(cid, "user", "old question", None, None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    store.add_message(cid, "user", "newer question", None, None).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    store.add_message(cid, "ai", "newest answer", Some("primary"), None).unwrap();

    let context = store.get_context(cid).unwrap();
    assert!(context.contains("User: newer question"));
    assert!(context.contains("Assistant: newest answer"));
    assert!(!context.contains("old question"));
}

#[test]
fn test_persistence_across_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("persist.db");

    let cid = {
        let store = ConversationStore::open(&db_path).unwrap();
        let conv = store.get_or_create(Some(1), "s").unwrap();
        store
            .add_message(&conv.conversation_id, "user", "remember me", None, None)
            .unwrap();
        conv.conversation_id
    };

    let store = ConversationStore::open(&db_path).unwrap();
    let history = store.get_history(&cid, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "remember me");
}

#[test]
fn test_archived_conversation_recreated_same_day() {
    let (store, _temp) = create_test_store("rearchive");

    let first = store.get_or_create(Some(9), "s5").unwrap();
    store.add_message(&first.conversation_id, "user", "hello", None, None).unwrap();
    assert!(store.archive(&first.conversation_id).unwrap());

    // Same user, same day: tracking must continue with a fresh active row
    // instead of erroring out for the rest of the day.
    let second = store.get_or_create(Some(9), "s5").unwrap();
    assert_ne!(second.id, first.id);
    assert!(second.is_active);
    store
        .add_message(&second.conversation_id, "user", "still here", None, None)
        .unwrap();

    let history = store.get_history(&second.conversation_id, 10).unwrap();
    assert_eq!(history.last().unwrap().content, "still here");
}

#[test]
fn test_concurrent_stores_share_database_file() {
    let temp = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp.path().join("shared.db");

    let store = ConversationStore::open(&db_path).unwrap();
    let audit = AuditLog::open(&db_path).unwrap();
    let conv = store.get_or_create(Some(1), "s").unwrap();
    let cid = conv.conversation_id.clone();

    // Two connections writing to the same file at once: with the busy
    // timeout in place, contended writes wait instead of failing.
    let writer = std::thread::spawn(move || {
        for i in 0..100 {
            audit
                .record(&format!("q{i}"), "a", "primary", None, None, 0.1)
                .unwrap();
        }
        audit
    });
    for i in 0..100 {
        store
            .add_message(&cid, "user", &format!("m{i}"), None, None)
            .unwrap();
    }
    let audit = writer.join().expect("audit writer thread");

    assert_eq!(audit.recent(200).unwrap().len(), 100);
    // Retention cap (50) still applies to the conversation side.
    assert_eq!(store.get_history(&cid, 200).unwrap().len(), 50);
}

#[test]
fn test_export_includes_transcript() {
    let (store, _temp) = create_test_store("export");
    let conv = store.get_or_create(Some(3), "s").unwrap();
    let cid = &conv.conversation_id;

    store.add_message(cid, "user", "Is the bakery open?", None, None).unwrap();
    store.add_message(cid, "ai", "Open 7am to 6pm daily.", Some("secondary"), None).unwrap();

    let transcript = store.export(cid).unwrap().expect("conversation exists");
    assert!(transcript.contains("You: Is the bakery open?"));
    assert!(transcript.contains("AI Assistant: Open 7am to 6pm daily."));

    assert!(store.export("user_999_2020-01-01").unwrap().is_none());
}
