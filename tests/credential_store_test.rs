// Integration tests for the on-disk token store.
//
// Each test opens a fresh SQLite file under a temp directory and drives the
// store the way the OAuth exchange flow and the API dispatch layer do.

use chrono::{DateTime, Duration, Utc};
use credstore::credentials::{
    is_token_expired, is_token_near_expiry, AccessDecision, CredentialStore, TokenSet,
    DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS,
};
use std::sync::Arc;
use tempfile::TempDir;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn within_seconds(actual: DateTime<Utc>, expected: DateTime<Utc>, secs: i64) -> bool {
    (actual - expected).num_seconds().abs() <= secs
}

fn token_set(access_token: &str, refresh_token: Option<&str>, expires_in: i64) -> TokenSet {
    TokenSet {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(str::to_string),
        expires_in: Some(expires_in),
        ..Default::default()
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_open_creates_missing_directories() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("nested").join("dir").join("tokens.db");

    let store = CredentialStore::open(&db_path).await.unwrap();
    assert!(db_path.parent().unwrap().is_dir());
    assert_eq!(store.path(), db_path.as_path());
    store.close().await;

    assert!(db_path.exists());
}

#[tokio::test]
async fn test_reopen_is_idempotent_and_keeps_data() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("tokens.db");

    let store = CredentialStore::open(&db_path).await.unwrap();
    store
        .save("sess-1", &token_set("tok-A", None, 3600), None)
        .await
        .unwrap();
    store.close().await;

    let store = CredentialStore::open(&db_path).await.unwrap();
    let record = store.get("sess-1").await.unwrap();
    assert_eq!(record.access_token, "tok-A");
    store.close().await;
}

#[tokio::test]
async fn test_open_fails_on_unusable_path() {
    let temp_dir = TempDir::new().unwrap();
    // A directory cannot be opened as a database file
    let result = CredentialStore::open(temp_dir.path()).await;
    assert!(result.is_err());
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_login_then_refresh_overwrite() {
    let temp_dir = TempDir::new().unwrap();
    let store = CredentialStore::open(temp_dir.path().join("tokens.db"))
        .await
        .unwrap();

    // Fresh login
    store
        .save("sess-1", &token_set("tok-A", None, 3600), None)
        .await
        .unwrap();

    let first = store.get("sess-1").await.unwrap();
    assert_eq!(first.access_token, "tok-A");
    assert_eq!(first.token_type, "Bearer");
    assert_eq!(first.contract_id, "default");
    assert!(within_seconds(first.expires_at, Utc::now() + Duration::seconds(3600), 5));
    assert!(!is_token_expired(&first));
    assert!(!is_token_near_expiry(&first, DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS));

    // Refresh overwrite
    store
        .save("sess-1", &token_set("tok-B", Some("ref-B"), 7200), None)
        .await
        .unwrap();

    let second = store.get("sess-1").await.unwrap();
    assert_eq!(second.access_token, "tok-B");
    assert_eq!(second.refresh_token.as_deref(), Some("ref-B"));
    assert!(within_seconds(second.expires_at, Utc::now() + Duration::seconds(7200), 5));
    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);

    store.close().await;
}

#[tokio::test]
async fn test_missing_session_is_absent() {
    let temp_dir = TempDir::new().unwrap();
    let store = CredentialStore::open(temp_dir.path().join("tokens.db"))
        .await
        .unwrap();

    assert!(store.get("never-saved").await.is_none());
    assert_eq!(
        store.access_decision("never-saved", 300).await,
        AccessDecision::ReauthenticationRequired
    );
}

#[tokio::test]
async fn test_delete_twice() {
    let temp_dir = TempDir::new().unwrap();
    let store = CredentialStore::open(temp_dir.path().join("tokens.db"))
        .await
        .unwrap();

    store
        .save("sess-1", &token_set("tok-A", None, 3600), None)
        .await
        .unwrap();

    store.delete("sess-1").await.unwrap();
    assert!(store.get("sess-1").await.is_none());
    store.delete("sess-1").await.unwrap();
    assert!(store.get("sess-1").await.is_none());
}

#[tokio::test]
async fn test_access_decisions_follow_expiry() {
    let temp_dir = TempDir::new().unwrap();
    let store = CredentialStore::open(temp_dir.path().join("tokens.db"))
        .await
        .unwrap();

    store
        .save("fresh", &token_set("tok-A", None, 3600), None)
        .await
        .unwrap();
    store
        .save("refreshable", &token_set("tok-B", Some("ref-B"), 200), None)
        .await
        .unwrap();
    store
        .save("stale", &token_set("tok-C", None, 200), None)
        .await
        .unwrap();

    assert!(store.access_decision("fresh", 300).await.is_ready());
    assert_eq!(
        store.access_decision("refreshable", 300).await,
        AccessDecision::RefreshRequired {
            refresh_token: "ref-B".to_string()
        }
    );
    assert_eq!(
        store.access_decision("stale", 300).await,
        AccessDecision::ReauthenticationRequired
    );
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shared_store_across_tasks() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(
        CredentialStore::open(temp_dir.path().join("tokens.db"))
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let id = format!("sess-{i}");
            store
                .save(&id, &token_set(&format!("tok-{i}"), None, 3600), None)
                .await
                .unwrap();
            store.get(&id).await.unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        let record = handle.await.unwrap();
        assert_eq!(record.access_token, format!("tok-{i}"));
    }

    assert_eq!(store.list_sessions().await.unwrap().len(), 8);

    let store = Arc::try_unwrap(store).ok().expect("store still shared");
    store.close().await;
}
