//! Token storage using SQLite.
//!
//! Stores one row per session id. Token material is stored as-is; the
//! database file is protected by filesystem permissions only.

use super::{AccessDecision, Result, StoreError, TokenRecord, TokenSet};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

const SELECT_COLUMNS: &str = "id, access_token, refresh_token, token_type, expires_at, \
                              scope, id_token, contract_id, created_at, updated_at";

/// Summary of the stored tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub token_count: u64,
    pub expired_count: u64,
    /// Distinct contract ids, sorted
    pub contract_ids: Vec<String>,
}

/// Session token storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE tokens (
///     id            TEXT PRIMARY KEY,
///     access_token  TEXT NOT NULL,
///     refresh_token TEXT,
///     token_type    TEXT NOT NULL,
///     expires_at    DATETIME NOT NULL,  -- RFC 3339, UTC, millisecond precision
///     scope         TEXT NOT NULL,
///     id_token      TEXT,
///     contract_id   TEXT NOT NULL,
///     created_at    DATETIME NOT NULL,
///     updated_at    DATETIME NOT NULL
/// );
/// ```
///
/// # Concurrency
/// - The store owns its connection for the lifetime of the process
/// - Every I/O operation runs on tokio's blocking pool and is awaited
/// - Each call is a single statement; there is no locking across calls
/// - No inter-process lock is taken on the database file
pub struct CredentialStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl CredentialStore {
    /// Opens (or creates) the store at `db_path`.
    ///
    /// Missing parent directories are created. Re-opening an existing store
    /// keeps its contents.
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || open_connection(&path)).await??
        };

        info!(path = %path.display(), "Token table initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Creates a store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        let path = PathBuf::from(":memory:");
        let conn = Connection::open_in_memory()
            .and_then(|conn| create_schema(&conn).map(|_| conn))
            .map_err(|source| StoreError::Initialization {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Location of the backing database.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saves the token set for a session.
    ///
    /// A first save inserts the record; later saves for the same id
    /// overwrite every mutable field and `updated_at`, leaving `created_at`
    /// as it was. `contract_id` defaults to `"default"`.
    ///
    /// # Returns
    /// * `Ok(())` - Token persisted
    /// * `Err(StoreError::InvalidTokenSet)` - Empty session id or access token
    /// * `Err(StoreError::Write)` - Nothing was written
    pub async fn save(
        &self,
        id: &str,
        token_set: &TokenSet,
        contract_id: Option<&str>,
    ) -> Result<()> {
        if id.trim().is_empty() {
            return Err(StoreError::InvalidTokenSet(
                "session id must not be empty".to_string(),
            ));
        }
        token_set.validate()?;

        let record = TokenRecord::from_token_set(id, token_set, contract_id, Utc::now());
        let expires_at = record.expires_at;
        let contract_id = record.contract_id.clone();

        self.with_conn(move |conn| {
            upsert(conn, &record).map_err(|source| StoreError::Write {
                session_id: record.id.clone(),
                source,
            })
        })
        .await
        .inspect_err(|e| error!(session_id = %id, error = ?e, "Failed to save token"))?;

        info!(
            session_id = %id,
            contract_id = %contract_id,
            expires_at = %expires_at,
            "Token saved"
        );
        Ok(())
    }

    /// Fetches the record for a session.
    ///
    /// Returns `None` when nothing is stored. A storage failure is logged
    /// and also reported as `None`: either way the caller has no usable
    /// credential and must re-authenticate.
    pub async fn get(&self, id: &str) -> Option<TokenRecord> {
        let session_id = id.to_string();
        let result = self
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {SELECT_COLUMNS} FROM tokens WHERE id = ?1"),
                    params![session_id],
                    record_from_row,
                )
                .optional()
                .map_err(|source| StoreError::Read { source })
            })
            .await;

        match result {
            Ok(Some(record)) => {
                debug!(session_id = %id, "Token found");
                Some(record)
            }
            Ok(None) => {
                debug!(session_id = %id, "No token stored");
                None
            }
            Err(e) => {
                error!(session_id = %id, error = ?e, "Failed to get token");
                None
            }
        }
    }

    /// Deletes the record for a session. Deleting a missing id succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let session_id = id.to_string();
        let rows_affected = self
            .with_conn(move |conn| {
                let result = conn.execute("DELETE FROM tokens WHERE id = ?1", params![session_id]);
                result.map_err(|source| StoreError::Write { session_id, source })
            })
            .await
            .inspect_err(|e| error!(session_id = %id, error = ?e, "Failed to delete token"))?;

        if rows_affected > 0 {
            info!(session_id = %id, "Token deleted");
        } else {
            debug!(session_id = %id, "No token to delete");
        }
        Ok(())
    }

    /// Fetches the session's record and decides how the caller may use it.
    pub async fn access_decision(&self, id: &str, threshold_secs: i64) -> AccessDecision {
        let record = self.get(id).await;
        let decision = AccessDecision::evaluate(record.as_ref(), Utc::now(), threshold_secs);
        debug!(session_id = %id, decision = decision.kind(), "Access decision");
        decision
    }

    /// Lists every stored session id, sorted.
    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM tokens ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
        .await
    }

    /// Returns the records stored under a contract id, most recently
    /// updated first.
    pub async fn find_by_contract(&self, contract_id: &str) -> Result<Vec<TokenRecord>> {
        let contract_id = contract_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM tokens WHERE contract_id = ?1 \
                 ORDER BY updated_at DESC, id"
            ))?;
            let records = stmt
                .query_map(params![contract_id], record_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(records)
        })
        .await
    }

    /// Removes every record whose expiry is at or before now.
    ///
    /// Only runs when called; the store never evicts on its own.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = format_timestamp(Utc::now());
        let removed = self
            .with_conn(move |conn| {
                conn.execute("DELETE FROM tokens WHERE expires_at <= ?1", params![now])
                    .map_err(|source| StoreError::Purge { source })
            })
            .await?;

        info!(removed, "Expired tokens purged");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let now = format_timestamp(Utc::now());
        self.with_conn(move |conn| {
            let token_count: i64 =
                conn.query_row("SELECT COUNT(*) FROM tokens", [], |row| row.get(0))?;
            let expired_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM tokens WHERE expires_at <= ?1",
                params![now],
                |row| row.get(0),
            )?;
            let mut stmt =
                conn.prepare("SELECT DISTINCT contract_id FROM tokens ORDER BY contract_id")?;
            let contract_ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;

            Ok(StoreStats {
                token_count: token_count.max(0) as u64,
                expired_count: expired_count.max(0) as u64,
                contract_ids,
            })
        })
        .await
    }

    /// Releases the database handle.
    ///
    /// Failures are logged, never returned: there is nothing a caller can
    /// do about them at shutdown.
    pub async fn close(self) {
        let path = self.path;
        let conn = self.conn;

        let result = tokio::task::spawn_blocking(move || match Arc::try_unwrap(conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().unwrap_or_else(PoisonError::into_inner);
                conn.close().map_err(|(_, e)| e).map(|_| true)
            }
            // An abandoned blocking task still holds the handle; it is
            // released when that task finishes.
            Err(_) => Ok(false),
        })
        .await;

        match result {
            Ok(Ok(true)) => info!(path = %path.display(), "Token store closed"),
            Ok(Ok(false)) => {
                warn!(path = %path.display(), "Token store still in use, handle released later")
            }
            Ok(Err(e)) => error!(path = %path.display(), error = %e, "Failed to close token store"),
            Err(e) => error!(path = %path.display(), error = %e, "Close task did not complete"),
        }
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = lock(&conn);
            f(&*guard)
        })
        .await?
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        StoreError::Read { source }
    }
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|source| StoreError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
            info!(path = %dir.display(), "Created store directory");
        }
    }

    let init = |source: rusqlite::Error| StoreError::Initialization {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open(path).map_err(init)?;
    create_schema(&conn).map_err(init)?;
    Ok(conn)
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tokens (
            id            TEXT PRIMARY KEY,
            access_token  TEXT NOT NULL,
            refresh_token TEXT,
            token_type    TEXT NOT NULL,
            expires_at    DATETIME NOT NULL,
            scope         TEXT NOT NULL,
            id_token      TEXT,
            contract_id   TEXT NOT NULL,
            created_at    DATETIME NOT NULL,
            updated_at    DATETIME NOT NULL
        );",
    )
}

/// Inserts a new row or overwrites the mutable fields of an existing one.
/// `created_at` is only ever written by the insert.
fn upsert(conn: &Connection, record: &TokenRecord) -> rusqlite::Result<usize> {
    conn.execute(
        r#"
        INSERT INTO tokens (
            id, access_token, refresh_token, token_type, expires_at,
            scope, id_token, contract_id, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            token_type = excluded.token_type,
            expires_at = excluded.expires_at,
            scope = excluded.scope,
            id_token = excluded.id_token,
            contract_id = excluded.contract_id,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id,
            record.access_token,
            record.refresh_token,
            record.token_type,
            format_timestamp(record.expires_at),
            record.scope,
            record.id_token,
            record.contract_id,
            format_timestamp(record.created_at),
            format_timestamp(record.updated_at),
        ],
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TokenRecord> {
    Ok(TokenRecord {
        id: row.get(0)?,
        access_token: row.get(1)?,
        refresh_token: row.get(2)?,
        token_type: row.get(3)?,
        expires_at: timestamp_column(row, 4)?,
        scope: row.get(5)?,
        id_token: row.get(6)?,
        contract_id: row.get(7)?,
        created_at: timestamp_column(row, 8)?,
        updated_at: timestamp_column(row, 9)?,
    })
}

/// Fixed-width UTC form so stored instants compare correctly as text.
fn format_timestamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
