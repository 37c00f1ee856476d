//! Persistent storage and lifecycle evaluation for OAuth session tokens.
//!
//! The OAuth exchange flow saves the token set it obtained under a session
//! id; the authenticated API dispatch layer fetches it again and asks
//! whether it is expired or about to expire.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - save / get / delete                   │
//! │  - listing, purge, stats                 │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!   (TokenSet in)        (TokenRecord out)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - one `tokens` table keyed by session   │
//! │  - RFC 3339 timestamps                   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Expiry is a classification, never a deletion trigger: records stay in
//! the table until they are deleted or explicitly purged.
//!
//! # Usage
//!
//! ```no_run
//! use credstore::credentials::{CredentialStore, TokenSet};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = CredentialStore::open("data/credstore.db").await?;
//!
//! let token_set = TokenSet {
//!     access_token: "tok-A".to_string(),
//!     expires_in: Some(3600),
//!     ..Default::default()
//! };
//! store.save("sess-1", &token_set, None).await?;
//!
//! if let Some(record) = store.get("sess-1").await {
//!     if record.is_near_expiry(300) {
//!         println!("refresh soon");
//!     }
//! }
//!
//! store.close().await;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Datelike, Duration, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

mod access;
mod error;
mod storage;


pub use access::AccessDecision;
pub use error::{Result, StoreError};
pub use storage::{CredentialStore, StoreStats};

/// Token type recorded when the issuer did not send one.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Contract id recorded when the caller did not supply one.
pub const DEFAULT_CONTRACT_ID: &str = "default";

/// Token lifetime assumed when the token set carries no expiry at all.
pub const DEFAULT_LIFETIME_SECS: i64 = 3600;

/// Lookahead window used to decide on a proactive refresh.
pub const DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS: i64 = 300;

/// Years a stored RFC 3339 timestamp can be parsed back from.
const STORABLE_YEARS: std::ops::RangeInclusive<i32> = 1..=9999;

/// Absolute expiry as sent by the token issuer.
///
/// Issuers send either epoch seconds or an already formatted instant.
/// Fractional seconds are truncated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ExpiresAt {
    EpochSeconds(i64),
    Instant(DateTime<Utc>),
}

impl<'de> Deserialize<'de> for ExpiresAt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(Seconds),
            Instant(DateTime<Utc>),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => ExpiresAt::EpochSeconds(secs.whole()),
            Raw::Instant(instant) => ExpiresAt::Instant(instant),
        })
    }
}

/// A JSON number of seconds, integral or not.
#[derive(Deserialize)]
#[serde(untagged)]
enum Seconds {
    Whole(i64),
    Fractional(f64),
}

impl Seconds {
    fn whole(self) -> i64 {
        match self {
            Seconds::Whole(secs) => secs,
            // `as` saturates at the i64 bounds
            Seconds::Fractional(secs) => secs.trunc() as i64,
        }
    }
}

fn deserialize_optional_seconds<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    Ok(Option::<Seconds>::deserialize(deserializer)?.map(Seconds::whole))
}

/// Token material produced by an OAuth exchange or refresh.
///
/// Mirrors a standard token endpoint response. Only `access_token` is
/// required.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<ExpiresAt>,

    /// Lifetime in seconds, relative to the moment of saving.
    #[serde(
        default,
        deserialize_with = "deserialize_optional_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<i64>,
}

impl TokenSet {
    /// Checks the fields the store cannot default.
    pub fn validate(&self) -> Result<()> {
        if self.access_token.trim().is_empty() {
            return Err(StoreError::InvalidTokenSet(
                "access_token must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Computes the absolute expiry instant.
    ///
    /// An explicit `expires_at` wins over `expires_in`; with neither, the
    /// token is assumed to live for [`DEFAULT_LIFETIME_SECS`]. Instants
    /// outside years 1-9999 cannot be read back from storage and also get
    /// the default. The result is truncated to milliseconds, the stored
    /// precision.
    pub fn resolve_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let resolved = match (self.expires_at, self.expires_in) {
            (Some(ExpiresAt::EpochSeconds(secs)), _) => Utc.timestamp_opt(secs, 0).single(),
            (Some(ExpiresAt::Instant(instant)), _) => Some(instant),
            (None, Some(secs)) => offset(now, secs),
            (None, None) => return default_expiry(now),
        };

        match resolved.filter(|instant| STORABLE_YEARS.contains(&instant.year())) {
            Some(instant) => instant.trunc_subsecs(3),
            None => {
                tracing::warn!(
                    expires_at = ?self.expires_at,
                    expires_in = ?self.expires_in,
                    "Out of range expiry, using default lifetime"
                );
                default_expiry(now)
            }
        }
    }

    /// Token type with the bearer default applied.
    pub fn token_type_or_default(&self) -> &str {
        non_empty(self.token_type.as_deref()).unwrap_or(DEFAULT_TOKEN_TYPE)
    }

    pub fn scope_or_default(&self) -> &str {
        self.scope.as_deref().unwrap_or("")
    }

    pub fn refresh_token(&self) -> Option<&str> {
        non_empty(self.refresh_token.as_deref())
    }

    pub fn id_token(&self) -> Option<&str> {
        non_empty(self.id_token.as_deref())
    }
}

/// One session's stored credential material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Session identifier (primary key)
    pub id: String,

    pub access_token: String,

    pub refresh_token: Option<String>,

    pub token_type: String,

    /// Absolute expiry instant (UTC)
    pub expires_at: DateTime<Utc>,

    /// Granted scopes, empty when unknown
    pub scope: String,

    pub id_token: Option<String>,

    /// Tenant discriminator, [`DEFAULT_CONTRACT_ID`] when not supplied
    pub contract_id: String,

    /// Set at first insert, never changed afterwards
    pub created_at: DateTime<Utc>,

    /// Refreshed on every save
    pub updated_at: DateTime<Utc>,
}

/// Time-based classification of a stored token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Fresh,
    NearExpiry,
    Expired,
}

impl std::fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenStatus::Fresh => "fresh",
            TokenStatus::NearExpiry => "near_expiry",
            TokenStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

impl TokenRecord {
    /// Builds the record a save at `now` would persist for a new session.
    ///
    /// Applies the defaults for every optional field and resolves the
    /// expiry to an absolute instant.
    pub fn from_token_set(
        id: &str,
        token_set: &TokenSet,
        contract_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            id: id.to_string(),
            access_token: token_set.access_token.clone(),
            refresh_token: token_set.refresh_token().map(str::to_string),
            token_type: token_set.token_type_or_default().to_string(),
            expires_at: token_set.resolve_expiry(now),
            scope: token_set.scope_or_default().to_string(),
            id_token: token_set.id_token().map(str::to_string),
            contract_id: contract_id_or_default(contract_id).to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        is_token_expired(self)
    }

    pub fn is_near_expiry(&self, threshold_secs: i64) -> bool {
        is_token_near_expiry(self, threshold_secs)
    }

    pub fn status(&self, threshold_secs: i64) -> TokenStatus {
        self.status_at(Utc::now(), threshold_secs)
    }

    /// Classifies the token against `now`. Expired takes precedence.
    pub fn status_at(&self, now: DateTime<Utc>, threshold_secs: i64) -> TokenStatus {
        if is_token_expired_at(self, now) {
            TokenStatus::Expired
        } else if is_token_near_expiry_at(self, now, threshold_secs) {
            TokenStatus::NearExpiry
        } else {
            TokenStatus::Fresh
        }
    }
}

/// True when the token's expiry is at or before the current time.
pub fn is_token_expired(record: &TokenRecord) -> bool {
    is_token_expired_at(record, Utc::now())
}

pub fn is_token_expired_at(record: &TokenRecord, now: DateTime<Utc>) -> bool {
    record.expires_at <= now
}

/// True when the token expires within `threshold_secs` from now.
///
/// Callers use this to refresh before the token actually lapses. See
/// [`DEFAULT_NEAR_EXPIRY_THRESHOLD_SECS`].
pub fn is_token_near_expiry(record: &TokenRecord, threshold_secs: i64) -> bool {
    is_token_near_expiry_at(record, Utc::now(), threshold_secs)
}

pub fn is_token_near_expiry_at(
    record: &TokenRecord,
    now: DateTime<Utc>,
    threshold_secs: i64,
) -> bool {
    match offset(now, threshold_secs) {
        Some(limit) => record.expires_at <= limit,
        // Window reaches past the representable range
        None => threshold_secs > 0,
    }
}

fn offset(now: DateTime<Utc>, secs: i64) -> Option<DateTime<Utc>> {
    Duration::try_seconds(secs).and_then(|d| now.checked_add_signed(d))
}

fn default_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    (now + Duration::seconds(DEFAULT_LIFETIME_SECS)).trunc_subsecs(3)
}

/// Normalizes a caller-supplied contract id.
pub(crate) fn contract_id_or_default(contract_id: Option<&str>) -> &str {
    non_empty(contract_id).unwrap_or(DEFAULT_CONTRACT_ID)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
