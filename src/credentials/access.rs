//! What an authenticated call may do with a session's stored token.

use super::{TokenRecord, TokenStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome of checking a session before an authenticated API call.
///
/// A missing record, an unreadable one and an expired one without a
/// refresh token all end up as `ReauthenticationRequired`: downstream
/// consumers cannot tell them apart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AccessDecision {
    /// Token can be used as-is.
    Ready {
        access_token: String,
        token_type: String,
    },
    /// Token is expired or about to be; refresh it first.
    RefreshRequired { refresh_token: String },
    /// No usable credential; the user has to log in again.
    ReauthenticationRequired,
}

impl AccessDecision {
    pub fn evaluate(
        record: Option<&TokenRecord>,
        now: DateTime<Utc>,
        threshold_secs: i64,
    ) -> Self {
        let Some(record) = record else {
            return AccessDecision::ReauthenticationRequired;
        };

        match record.status_at(now, threshold_secs) {
            TokenStatus::Fresh => AccessDecision::Ready {
                access_token: record.access_token.clone(),
                token_type: record.token_type.clone(),
            },
            TokenStatus::NearExpiry | TokenStatus::Expired => match &record.refresh_token {
                Some(refresh_token) => AccessDecision::RefreshRequired {
                    refresh_token: refresh_token.clone(),
                },
                None => AccessDecision::ReauthenticationRequired,
            },
        }
    }

    /// Short name for logs; never includes token material.
    pub fn kind(&self) -> &'static str {
        match self {
            AccessDecision::Ready { .. } => "ready",
            AccessDecision::RefreshRequired { .. } => "refresh_required",
            AccessDecision::ReauthenticationRequired => "reauthentication_required",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, AccessDecision::Ready { .. })
    }
}
