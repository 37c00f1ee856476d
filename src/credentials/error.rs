//! Error type for the credential store.

use std::path::PathBuf;

/// Failures surfaced by [`CredentialStore`](super::CredentialStore).
///
/// Initialization failures (`CreateDir`, `Initialization`) are fatal to the
/// owning process. Write failures mean persistence did not happen and the
/// session keeps whatever state it had before the call. Read failures are
/// only returned by the listing operations; `get` absorbs them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to create store directory {}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to initialize token store at {}", path.display())]
    Initialization {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to write token for session {session_id}")]
    Write {
        session_id: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to purge expired tokens")]
    Purge {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to read token store")]
    Read {
        #[source]
        source: rusqlite::Error,
    },

    #[error("Invalid token set: {0}")]
    InvalidTokenSet(String),

    #[error("Storage task did not complete")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;
