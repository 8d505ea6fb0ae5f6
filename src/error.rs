use thiserror::Error;

use crate::store::StoreError;

/// Errors surfaced by the sync engine and its remote collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration. Never retried automatically.
    #[error("configuration error: {0}")]
    Config(String),

    /// Branch, ref or path absent on the remote.
    #[error("not found: {0}")]
    NotFound(String),

    /// The remote rejected a write because its state moved underneath us.
    #[error("conflict: {0}; refresh and retry")]
    Conflict(String),

    /// Server-side merge of the work branch into the main branch conflicted.
    #[error("merge of {head} into {base} conflicts; resolve it upstream")]
    MergeConflict { base: String, head: String },

    /// Credential missing, expired or lacking permission.
    #[error("authentication failed: {0}; sign in again")]
    Auth(String),

    /// Remote content arrived in an encoding we cannot decode.
    #[error("unsupported encoding `{encoding}` for {path}")]
    UnsupportedEncoding { path: String, encoding: String },

    /// Network or server failure. Safe to retry.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote answered with a payload we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

impl SyncError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_) | SyncError::MergeConflict { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }

    /// Whether the scheduler's automatic retry can reasonably succeed.
    /// Configuration, auth and merge failures need the user first.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SyncError::Config(_)
                | SyncError::Auth(_)
                | SyncError::MergeConflict { .. }
                | SyncError::UnsupportedEncoding { .. }
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SyncError::InvalidResponse(e.to_string())
        } else {
            SyncError::Transport(e.to_string())
        }
    }
}

impl From<base64::DecodeError> for SyncError {
    fn from(e: base64::DecodeError) -> Self {
        SyncError::InvalidResponse(format!("bad base64 payload: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy() {
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(SyncError::Conflict("not a fast forward".into()).is_retryable());
        assert!(!SyncError::Config("owner is not set".into()).is_retryable());
        assert!(!SyncError::Auth("401".into()).is_retryable());
        let merge = SyncError::MergeConflict {
            base: "main".into(),
            head: "work".into(),
        };
        assert!(merge.is_conflict());
        assert!(!merge.is_retryable());
    }
}
