//! Error taxonomy (spec §7). Local-recoverable failures (subscription
//! fetch/parse, probe attempts, lease cleanup) never propagate past their
//! owning loop; only router/download/lease-upsert errors are surfaced to
//! callers.

use std::io;

use crate::hash::ParseHashError;

/// Errors surfaced by `Router::route_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("platform not found")]
    PlatformNotFound,
    #[error("no available nodes")]
    NoAvailableNodes,
}

/// Errors surfaced by `Router::upsert_lease` (persistence restore path).
#[derive(Debug, thiserror::Error)]
pub enum LeaseUpsertError {
    #[error("platform id must not be empty")]
    InvalidPlatform,
    #[error("account must not be empty")]
    InvalidAccount,
    #[error("invalid node hash: {0}")]
    InvalidHash(#[from] ParseHashError),
    #[error("invalid egress ip: {0}")]
    InvalidIp(String),
}

/// Build/fetch failures on the direct HTTP path (spec §4.8).
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("http status {code} fetching {url}")]
    HttpStatus { code: u16, url: String },
    #[error("non-retryable request error: {0}")]
    NonRetryable(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transport(_) | DownloadError::DeadlineExceeded)
    }
}

impl From<io::Error> for DownloadError {
    fn from(e: io::Error) -> Self {
        DownloadError::Transport(Box::new(e))
    }
}

/// Errors replacing a platform under `Pool::replace_platform`.
#[derive(Debug, thiserror::Error)]
pub enum PlatformRegistrationError {
    #[error("platform name {0:?} is already used by a different platform id")]
    NameConflict(String),
}
