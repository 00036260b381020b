//! Error taxonomy for the sync engine
//!
//! Most code returns `anyhow::Result`; the variants here are attached to the
//! error chain where the caller needs to branch on the kind of failure.

/// Classified failures
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Credentials were rejected; no further progress is possible
    #[error("{service} rejected the credentials (HTTP {status})")]
    Unauthorized { service: &'static str, status: u16 },

    /// The start history id is older than the mailbox retains
    #[error("history id {0} expired or invalid")]
    HistoryExpired(u64),

    /// Configuration that can never work; raised before background work starts
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A notification envelope that could not be decoded
    #[error("malformed notification: {0}")]
    MalformedNotification(String),

    /// The configured watch end time has passed
    #[error("watch end time reached")]
    EndTimeReached,
}

impl WatchError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized { .. } | Self::InvalidConfig(_))
    }
}

/// Whether an error chain contains a fatal [`WatchError`]
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<WatchError>())
        .any(WatchError::is_fatal)
}

/// Map a ureq failure, classifying auth rejections
pub(crate) fn http_error(service: &'static str, err: ureq::Error, what: &str) -> anyhow::Error {
    match err {
        ureq::Error::StatusCode(status @ (401 | 403)) => {
            anyhow::Error::new(WatchError::Unauthorized { service, status }).context(what.to_string())
        }
        other => anyhow::Error::new(other).context(what.to_string()),
    }
}
