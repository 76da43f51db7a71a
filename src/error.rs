use reqwest::StatusCode;
use std::fmt;

/// Distinguishable transport-level failure classes surfaced by the shared
/// HTTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Timeout,
    ConnectionReset,
    Dns,
    Tls,
    Aborted,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::ConnectionReset => "connection reset",
            Self::Dns => "dns",
            Self::Tls => "tls",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptErrorKind {
    /// PKCS#7 unpadding failed. Often a truncated body rather than bad key
    /// material, so the worker retries this once.
    BadPadding,
    /// The key server returned something other than 16 bytes.
    BadKeyLength,
}

impl fmt::Display for DecryptErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadPadding => f.write_str("bad padding"),
            Self::BadKeyLength => f.write_str("bad key length"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("download cancelled")]
    Cancelled,

    #[error("network error ({kind}) for {url}")]
    Network { kind: NetworkErrorKind, url: String },

    #[error("request failed with HTTP {status} for {url}")]
    Http { status: StatusCode, url: String },

    #[error("malformed playlist: {reason}")]
    MalformedPlaylist { reason: String },

    #[error("master playlists are not supported; the caller must pre-select a variant")]
    MasterPlaylistNotSupported,

    #[error("live playlists are not supported (missing #EXT-X-ENDLIST)")]
    LivePlaylistNotSupported,

    #[error("decryption failed: {kind}")]
    Decrypt { kind: DecryptErrorKind },

    #[error("segment {index} failed validation: {reason}")]
    Validation { index: usize, reason: String },

    #[error("journal entry discarded: {reason}")]
    JournalCorruption { reason: String },

    #[error("muxer exited with code {exit:?}: {stderr_tail}")]
    Muxer {
        exit: Option<i32>,
        stderr_tail: String,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("task `{id}` is already active")]
    TaskExists { id: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl EngineError {
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn malformed_playlist(reason: impl Into<String>) -> Self {
        Self::MalformedPlaylist {
            reason: reason.into(),
        }
    }

    /// Whether the segment worker may retry after this error.
    ///
    /// `Decrypt(BadPadding)` is nominally retryable but the worker caps it at
    /// a single retry; everything else follows the table in the error design.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::MalformedPlaylist { .. }
            | Self::MasterPlaylistNotSupported
            | Self::LivePlaylistNotSupported
            | Self::Muxer { .. }
            | Self::TaskExists { .. }
            | Self::JournalCorruption { .. } => false,
            Self::Http { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Decrypt { kind } => *kind == DecryptErrorKind::BadPadding,
            Self::Network { .. } | Self::Validation { .. } | Self::Io { .. } => true,
            Self::Internal { .. } => true,
        }
    }
}
