use http::Method;
use std::{error::Error as StdError, io, path::PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    Transport,
    BodyUsed,
    Storage,
    Encode,
    Policy,
    InvalidConfig,
    Task,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    /// A redirect was returned for a request whose redirect mode is `error`.
    Redirect,
    Other,
}

/// All errors returned by the crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Transport error during {method} {path}: {source}")]
    Transport {
        method: Method,
        path: Box<str>,
        kind: TransportErrorKind,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The request body stream was already read and cannot be read or cloned again.
    #[error("Request body already used")]
    BodyUsed,

    #[error("Storage error: {message}")]
    Storage {
        message: Box<str>,
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode queue entry: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Request refused by policy: {message}")]
    Policy { message: Box<str> },

    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        message: Box<str>,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },

    #[error("Background task failed: {source}")]
    Task {
        #[source]
        source: tokio::task::JoinError,
    },
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::BodyUsed => ErrorKind::BodyUsed,
            Self::Storage { .. } => ErrorKind::Storage,
            Self::Encode { .. } => ErrorKind::Encode,
            Self::Policy { .. } => ErrorKind::Policy,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::Task { .. } => ErrorKind::Task,
        }
    }

    /// `true` when the request never produced a response from the server.
    ///
    /// Only these errors send a submission to the retry queue, and only these
    /// keep a queued entry for the next replay.
    #[must_use]
    pub fn is_network_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Timeout
                    | TransportErrorKind::Connect
                    | TransportErrorKind::Other,
                ..
            }
        )
    }

    /// `true` when the server answered but the answer was refused locally
    /// (a redirect under redirect mode `error`). The request was delivered.
    #[must_use]
    pub fn response_received(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Redirect,
                ..
            }
        )
    }

    pub(crate) fn storage(
        message: impl Into<Box<str>>,
        path: Option<PathBuf>,
        source: io::Error,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            path,
            source,
        }
    }

    pub(crate) fn policy(message: impl Into<Box<str>>) -> Self {
        Self::Policy {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<Box<str>>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            source: None,
        }
    }
}
