//! Unified error handling for savesync.
//!
//! The taxonomy mirrors how failures are handled at runtime: only a
//! configuration failure at startup is fatal, auth failures are recoverable
//! through refresh or re-authorization, and remote failures carry a
//! classification that drives the engine's retry policy.

use std::io;

use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Configuration errors. Fatal when raised during startup.
    #[error("configuration error: {message}")]
    Config {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Credential lifecycle errors.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Remote store errors, pre-classified for the retry policy.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Local filesystem errors.
    #[error("filesystem error: {message} (path: {path})")]
    Filesystem {
        message: String,
        path: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl SyncError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn filesystem(
        message: impl Into<String>,
        path: impl Into<String>,
        source: io::Error,
    ) -> Self {
        Self::Filesystem {
            message: message.into(),
            path: path.into(),
            source: Some(Box::new(source)),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Errors raised by the OAuth credential lifecycle.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("not authorized: no usable access token")]
    NotAuthorized,

    #[error("no refresh token stored")]
    NoRefreshToken,

    #[error("static bearer token was rejected and cannot be refreshed")]
    StaticToken,

    #[error("authorization denied by provider: {0}")]
    Denied(String),

    #[error("authorization timed out after {0} seconds")]
    Timeout(u64),

    #[error("could not bind the callback listener on port {port}")]
    ListenerBind { port: u16 },

    #[error("callback listener closed before an outcome was received")]
    ListenerClosed,

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: u16, body: String },

    #[error("token response did not contain an access token")]
    MalformedResponse,

    #[error("token request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Classified outcome of a remote store call.
///
/// The classification, not the underlying transport error, is what the
/// engine acts on: `NotFound` is benign, `AuthExpired` earns exactly one
/// refresh-and-retry, `Transient` and `Fatal` abandon the current cycle.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("remote file not found")]
    NotFound,

    #[error("bearer credential rejected by the remote store")]
    AuthExpired,

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote request rejected: {0}")]
    Fatal(String),
}
