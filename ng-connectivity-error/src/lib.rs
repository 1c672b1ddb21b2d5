use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::{error::Error as StdError, io::Error as IoError};
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};

pub type NGResult<T, E = NGError> = anyhow::Result<T, E>;

/// Process-level failures: settings, logger, journal and task plumbing.
///
/// Message-level failures travel as `ConnectivityError` in the sdk crate and
/// are turned into error responses; `NGError` never reaches an external caller.
#[derive(Error, Debug, Default)]
pub enum NGError {
    #[error("service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    StdError(#[from] Box<dyn StdError + Send + Sync>),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Initialization error: {0}")]
    InitializationError(String),
    #[error("Journal error: {0}")]
    JournalError(String),
    #[error("Invalid state error: {0}")]
    InvalidStateError(String),
}

impl From<String> for NGError {
    #[inline]
    fn from(e: String) -> Self {
        NGError::Msg(e)
    }
}

impl From<&str> for NGError {
    #[inline]
    fn from(e: &str) -> Self {
        NGError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for NGError {
    #[inline]
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        NGError::Msg(format!("channel closed: {e}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for NGError {
    #[inline]
    fn from(e: tokio::sync::oneshot::error::RecvError) -> Self {
        NGError::Msg(format!("reply dropped: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_conversions_keep_message() {
        let e: NGError = "boom".into();
        assert_eq!(e.to_string(), "boom");
        let e: NGError = String::from("bang").into();
        assert!(matches!(e, NGError::Msg(ref m) if m == "bang"));
    }

    #[test]
    fn default_is_service_unavailable() {
        assert!(matches!(NGError::default(), NGError::ServiceUnavailable));
    }
}
