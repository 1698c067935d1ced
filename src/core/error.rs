//! Error taxonomy shared by every pipeline stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Coarse classification used for retry decisions and in the run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Validation,
    Configuration,
    Auth,
    TerminalExternal,
    Timeout,
    Cancelled,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Auth => "auth",
            ErrorKind::TerminalExternal => "terminal_external",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network failure, rate limit or 5xx. Safe to retry.
    #[error("Transient failure from {service}: {message}")]
    Transient { service: String, message: String },

    /// Malformed provider output or an input the stage cannot work with.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Authentication rejected by {service}: {message}")]
    Auth { service: String, message: String },

    /// The remote side reported an unrecoverable failure.
    #[error("{service} failed: {message}")]
    TerminalExternal { service: String, message: String },

    #[error("Timed out after {waited_secs}s waiting for {what}")]
    Timeout { what: String, waited_secs: u64 },

    #[error("Cancelled while {what}")]
    Cancelled { what: String },

    #[error("Storage error: {message}")]
    Storage { message: String },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::Transient { .. } => ErrorKind::Transient,
            PipelineError::Validation { .. } => ErrorKind::Validation,
            PipelineError::Configuration { .. } => ErrorKind::Configuration,
            PipelineError::Auth { .. } => ErrorKind::Auth,
            PipelineError::TerminalExternal { .. } => ErrorKind::TerminalExternal,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::Cancelled { .. } => ErrorKind::Cancelled,
            PipelineError::Storage { .. } => ErrorKind::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        PipelineError::Storage {
            message: message.into(),
        }
    }

    /// Maps a non-success HTTP status onto the taxonomy.
    pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let service = service.to_string();
        let message = format!("HTTP {}: {}", status.as_u16(), truncate(body, 500));
        match status.as_u16() {
            401 | 403 => PipelineError::Auth { service, message },
            408 | 429 => PipelineError::Transient { service, message },
            code if code >= 500 => PipelineError::Transient { service, message },
            _ => PipelineError::TerminalExternal { service, message },
        }
    }

    /// Classifies a transport error. Connect failures and timeouts are worth retrying.
    pub fn from_reqwest(service: &str, err: reqwest::Error) -> Self {
        let service = service.to_string();
        if let Some(status) = err.status() {
            return Self::from_status(&service, status, &err.to_string());
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            PipelineError::Transient {
                service,
                message: err.to_string(),
            }
        } else if err.is_decode() {
            PipelineError::Validation {
                message: format!("{} returned an unreadable body: {}", service, err),
            }
        } else {
            PipelineError::TerminalExternal {
                service,
                message: err.to_string(),
            }
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Storage {
            message: format!("record store: {}", err),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Validation {
            message: format!("invalid JSON: {}", err),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        let err = PipelineError::from_status("llm", StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = PipelineError::from_status("llm", StatusCode::BAD_GATEWAY, "");
        assert!(err.is_retryable());

        let err = PipelineError::from_status("llm", StatusCode::UNAUTHORIZED, "bad key");
        assert_eq!(err.kind(), ErrorKind::Auth);

        let err = PipelineError::from_status("llm", StatusCode::FORBIDDEN, "");
        assert_eq!(err.kind(), ErrorKind::Auth);

        let err = PipelineError::from_status("llm", StatusCode::BAD_REQUEST, "no");
        assert_eq!(err.kind(), ErrorKind::TerminalExternal);
    }

    #[test]
    fn test_display_messages() {
        let err = PipelineError::Timeout {
            what: "speech synthesis job abc".to_string(),
            waited_secs: 1800,
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 1800s waiting for speech synthesis job abc"
        );

        let err = PipelineError::validation("missing transition 2→3");
        assert_eq!(err.to_string(), "Validation failed: missing transition 2→3");
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = io.into();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::TerminalExternal).unwrap();
        assert_eq!(json, "\"terminal_external\"");
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_body_is_truncated() {
        let body = "x".repeat(2000);
        let err = PipelineError::from_status("speech", StatusCode::BAD_REQUEST, &body);
        assert!(err.to_string().len() < 700);
    }
}
