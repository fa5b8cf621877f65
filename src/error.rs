//! Error types for the offline download subsystem
//!
//! Errors are grouped by the component that raises them. The coordination
//! layer turns every long-running failure into a failed record with a
//! human-readable message (see [`OfflineError::user_message`]); only
//! precondition failures are returned directly to callers.
//!
//! ## Categories
//!
//! ### Transfer (orchestration)
//! - `InsufficientStorage` - checked before a download starts, never retried
//! - `NetworkError` - transport failure, retried when `is_transient`
//! - `InvalidServerResponse` - non-2xx status or undecodable body, never retried
//! - `Cancelled` - cooperative cancellation, distinct from failure
//!
//! ### Integrity (validation/healing)
//! - `IntegrityCheckFailed` - raised after the fact, never by a transfer
//!
//! ### Caller misuse
//! - `NoCredentials` / `NotConfigured`

use thiserror::Error;

/// Result type alias using our OfflineError type
pub type Result<T> = std::result::Result<T, OfflineError>;

/// Main error type for the offline subsystem
#[derive(Error, Debug)]
pub enum OfflineError {
    // ===== Transfer Errors =====

    /// Not enough free space to start a download
    #[error("Insufficient storage (need {required} bytes, have {available} bytes)")]
    InsufficientStorage {
        required: u64,
        available: u64,
    },

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient (timeout, connection lost)
        is_transient: bool,
    },

    /// Server answered with a non-2xx status or a body we could not use
    #[error("Invalid server response: {message}")]
    InvalidServerResponse {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
    },

    /// Operation was cancelled by user or system
    #[error("Download cancelled")]
    Cancelled,

    // ===== Integrity Errors =====

    /// On-disk book directory failed validation
    #[error("Integrity check failed for book {book_id}: {reason}")]
    IntegrityCheckFailed {
        book_id: String,
        reason: String,
    },

    // ===== Configuration/State Errors =====

    /// No bearer token available for authenticated requests
    #[error("No credentials available")]
    NoCredentials,

    /// No server configured
    #[error("Not configured: {0}")]
    NotConfigured(String),

    /// Book data cannot be downloaded or stored as given
    #[error("Invalid book: {0}")]
    InvalidBook(String),

    /// Configuration is invalid or incomplete
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ===== File Errors =====

    /// Generic file I/O error with path context
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Configuration file parse error
    #[error("Configuration parse error: {0}")]
    TomlError(#[from] toml::de::Error),

    /// URL construction error
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return OfflineError::network_error(err.to_string(), true);
        }

        if let Some(status) = err.status() {
            return OfflineError::invalid_response(err.to_string(), Some(status.as_u16()));
        }

        if err.is_decode() {
            return OfflineError::invalid_response(err.to_string(), None);
        }

        OfflineError::network_error(err.to_string(), false)
    }
}

// Helper methods for creating common errors
impl OfflineError {
    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        OfflineError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create an InvalidServerResponse error
    pub fn invalid_response<S: Into<String>>(message: S, status_code: Option<u16>) -> Self {
        OfflineError::InvalidServerResponse {
            message: message.into(),
            status_code,
        }
    }

    /// Create an IntegrityCheckFailed error
    pub fn integrity<S: Into<String>, R: Into<String>>(book_id: S, reason: R) -> Self {
        OfflineError::IntegrityCheckFailed {
            book_id: book_id.into(),
            reason: reason.into(),
        }
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        OfflineError::InternalError(message.into())
    }

    /// Check if error is retryable
    ///
    /// Only transient network failures qualify. Server responses, storage
    /// shortfalls and cancellation are final for the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfflineError::NetworkError { is_transient: true, .. }
        )
    }

    /// Check if error represents a cooperative cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OfflineError::Cancelled)
    }

    /// Check if error is related to file/disk operations
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            OfflineError::FileIoError(_)
                | OfflineError::IoError(_)
                | OfflineError::InsufficientStorage { .. }
        )
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            OfflineError::InsufficientStorage { required, available } => {
                format!(
                    "Not enough storage space. Need {} MB, but only {} MB available.",
                    required / 1_000_000,
                    available / 1_000_000
                )
            }
            OfflineError::NetworkError { is_transient: true, .. } => {
                "The connection was interrupted. Please check your network and try again.".to_string()
            }
            OfflineError::InvalidServerResponse { status_code: Some(401), .. }
            | OfflineError::InvalidServerResponse { status_code: Some(403), .. } => {
                "The server rejected your credentials. Please log in again.".to_string()
            }
            OfflineError::InvalidServerResponse { status_code: Some(404), .. } => {
                "This book is no longer available on the server.".to_string()
            }
            OfflineError::NoCredentials | OfflineError::NotConfigured(_) => {
                "No server is configured. Please log in first.".to_string()
            }
            OfflineError::Cancelled => "Download cancelled.".to_string(),
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_network_errors_are_retryable() {
        assert!(OfflineError::network_error("timed out", true).is_retryable());
        assert!(!OfflineError::network_error("tls handshake", false).is_retryable());
        assert!(!OfflineError::invalid_response("HTTP 503", Some(503)).is_retryable());
        assert!(!OfflineError::Cancelled.is_retryable());
        assert!(!OfflineError::InsufficientStorage { required: 1, available: 0 }.is_retryable());
    }

    #[test]
    fn test_file_errors() {
        assert!(OfflineError::FileIoError("disk full".to_string()).is_file_error());
        assert!(OfflineError::InsufficientStorage { required: 1, available: 0 }.is_file_error());
        assert!(!OfflineError::network_error("reset", true).is_file_error());
        assert!(!OfflineError::Cancelled.is_file_error());
    }

    #[test]
    fn test_user_message_for_storage() {
        let err = OfflineError::InsufficientStorage {
            required: 500_000_000,
            available: 100_000_000,
        };
        assert_eq!(
            err.user_message(),
            "Not enough storage space. Need 500 MB, but only 100 MB available."
        );
    }

    #[test]
    fn test_user_message_falls_back_to_display() {
        let err = OfflineError::integrity("book-1", "manifest missing");
        assert_eq!(
            err.user_message(),
            "Integrity check failed for book book-1: manifest missing"
        );
    }
}
