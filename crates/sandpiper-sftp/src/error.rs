//! Error types for the SFTP server.
//!
//! Backend and session errors carry enough context for structured logging,
//! but only a coarse SFTP status code ever reaches the client. The mapping
//! lives in [`Error::status_code`]; the message sent on the wire comes from
//! [`Error::wire_message`] and never includes the underlying cause.

use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds produced by the server.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the local filesystem or network.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH transport error.
    #[error("SSH error: {0}")]
    Ssh(String),

    /// Malformed or unexpected SFTP packet.
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Login failed. Missing users, password mismatches and hashing errors
    /// all collapse into this variant so the client cannot tell them apart.
    #[error("the credentials provided were invalid")]
    InvalidCredentials,

    /// The requested path does not exist. Also covers requests that resolve
    /// outside the configured root, so escape attempts are indistinguishable
    /// from missing files.
    #[error("no such file")]
    NoSuchFile,

    /// The session's permission mask does not allow the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// Method not supported by the backend, or a write on a read-only server.
    #[error("operation unsupported")]
    Unsupported,

    /// The disk-space predicate rejected a write.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Failure reported by a storage backend (S3 request errors, blocking
    /// task failures). The detail is logged, never sent to the client.
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// SFTP status code sent to the client for this error.
    pub fn status_code(&self) -> u32 {
        use crate::protocol::StatusCode;

        match self {
            Error::NoSuchFile => StatusCode::NoSuchFile as u32,
            Error::PermissionDenied => StatusCode::PermissionDenied as u32,
            Error::Unsupported => StatusCode::OpUnsupported as u32,
            Error::QuotaExceeded => StatusCode::QuotaExceeded as u32,
            Error::Protocol(_) => StatusCode::BadMessage as u32,
            _ => StatusCode::Failure as u32,
        }
    }

    /// Message sent in the STATUS reply. Deliberately terse: the full error
    /// stays in the server log.
    pub fn wire_message(&self) -> &'static str {
        match self {
            Error::NoSuchFile => "No such file",
            Error::PermissionDenied => "Permission denied",
            Error::Unsupported => "Operation unsupported",
            Error::QuotaExceeded => "Quota Exceeded",
            Error::Protocol(_) => "Bad message",
            _ => "Failure",
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<russh_keys::Error> for Error {
    fn from(err: russh_keys::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::StatusCode;

    #[test]
    fn status_codes_match_wire_values() {
        assert_eq!(Error::NoSuchFile.status_code(), StatusCode::NoSuchFile as u32);
        assert_eq!(
            Error::PermissionDenied.status_code(),
            StatusCode::PermissionDenied as u32
        );
        assert_eq!(Error::Unsupported.status_code(), StatusCode::OpUnsupported as u32);
        assert_eq!(Error::QuotaExceeded.status_code(), 15);
        assert_eq!(Error::Backend("boom".into()).status_code(), StatusCode::Failure as u32);
    }

    #[test]
    fn wire_messages_do_not_leak_detail() {
        let err = Error::Backend("secret-bucket unreachable".into());
        assert_eq!(err.wire_message(), "Failure");

        let err = Error::Config("path to /etc/sandpiper/users.json".into());
        assert_eq!(err.wire_message(), "Failure");
    }
}
