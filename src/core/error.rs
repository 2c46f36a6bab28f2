use thiserror::Error;

use crate::parser::ParseError;

/// Server-side error kinds. Each carries enough to build the frontend
/// protocol error packet (severity, SQLSTATE, message).
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("{0}")]
    Parse(#[from] ParseError),
    #[error("Access denied: {0}")]
    PermissionDenied(String),
    #[error("Attempt to write in a readonly transaction")]
    ReadOnlyViolation,
    #[error("Database is busy: {0}")]
    Busy(String),
    #[error("Unique violation: {0}")]
    UniqueViolation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    File(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Implicit commit failed: {0}")]
    ImplicitCommit(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("{0}")]
    Timeout(String),
    #[error("Query canceled")]
    Canceled,
    #[error("{0}")]
    Engine(rusqlite::Error),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Fatal(String),
}

impl ServerError {
    /// The canonical SQLSTATE sent in an error packet.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            ServerError::Parse(_) => "42601",
            ServerError::PermissionDenied(_) => "42501",
            ServerError::ReadOnlyViolation => "25006",
            ServerError::Busy(_) => "55P03",
            ServerError::UniqueViolation(_) => "23505",
            ServerError::Io(_) => "58030",
            ServerError::File(_) => "58030",
            ServerError::Protocol(_) => "08P01",
            ServerError::ImplicitCommit(_) => "40002",
            ServerError::Network(_) => "08006",
            ServerError::Timeout(_) => "53400",
            ServerError::Canceled => "57014",
            ServerError::Engine(_) => "HY000",
            ServerError::Internal(_) => "XX000",
            ServerError::Fatal(_) => "XX000",
        }
    }

    /// True when the statement failed but the connection stays usable.
    /// Channel errors and fatal states close the connection.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            ServerError::Io(_)
                | ServerError::Network(_)
                | ServerError::Protocol(_)
                | ServerError::Fatal(_)
        )
    }
}

impl From<rusqlite::Error> for ServerError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        if let rusqlite::Error::SqliteFailure(err, message) = &e {
            let text = message.clone().unwrap_or_else(|| err.to_string());
            match err.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    return ServerError::Busy(text);
                }
                ErrorCode::ConstraintViolation => {
                    return ServerError::UniqueViolation(text);
                }
                ErrorCode::ReadOnly => return ServerError::ReadOnlyViolation,
                ErrorCode::OperationInterrupted => return ServerError::Canceled,
                _ => {}
            }
        }
        ServerError::Engine(e)
    }
}
