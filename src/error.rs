//! Error taxonomy shared across the stores and the coordinator.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How an outer request layer should classify an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    NotFound,
    ServerError,
}

#[derive(Debug, Error)]
pub enum Error {
    /// The relational store rejected a statement. `code` carries SQLite's
    /// extended result code so callers can tell a port collision apart from
    /// a genuine failure.
    #[error("database error: {message}")]
    Store { message: String, code: Option<i32> },

    /// Every random draw in the configured port range hit a taken port.
    #[error("failed to allocate a connection port after {tries} attempts")]
    CapacityExhausted { tries: u32 },

    /// No rule in the table matched the requested target.
    #[error("no {table} rule found for {target}")]
    RuleNotFound { table: String, target: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An external command exited non-zero.
    #[error("command `{command}` exited with status {status}: {stderr}")]
    Cli {
        command: String,
        status: i32,
        stderr: String,
    },

    /// The database record and the live firewall rules disagree.
    #[error("{message}")]
    Inconsistent { message: String, status: Status },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the store refused an insert because the connection port is
    /// already taken. These are retried; everything else is fatal.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Error::Store { code: Some(code), .. }
            if *code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || *code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    }

    pub fn status(&self) -> Status {
        match self {
            Error::Inconsistent { status, .. } => *status,
            Error::InvalidArgument(_) => Status::BadRequest,
            Error::RuleNotFound { .. } => Status::NotFound,
            _ => Status::ServerError,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        let code = match &err {
            rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
            _ => None,
        };
        Error::Store {
            message: err.to_string(),
            code,
        }
    }
}
