//! Error taxonomy. Every kind has a stable status code on the wire; the
//! dispatch server converts errors to responses and the proxy converts
//! responses back to errors, so kinds survive a round trip between nodes.

use crate::messages::Status;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or semantically invalid input.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Peer returned a malformed or error response.
    #[error("bad response: {0}")]
    BadResponse(String),

    /// Out-of-range GPS coordinates, empty identifier and the like.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Operation not legal in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Store insert conflict; the caller may update instead.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Missing identifier; the caller may store instead.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence engine failure. In-memory state stays untouched.
    #[error("storage failure: {0}")]
    Storage(#[from] sled::Error),

    /// Proxy connect or transport failure.
    #[error("connection failed: {0}")]
    Connection(#[source] std::io::Error),

    /// Framing or parse failure on a session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The wire status this error maps to.
    pub fn status(&self) -> Status {
        match self {
            Error::BadRequest(_) => Status::BadRequest,
            Error::BadResponse(_) => Status::BadResponse,
            Error::InvalidValue(_) => Status::InvalidValue,
            Error::InvalidState(_) => Status::InvalidState,
            Error::AlreadyExists(_) => Status::AlreadyExists,
            Error::NotFound(_) => Status::NotFound,
            Error::Storage(_) => Status::StorageFailure,
            Error::Connection(_) => Status::ConnectionFailed,
            Error::Protocol(_) => Status::ProtocolViolation,
            Error::Internal(_) => Status::Internal,
        }
    }

    /// Whether a remote peer deliberately refused the operation, as opposed
    /// to a transport or infrastructure failure. Renewal maintenance drops
    /// relations on refusals but keeps them across transport trouble.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Error::BadRequest(_)
                | Error::InvalidValue(_)
                | Error::InvalidState(_)
                | Error::AlreadyExists(_)
                | Error::NotFound(_)
        )
    }

    /// Rebuild an error from a non-OK wire status. Used by proxies to
    /// translate remote refusals back into the local taxonomy.
    pub fn from_status(status: Status, details: String) -> Self {
        match status {
            Status::Ok => Error::BadResponse("OK status carried as error".into()),
            Status::BadRequest => Error::BadRequest(details),
            Status::BadResponse => Error::BadResponse(details),
            Status::InvalidValue => Error::InvalidValue(details),
            Status::InvalidState => Error::InvalidState(details),
            Status::AlreadyExists => Error::AlreadyExists(details),
            Status::NotFound => Error::NotFound(details),
            Status::StorageFailure => Error::Internal(format!("remote storage failure: {}", details)),
            Status::ConnectionFailed => Error::Internal(format!("remote connection failure: {}", details)),
            Status::ProtocolViolation => Error::Protocol(details),
            Status::Internal => Error::Internal(details),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Protocol(format!("codec: {}", e))
    }
}
