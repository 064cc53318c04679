use std::error::Error;
use std::io::{self, ErrorKind};

use http::StatusCode;

use crate::lifecycle::ComponentState;

#[derive(Debug)]
pub enum KitError {
    /// I/O failure on a single connection.
    Io(io::Error),
    /// Could not bind the listening socket.
    Bind(io::Error),
    /// Malformed or oversized HTTP request head.
    Http(StatusCode),
    /// Lifecycle method called from a state where it is not legal.
    Lifecycle {
        state: ComponentState,
        operation: &'static str,
    },
    /// A handler reported a failure of its own.
    Handler(String),
}

impl Error for KitError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            KitError::Io(e) => Some(e),
            KitError::Bind(e) => Some(e),
            _ => None,
        }
    }
}

impl std::fmt::Display for KitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitError::Io(e) => write!(f, "I/O error: {e}"),
            KitError::Bind(e) => write!(f, "failed to bind listening socket: {e}"),
            KitError::Http(s) => write!(f, "HTTP error: {s}"),
            KitError::Lifecycle { state, operation } => {
                write!(f, "cannot {operation} component in state {state:?}")
            }
            KitError::Handler(msg) => write!(f, "handler error: {msg}"),
        }
    }
}

impl From<io::Error> for KitError {
    fn from(e: io::Error) -> Self {
        KitError::Io(e)
    }
}

impl From<StatusCode> for KitError {
    fn from(e: StatusCode) -> Self {
        KitError::Http(e)
    }
}

impl From<KitError> for io::Error {
    fn from(e: KitError) -> Self {
        match e {
            KitError::Io(e) | KitError::Bind(e) => e,
            KitError::Http(_) => io::Error::new(ErrorKind::InvalidData, e),
            other => io::Error::new(ErrorKind::Other, other),
        }
    }
}

impl KitError {
    /// Status code to send back if the error is reported to an HTTP client.
    pub fn statuscode(&self) -> StatusCode {
        match self {
            KitError::Http(s) => *s,
            KitError::Io(e) if e.kind() == ErrorKind::InvalidData => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn must_close(&self) -> bool {
        !matches!(self, KitError::Handler(_))
    }
}

pub type KitResult<T> = Result<T, KitError>;
