//! Crate error type.
//!
//! Shaped like the teacher library's error module: a closed `ErrorKind`, an
//! `Error` that is either a bare kind or a kind plus a boxed source, and
//! extension traits that let any `Result` be annotated with a kind at the
//! point it's produced.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// The fixed, spec-defined error taxonomy.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Handshake failure: timeout, truncated read, or tag mismatch.
    Authentication,
    /// Transport failed to open, or was lost mid-stream.
    Connection,
    /// Malformed frame or unknown prefix byte.
    Protocol,
    /// Caller could not dispatch a service call (no provider, ids exhausted).
    ServiceRequest,
    /// A dispatched service call failed (handler error, remote error, connection drop).
    ServiceResponse,
    /// Invalid input at construction time.
    Configuration,
    /// Payload codec encode/decode failure.
    Codec,
    /// Underlying I/O failure not otherwise classified.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Authentication => "authentication error",
            ErrorKind::Connection => "connection error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::ServiceRequest => "service request error",
            ErrorKind::ServiceResponse => "service response error",
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Codec => "codec error",
            ErrorKind::Io => "io error",
        };
        write!(f, "{}", s)
    }
}

enum ErrorInner {
    Simple(ErrorKind, String),
    Wrapped(ErrorKind, String, Box<dyn std::error::Error + Send + Sync>),
}

pub struct Error {
    inner: ErrorInner,
}

impl Error {
    pub fn simple(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            inner: ErrorInner::Simple(kind, message.into()),
        }
    }

    pub fn wrapped(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            inner: ErrorInner::Wrapped(kind, message.into(), Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(kind, _) => *kind,
            ErrorInner::Wrapped(kind, _, _) => *kind,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::Authentication, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::Connection, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::Protocol, message)
    }

    pub fn service_request(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::ServiceRequest, message)
    }

    pub fn service_response(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::ServiceResponse, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::Configuration, message)
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Error::simple(ErrorKind::Codec, message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(kind, message) => {
                write!(f, "{:?}: {}", kind, message)
            }
            ErrorInner::Wrapped(kind, message, source) => {
                write!(f, "{:?}: {} ({})", kind, message, source)
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(kind, message) => write!(f, "{}: {}", kind, message),
            ErrorInner::Wrapped(kind, message, source) => {
                write!(f, "{}: {}: {}", kind, message, source)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.inner {
            ErrorInner::Simple(..) => None,
            ErrorInner::Wrapped(_, _, source) => Some(source.as_ref()),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::wrapped(ErrorKind::Io, "io failure", e)
    }
}

/// Attach a kind to a `Result` whose error carries useful source information.
pub trait ResultWrappedExt<T, E> {
    fn wrapped(self, kind: ErrorKind, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultWrappedExt<T, E> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn wrapped(self, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::wrapped(kind, message, e))
    }
}

/// Attach a kind to a `Result` whose error should be discarded and replaced
/// with a plain message (no meaningful source to preserve).
pub trait ResultSimpleExt<T> {
    fn simple(self, kind: ErrorKind, message: impl Into<String>) -> Result<T>;
}

impl<T, E> ResultSimpleExt<T> for std::result::Result<T, E> {
    fn simple(self, kind: ErrorKind, message: impl Into<String>) -> Result<T> {
        self.map_err(|_| Error::simple(kind, message))
    }
}
