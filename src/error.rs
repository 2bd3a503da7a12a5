use std::collections::HashMap;

use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::protocol::response::ServerErrorDetail;

pub type Result<T> = core::result::Result<T, Error>;

/// Server-side error codes carried in a CQL `ERROR` body (§6).
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ServerError = 0x0000,
    ProtocolError = 0x000A,
    BadCredentials = 0x0100,
    Unavailable = 0x1000,
    Overloaded = 0x1001,
    IsBootstrapping = 0x1002,
    TruncateError = 0x1003,
    WriteTimeout = 0x1100,
    ReadTimeout = 0x1200,
    ReadFailure = 0x1300,
    FunctionFailure = 0x1400,
    WriteFailure = 0x1500,
    SyntaxError = 0x2000,
    Unauthorized = 0x2100,
    Invalid = 0x2200,
    ConfigError = 0x2300,
    AlreadyExists = 0x2400,
    Unprepared = 0x2500,
    Other(u32),
}

impl From<u32> for ErrorCode {
    fn from(value: u32) -> Self {
        match value {
            0x0000 => Self::ServerError,
            0x000A => Self::ProtocolError,
            0x0100 => Self::BadCredentials,
            0x1000 => Self::Unavailable,
            0x1001 => Self::Overloaded,
            0x1002 => Self::IsBootstrapping,
            0x1003 => Self::TruncateError,
            0x1100 => Self::WriteTimeout,
            0x1200 => Self::ReadTimeout,
            0x1300 => Self::ReadFailure,
            0x1400 => Self::FunctionFailure,
            0x1500 => Self::WriteFailure,
            0x2000 => Self::SyntaxError,
            0x2100 => Self::Unauthorized,
            0x2200 => Self::Invalid,
            0x2300 => Self::ConfigError,
            0x2400 => Self::AlreadyExists,
            0x2500 => Self::Unprepared,
            other => Self::Other(other),
        }
    }
}

/// The error taxonomy of §7, one variant per *kind*.
///
/// This mirrors the teacher's `thiserror`-derived `Error` enum: a flat set of
/// variants with `#[from]` conversions at the I/O boundary, rather than a
/// tree of nested error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not connect to {endpoint}: {message}")]
    ConnectionError { endpoint: Endpoint, message: String },

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("authentication failed: {inner}")]
    AuthenticationError { inner: Box<Error> },

    #[error("socket error (request_not_written={request_not_written}): {message}")]
    SocketError {
        message: String,
        request_not_written: bool,
        #[source]
        inner: Option<Box<Error>>,
    },

    #[error("operation timed out on {host} after {elapsed_ms}ms")]
    OperationTimedOut { host: Endpoint, elapsed_ms: u64 },

    #[error("server response error {code:?}: {message}")]
    ResponseError {
        code: ErrorCode,
        message: String,
        /// The query id the server no longer recognizes, carried only on
        /// `Unprepared` so `RequestHandler` can drive recovery without
        /// re-parsing the response body (§4.6).
        unprepared_id: Option<Vec<u8>>,
        /// Error-kind-specific tail a retry policy consults (consistency,
        /// replica counts, write type) for `Unavailable`/`*Timeout` codes.
        detail: ServerErrorDetail,
    },

    #[error("driver internal error: {0}")]
    DriverInternalError(String),

    #[error("no host was available to fulfil the request")]
    NoHostAvailable {
        inner_errors: HashMap<Endpoint, Box<Error>>,
    },

    #[error("bad configuration: {0}")]
    BadConfigError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Whether this error should flip the owning connection's "broken" flag,
    /// the way the teacher's `Conn::check_error`/`is_conn_broken` does.
    pub fn is_conn_broken(&self) -> bool {
        matches!(
            self,
            Error::SocketError { .. } | Error::ProtocolError(_) | Error::IoError(_)
        )
    }

    /// True when the failed request is safe to retry on another host
    /// regardless of idempotence, per §7/§9's two-level socket-error split.
    pub fn is_safe_to_retry_anywhere(&self) -> bool {
        matches!(
            self,
            Error::SocketError {
                request_not_written: true,
                ..
            }
        )
    }

    pub fn socket_closed(request_not_written: bool, inner: Option<Error>) -> Self {
        Error::SocketError {
            message: "connection closed".to_string(),
            request_not_written,
            inner: inner.map(Box::new),
        }
    }
}
