//! Error types for the reqwest-proxy-dispatch crate.

use crate::proxy::ProxyTag;
use std::error::Error as StdError;
use std::io;
use thiserror::Error;

/// Result type alias for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors raised by the dispatcher, the proxy pool and the transport.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The tag is unknown, empty, or has no proxy of the forced address family.
    #[error("Proxy pool does not contain any eligible proxy for [{tag}]")]
    NoEligibleProxy { tag: ProxyTag },

    /// The tag is known but holds no record.
    #[error("No proxy available in pool for [{tag}]")]
    NoProxyAvailable { tag: ProxyTag },

    /// Forced by the watchdog: no response headers within the budget.
    #[error("HTTP response exceeded {millis} milliseconds")]
    ResponseTimeExceeded { millis: u64 },

    /// Forced by the watchdog: the body was not read within the budget.
    #[error("HTTP response read exceeded {millis} milliseconds")]
    ReadTimeExceeded { millis: u64 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A lifecycle was retried past the final unproxied attempt.
    #[error("Lifecycle retried {retry_count} times, past the final unproxied attempt")]
    RetryOverflow { retry_count: u32 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Dispatcher has been shut down")]
    ShutDown,
}

impl DispatchError {
    /// Whether this error funnels into the retry strategy.
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::ResponseTimeExceeded { .. } | DispatchError::ReadTimeExceeded { .. } => true,
            DispatchError::Transport(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Whether this error reports that the proxy pool could not serve a selection.
    pub fn is_pool_exhaustion(&self) -> bool {
        matches!(
            self,
            DispatchError::NoEligibleProxy { .. } | DispatchError::NoProxyAvailable { .. }
        )
    }
}

/// Classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Tls,
    ConnectionReset,
    ConnectionClosed,
    EmptyResponse,
    TruncatedBody,
    Protocol,
    Decode,
    Redirect,
    /// The request could not be built (bad URL, bad header, bad proxy).
    Builder,
    Other,
}

impl TransportErrorKind {
    pub fn is_transient(self) -> bool {
        !matches!(self, TransportErrorKind::Builder | TransportErrorKind::Other)
    }
}

/// A failure reported by the transport layer.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest(&err);
        TransportError::new(kind, err.to_string())
    }
}

impl From<url::ParseError> for DispatchError {
    fn from(err: url::ParseError) -> Self {
        DispatchError::InvalidRequest(err.to_string())
    }
}

fn classify_reqwest(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_builder() {
        return TransportErrorKind::Builder;
    }
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_redirect() {
        return TransportErrorKind::Redirect;
    }
    if err.is_decode() {
        return TransportErrorKind::Decode;
    }
    if let Some(kind) = io_kind(err) {
        return kind;
    }
    if err.is_connect() {
        return TransportErrorKind::Connect;
    }
    if err.is_body() {
        return TransportErrorKind::TruncatedBody;
    }
    if err.is_request() {
        // hyper reports a peer that hung up before writing a status line here
        return TransportErrorKind::Protocol;
    }
    TransportErrorKind::Other
}

/// Walk the source chain looking for the I/O error hyper wrapped.
fn io_kind(err: &reqwest::Error) -> Option<TransportErrorKind> {
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return Some(classify_io(io_err));
        }
        let text = cause.to_string();
        if text.contains("certificate") || text.contains("handshake") {
            return Some(TransportErrorKind::Tls);
        }
        source = cause.source();
    }
    None
}

pub(crate) fn classify_io(err: &io::Error) -> TransportErrorKind {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportErrorKind::Timeout,
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
            TransportErrorKind::ConnectionReset
        }
        io::ErrorKind::ConnectionRefused | io::ErrorKind::AddrNotAvailable => {
            TransportErrorKind::Connect
        }
        io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => {
            TransportErrorKind::ConnectionClosed
        }
        io::ErrorKind::UnexpectedEof => TransportErrorKind::TruncatedBody,
        io::ErrorKind::InvalidData => TransportErrorKind::Decode,
        _ => TransportErrorKind::Connect,
    }
}
