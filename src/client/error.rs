use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::BoxError;

/// A shareable error source. Errors are cloned into every cancellation
/// token that observes them, so sources are reference counted.
pub type Source = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Client error type.
///
/// Each variant marks the stage at which the request failed, so callers can
/// tell "never connected" from "timed out after connecting" from "server hung
/// up mid-body". See [`Error::is_fatal`] for which errors stop retries.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// The target URL could not be parsed or is unusable.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// A proxy specification could not be parsed.
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    /// The outgoing request could not be constructed.
    #[error("request build error: {0}")]
    Build(#[source] Source),

    /// The failure callback replaced the error. The original error is kept.
    #[error("{reason}")]
    Vetoed {
        /// The error returned by the failure callback.
        reason: Source,
        /// The error that triggered the callback.
        original: Box<Error>,
    },

    /// No connection could be established.
    #[error("connect error: {0}")]
    Connect(#[source] Source),

    /// The connection failed during the request/response exchange.
    #[error("round-trip error: {0}")]
    RoundTrip(#[source] Source),

    /// Response headers did not arrive in time.
    #[error("response header timeout after {0:?}")]
    HeaderTimeout(Duration),

    /// The request deadline elapsed.
    #[error("request timeout after {0:?}")]
    Timeout(Duration),

    /// The request was cancelled by the caller.
    #[error("request canceled")]
    Canceled,

    /// The pool serving this request was closed.
    #[error("pool closed: {0}")]
    PoolClosed(#[source] Box<Error>),

    /// The connection closed before the request could be served.
    #[error("connection closed")]
    ConnectionClosed,

    /// The exchange completed without producing a response.
    #[error("no response")]
    NoResponse,

    /// Reading the response body failed.
    #[error("body error: {0}")]
    Body(#[source] Source),

    /// The response body was closed before it was fully read.
    #[error("body closed before end of stream")]
    BodyClosed,

    /// The client was closed.
    #[error("client closed")]
    ClientClosed,

    /// The result callback rejected the response.
    #[error("callback error: {0}")]
    Callback(#[source] Source),

    /// The requested protocol or scheme is not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Wrap a connection failure. Client errors raised by the dialer are kept as-is.
    pub fn connect<E: Into<BoxError>>(error: E) -> Self {
        Self::from_boxed(error.into(), Error::Connect)
    }

    /// Wrap an exchange failure from an executor.
    pub fn round_trip<E: Into<BoxError>>(error: E) -> Self {
        Error::RoundTrip(Arc::from(error.into()))
    }

    /// Wrap a body read failure.
    pub fn body<E: Into<BoxError>>(error: E) -> Self {
        Self::from_boxed(error.into(), Error::Body)
    }

    /// Wrap a request construction failure.
    pub fn build<E: Into<BoxError>>(error: E) -> Self {
        Error::Build(Arc::from(error.into()))
    }

    /// Wrap a result callback failure.
    pub fn callback<E: Into<BoxError>>(error: E) -> Self {
        Error::Callback(Arc::from(error.into()))
    }

    fn from_boxed(error: BoxError, wrap: fn(Source) -> Error) -> Self {
        match error.downcast::<Error>() {
            Ok(error) => *error,
            Err(error) => wrap(Arc::from(error)),
        }
    }

    /// Whether retrying this request is pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_)
                | Error::InvalidProxy(_)
                | Error::Build(_)
                | Error::Vetoed { .. }
                | Error::ClientClosed
                | Error::Unsupported(_)
        )
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_fatal()
    }

    /// Whether this error is a deadline of some sort.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::HeaderTimeout(_) | Error::Timeout(_) => true,
            Error::PoolClosed(inner) => inner.is_timeout(),
            _ => false,
        }
    }

    /// Whether no connection was ever established.
    pub fn is_connect(&self) -> bool {
        match self {
            Error::Connect(_) => true,
            Error::PoolClosed(inner) => inner.is_connect(),
            _ => false,
        }
    }

    /// Whether the failure happened while reading the response body.
    pub fn is_body(&self) -> bool {
        matches!(self, Error::Body(_) | Error::BodyClosed)
    }

    /// The error that triggered a veto, if this is one.
    pub fn original(&self) -> Option<&Error> {
        match self {
            Error::Vetoed { original, .. } => Some(original),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: std::error::Error, Send, Sync, Clone, Into<BoxError>);

    #[test]
    fn fatal_classification() {
        assert!(Error::InvalidUrl("x".into()).is_fatal());
        assert!(Error::InvalidProxy("x".into()).is_fatal());
        assert!(Error::build("x").is_fatal());
        assert!(Error::ClientClosed.is_fatal());
        assert!(Error::Vetoed {
            reason: Arc::from(BoxError::from("no")),
            original: Box::new(Error::NoResponse),
        }
        .is_fatal());

        assert!(Error::round_trip("x").is_retryable());
        assert!(Error::HeaderTimeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::PoolClosed(Box::new(Error::NoResponse)).is_retryable());
        assert!(Error::BodyClosed.is_retryable());
    }

    #[test]
    fn stage_markers() {
        assert_eq!(Error::round_trip("reset").to_string(), "round-trip error: reset");
        assert!(Error::connect("refused").is_connect());
        assert!(Error::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(Error::PoolClosed(Box::new(Error::connect("refused"))).is_connect());
        assert!(Error::body("eof").is_body());
    }

    #[test]
    fn connect_keeps_client_errors() {
        let boxed: BoxError = Box::new(Error::Unsupported("https".into()));
        let error = Error::connect(boxed);
        assert!(matches!(error, Error::Unsupported(_)));
        assert!(error.is_fatal());
    }

    #[test]
    fn veto_keeps_original() {
        let error = Error::Vetoed {
            reason: Arc::from(BoxError::from("blocked")),
            original: Box::new(Error::NoResponse),
        };
        assert_eq!(error.to_string(), "blocked");
        assert!(matches!(error.original(), Some(Error::NoResponse)));
    }
}
