//! Per-request options.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderName, HeaderValue};

use super::log::{Log, Logger};
use super::pool::{FailureCallback, TaskContext};
use super::{Error, Response};
use crate::{Body, BoxError, CancelToken};

/// Called with every successful response. Returning an error fails the request.
pub type ResultCallback = Arc<dyn Fn(&Response) -> Result<(), BoxError> + Send + Sync>;

/// Options for a single request. Anything left unset falls back to the
/// client's [`Config`](super::Config).
///
/// Invalid header names or values are remembered and reported when the
/// request is made, as [`Error::Build`].
#[derive(Default)]
pub struct RequestOptions {
    pub(crate) headers: Vec<(HeaderName, HeaderValue)>,
    pub(crate) order_headers: Option<Vec<HeaderName>>,
    pub(crate) body: Option<Body>,
    pub(crate) content_type: Option<String>,
    pub(crate) user_agent: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) referer: Option<String>,

    pub(crate) timeout: Option<Duration>,
    pub(crate) response_header_timeout: Option<Duration>,
    pub(crate) max_retries: Option<usize>,

    pub(crate) proxy: Option<String>,
    pub(crate) proxies: Vec<String>,
    pub(crate) force_http1: bool,
    pub(crate) http2_prior_knowledge: bool,
    pub(crate) http3: bool,
    pub(crate) stream: bool,

    pub(crate) cancel: Option<CancelToken>,
    pub(crate) on_failure: Option<FailureCallback>,
    pub(crate) on_result: Option<ResultCallback>,
    pub(crate) logger: Option<Logger>,

    pub(crate) error: Option<Error>,
}

impl RequestOptions {
    /// Options with every setting left to the client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header.
    pub fn with_header<K, V>(mut self, name: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let name: Result<HeaderName, http::Error> = HeaderName::try_from(name).map_err(Into::into);
        let value: Result<HeaderValue, http::Error> =
            HeaderValue::try_from(value).map_err(Into::into);
        match (name, value) {
            (Ok(name), Ok(value)) => self.headers.push((name, value)),
            (Err(error), _) | (_, Err(error)) => self.record(Error::build(error)),
        }
        self
    }

    /// Append every header in `headers`.
    pub fn with_headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        headers
            .into_iter()
            .fold(self, |options, (name, value)| options.with_header(name, value))
    }

    /// Send headers in this order, ahead of any others.
    pub fn with_order_headers<I, K>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = K>,
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
    {
        let mut names = Vec::new();
        for name in order {
            match HeaderName::try_from(name) {
                Ok(name) => names.push(name),
                Err(error) => {
                    let error: http::Error = error.into();
                    self.record(Error::build(error));
                }
            }
        }
        self.order_headers = Some(names);
        self
    }

    /// Set the request body.
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Set the `Content-Type` header, unless one was given explicitly.
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Override the client's `User-Agent`.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Send this `Host` header instead of the one derived from the URL.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Send this `Referer` instead of the URL's origin.
    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    /// Deadline for each attempt, covering the body read in buffered mode.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Deadline for response headers, per attempt.
    pub fn with_response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = Some(timeout);
        self
    }

    /// Retry up to `retries` times. Capped by the client's retry ceiling.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Route through `proxy`, as the first hop.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Route through a chain of proxies, after any [`with_proxy`](Self::with_proxy) hop.
    pub fn with_proxies<I, S>(mut self, proxies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxies.extend(proxies.into_iter().map(Into::into));
        self
    }

    /// Only speak HTTP/1.1.
    pub fn with_force_http1(mut self) -> Self {
        self.force_http1 = true;
        self
    }

    /// Speak HTTP/2 without negotiation.
    pub fn with_http2_prior_knowledge(mut self) -> Self {
        self.http2_prior_knowledge = true;
        self
    }

    /// Ask for HTTP/3.
    pub fn with_http3(mut self) -> Self {
        self.http3 = true;
        self
    }

    /// Leave the body on the connection for the caller to read.
    pub fn with_stream(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Cancel the request when `token` fires.
    pub fn with_cancel_token(mut self, token: &CancelToken) -> Self {
        self.cancel = Some(token.clone());
        self
    }

    /// Inspect every failed attempt. Returning an error stops retries and
    /// replaces the failure.
    pub fn with_on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TaskContext<'_>) -> Option<BoxError> + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(callback));
        self
    }

    /// Inspect every successful response. Returning an error fails the request.
    pub fn with_on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Response) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_result = Some(Arc::new(callback));
        self
    }

    /// Receive lifecycle [`Log`] events.
    pub fn with_logger<F>(mut self, logger: F) -> Self
    where
        F: Fn(Log) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(logger));
        self
    }

    fn record(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("proxy", &self.proxy)
            .field("proxies", &self.proxies)
            .field("stream", &self.stream)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
