use std::sync::Arc;
use std::time::Duration;

use http::header::{self, HeaderName};

use super::conn::{Dialer, TcpDialer};
use super::Client;

/// The header order browsers send, used unless a request overrides it.
pub(crate) fn default_order_headers() -> Arc<[HeaderName]> {
    Arc::from(vec![
        header::HOST,
        header::CONNECTION,
        header::CONTENT_LENGTH,
        header::CACHE_CONTROL,
        header::UPGRADE,
        HeaderName::from_static("upgrade-insecure-requests"),
        header::USER_AGENT,
        header::ACCEPT,
        HeaderName::from_static("sec-fetch-site"),
        HeaderName::from_static("sec-fetch-mode"),
        HeaderName::from_static("sec-fetch-user"),
        HeaderName::from_static("sec-fetch-dest"),
        header::REFERER,
        header::ACCEPT_ENCODING,
        header::ACCEPT_LANGUAGE,
        header::COOKIE,
    ])
}

/// Client-wide defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retries when a request does not set its own.
    pub max_retries: usize,

    /// Upper bound on retries, whatever a request asks for.
    pub retry_ceiling: usize,

    /// How many times a task handed back by a closing pool is resubmitted
    /// before the attempt fails.
    pub max_resubmits: usize,

    /// Header order, unless a request sets its own.
    pub order_headers: Arc<[HeaderName]>,

    /// Deadline for response headers, per attempt.
    pub response_header_timeout: Option<Duration>,

    /// Deadline for each attempt.
    pub timeout: Option<Duration>,

    /// Deadline for establishing a connection.
    pub dial_timeout: Option<Duration>,

    /// TCP keep-alive for connections made by the default dialer.
    pub keep_alive: Option<Duration>,

    /// Upper bound on connections per pool.
    pub max_connections_per_pool: Option<usize>,

    /// `User-Agent` sent unless a request sets its own.
    pub user_agent: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_ceiling: 10,
            max_resubmits: 3,
            order_headers: default_order_headers(),
            response_header_timeout: Some(Duration::from_secs(30)),
            timeout: None,
            dial_timeout: Some(Duration::from_secs(10)),
            keep_alive: Some(Duration::from_secs(90)),
            max_connections_per_pool: None,
            user_agent: Some(concat!("steadfast/", env!("CARGO_PKG_VERSION")).to_owned()),
        }
    }
}

/// A builder for a client.
#[derive(Default)]
pub struct Builder {
    config: Config,
    dialer: Option<Arc<dyn Dialer>>,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("config", &self.config)
            .field("dialer", &self.dialer.is_some())
            .finish()
    }
}

impl Builder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The configuration built so far.
    pub fn config(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Default number of retries.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Upper bound on retries for any request.
    pub fn with_retry_ceiling(mut self, ceiling: usize) -> Self {
        self.config.retry_ceiling = ceiling;
        self
    }

    /// Default header order.
    pub fn with_order_headers(mut self, order: Vec<HeaderName>) -> Self {
        self.config.order_headers = order.into();
        self
    }

    /// Default deadline for response headers.
    pub fn with_response_header_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.response_header_timeout = timeout;
        self
    }

    /// Default deadline for each attempt.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Deadline for establishing a connection.
    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// TCP keep-alive for the default dialer.
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Upper bound on connections per pool.
    pub fn with_max_connections_per_pool(mut self, max: Option<usize>) -> Self {
        self.config.max_connections_per_pool = max;
        self
    }

    /// Set the default `User-Agent`.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = Some(user_agent.into());
        self
    }

    /// Get the user agent currently configured
    pub fn user_agent(&self) -> Option<&str> {
        self.config.user_agent.as_deref()
    }

    /// Use a custom dialer instead of plain TCP.
    pub fn with_dialer<D: Dialer>(mut self, dialer: D) -> Self {
        self.dialer = Some(Arc::new(dialer));
        self
    }

    /// Build the client.
    pub fn build(self) -> Client {
        let dialer = self.dialer.unwrap_or_else(|| {
            Arc::new(
                TcpDialer::new()
                    .with_connect_timeout(self.config.dial_timeout)
                    .with_keep_alive(self.config.keep_alive),
            )
        });
        Client::new(self.config, dialer)
    }
}
