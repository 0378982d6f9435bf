//! Dialing: turning a destination into a ready [`Connection`].

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use tracing::{debug, Instrument as _};

use super::protocol::HttpConnectionBuilder;
use super::tcp::{connect_host, TcpConfig};
use super::{Connection, HttpProtocol, Proxy};
use crate::client::pool::{PoolKey, ProtocolClass};
use crate::client::request::Target;
use crate::client::Error;
use crate::BoxError;

/// Everything a dialer needs to establish a connection for a pool.
#[derive(Debug, Clone)]
pub struct DialRequest {
    /// The pool the connection will join.
    pub key: PoolKey,

    /// The destination.
    pub target: Target,

    /// Proxies to traverse, first hop first.
    pub proxies: Vec<Proxy>,

    /// The protocol class requested by the caller.
    pub protocol: ProtocolClass,
}

/// Produces connections. The engine treats dialing as opaque and only sees
/// the resulting [`Connection`] or an error.
pub trait Dialer: Send + Sync + 'static {
    /// Establish a connection for `request`.
    fn dial(&self, request: DialRequest) -> BoxFuture<'static, Result<Connection, BoxError>>;
}

/// Dials plain TCP, walks the proxy chain hop by hop, then runs the HTTP
/// handshake with hyper.
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    tcp: TcpConfig,
    http: HttpConnectionBuilder,
}

impl TcpDialer {
    /// Create a dialer with default socket settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout for each TCP connect attempt.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tcp.connect_timeout = timeout;
        self
    }

    /// Set the TCP keep-alive idle time.
    pub fn with_keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.tcp.keep_alive = keep_alive;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp.nodelay = nodelay;
        self
    }

    /// The HTTP handshake configuration.
    pub fn http(&mut self) -> &mut HttpConnectionBuilder {
        &mut self.http
    }

    async fn connect(self, request: DialRequest) -> Result<Connection, Error> {
        if request.target.is_secure() {
            return Err(Error::Unsupported(format!(
                "tls to {}",
                request.target
            )));
        }

        let protocol = match request.protocol {
            ProtocolClass::Auto | ProtocolClass::Http1 => HttpProtocol::Http1,
            ProtocolClass::Http2 => HttpProtocol::Http2,
            ProtocolClass::Http3 => return Err(Error::Unsupported("h3".into())),
        };

        let (host, port) = match request.proxies.first() {
            Some(proxy) => (proxy.host(), proxy.port()),
            None => (request.target.host(), request.target.port()),
        };

        let mut stream = connect_host(host, port, &self.tcp)
            .await
            .map_err(Error::connect)?;

        for (index, proxy) in request.proxies.iter().enumerate() {
            let (next_host, next_port) = match request.proxies.get(index + 1) {
                Some(next) => (next.host(), next.port()),
                None => (request.target.host(), request.target.port()),
            };
            proxy.tunnel(&mut stream, next_host, next_port).await?;
        }

        debug!(%protocol, "transport ready");
        let connection = self.http.connect(stream, protocol).await?;
        Ok(connection.with_proxies(request.proxies))
    }
}

impl Dialer for TcpDialer {
    fn dial(&self, request: DialRequest) -> BoxFuture<'static, Result<Connection, BoxError>> {
        let span = tracing::debug_span!("dial", pool.key = %request.key);
        let dialer = self.clone();
        async move { dialer.connect(request).await.map_err(BoxError::from) }
            .instrument(span)
            .boxed()
    }
}
