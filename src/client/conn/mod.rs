//! Connections and the executors which drive them.
//!
//! A [`Connection`] pairs an [`Executor`], which performs request/response
//! exchanges, with the [`Transport`] it runs over. The protocol is chosen once,
//! when the connection is dialed. The pool only ever sees `Box<dyn Executor>`
//! and the [`HttpProtocol`] it reports.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use ::http::header::HeaderName;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cancel::{CancelToken, Cause};
use crate::client::pool::PoolKey;
use crate::client::Error;
use crate::{Body, BoxError};

pub mod dial;
#[cfg(any(test, feature = "mocks"))]
pub mod mock;
pub mod protocol;
pub mod proxy;
pub(crate) mod tcp;

pub use self::dial::{DialRequest, Dialer, TcpDialer};
pub use self::protocol::{HttpConnectionBuilder, HttpExecutor};
pub use self::proxy::Proxy;

/// A duplex byte stream.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed duplex byte stream, handed out after a protocol upgrade.
pub type BoxIo = Box<dyn Io>;

/// The protocol an executor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpProtocol {
    /// HTTP/1.1
    Http1,

    /// HTTP/2
    Http2,

    /// HTTP/3
    Http3,

    /// A raw tunnel, with no HTTP framing of its own.
    Tunnel,
}

impl HttpProtocol {
    /// HTTP Version to convey this protocol.
    pub fn version(&self) -> ::http::Version {
        match self {
            Self::Http1 | Self::Tunnel => ::http::Version::HTTP_11,
            Self::Http2 => ::http::Version::HTTP_2,
            Self::Http3 => ::http::Version::HTTP_3,
        }
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Http1 => "http/1.1",
            Self::Http2 => "h2",
            Self::Http3 => "h3",
            Self::Tunnel => "tunnel",
        };
        f.write_str(name)
    }
}

/// The result of one request/response exchange.
#[derive(Debug)]
pub struct Exchange {
    /// The response, once headers arrived. `None` means the exchange ended
    /// without producing one.
    pub response: Option<::http::Response<Body>>,

    /// Fires when the response body has been fully consumed or closed.
    ///
    /// Executors may fire this themselves, for example when the underlying
    /// connection dies mid-body. The client wraps the body so that reading it
    /// to the end, or closing it, also fires this token.
    pub body_done: CancelToken,
}

impl Exchange {
    /// An exchange which produced a response.
    pub fn new(response: ::http::Response<Body>, body_done: CancelToken) -> Self {
        Self {
            response: Some(response),
            body_done,
        }
    }

    /// An exchange which ended without a response.
    pub fn empty() -> Self {
        Self {
            response: None,
            body_done: CancelToken::new(),
        }
    }
}

/// Performs request/response exchanges over an established transport.
pub trait Executor: Send + 'static {
    /// The protocol this executor speaks.
    fn protocol(&self) -> HttpProtocol;

    /// Send a request and wait for the response headers.
    ///
    /// Headers named in `order` are sent first, in that order. The returned
    /// future must not borrow the executor.
    fn do_request(
        &mut self,
        request: ::http::Request<Body>,
        order: &[HeaderName],
    ) -> BoxFuture<'static, Result<Exchange, BoxError>>;

    /// The raw stream, after a `101 Switching Protocols` response.
    ///
    /// Returns `None` if there was no upgrade, or the stream was already taken.
    fn stream(&mut self) -> Option<BoxIo>;

    /// Close the exchange. Must be idempotent.
    fn close_with_error(&mut self, cause: &Error) -> Result<(), BoxError>;

    /// Whether this executor can accept another exchange.
    fn is_open(&self) -> bool {
        true
    }

    /// Resolves when the executor stops accepting exchanges on its own, for
    /// example when the peer closes an idle connection.
    fn closed(&self) -> BoxFuture<'static, Cause> {
        Box::pin(std::future::pending())
    }
}

/// The transport underneath an executor.
pub trait Transport: Send + 'static {
    /// Close the transport. Must be idempotent.
    fn close(&mut self) -> Result<(), BoxError>;
}

impl Transport for () {
    fn close(&mut self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Identifies a connection within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// What responses can learn about the connection that produced them.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The connection id.
    pub id: ConnectionId,

    /// The pool the connection belongs to.
    pub key: PoolKey,

    /// The protocol spoken on the connection.
    pub protocol: HttpProtocol,

    /// Proxies traversed to reach the destination, first hop first.
    pub proxies: Vec<Proxy>,
}

#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub(crate) info: ConnectionInfo,
    pub(crate) force: CancelToken,
    closed: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One pooled transport and its executor.
///
/// A connection is owned by exactly one worker in its pool. Closing it is
/// idempotent, and always closes the transport even when the executor fails to
/// close.
pub struct Connection {
    executor: Box<dyn Executor>,
    transport: Box<dyn Transport>,
    proxies: Vec<Proxy>,
    shared: Arc<ConnectionShared>,
    closed: bool,
}

impl Connection {
    /// Create a connection from an executor and its transport.
    pub fn new<E, T>(executor: E, transport: T) -> Self
    where
        E: Executor,
        T: Transport,
    {
        let protocol = executor.protocol();
        Self {
            executor: Box::new(executor),
            transport: Box::new(transport),
            proxies: Vec::new(),
            shared: Arc::new(ConnectionShared {
                info: ConnectionInfo {
                    id: ConnectionId::new(0),
                    key: PoolKey::detached(),
                    protocol,
                    proxies: Vec::new(),
                },
                force: CancelToken::new(),
                closed: AtomicBool::new(false),
            }),
            closed: false,
        }
    }

    /// Record the proxy chain this connection was established through.
    pub fn with_proxies(mut self, proxies: Vec<Proxy>) -> Self {
        self.proxies = proxies;
        self
    }

    /// Join a pool: derive this connection's force-close scope from the pool's.
    pub(crate) fn attach(&mut self, pool_force: &CancelToken, id: ConnectionId, key: PoolKey) {
        self.shared = Arc::new(ConnectionShared {
            info: ConnectionInfo {
                id,
                key,
                protocol: self.executor.protocol(),
                proxies: self.proxies.clone(),
            },
            force: pool_force.child(),
            closed: AtomicBool::new(false),
        });
    }

    /// The connection id, assigned when it joins a pool.
    pub fn id(&self) -> ConnectionId {
        self.shared.info.id
    }

    /// The protocol spoken on this connection.
    pub fn protocol(&self) -> HttpProtocol {
        self.executor.protocol()
    }

    /// The proxy chain.
    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    /// This connection's force-close scope.
    pub fn force(&self) -> &CancelToken {
        &self.shared.force
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub(crate) fn executor(&mut self) -> &mut dyn Executor {
        self.executor.as_mut()
    }

    /// Resolves when the executor gives up on the connection by itself.
    pub(crate) fn closed(&self) -> BoxFuture<'static, Cause> {
        self.executor.closed()
    }

    /// Whether the connection may serve another task.
    pub fn is_open(&self) -> bool {
        !self.closed && !self.shared.force.is_cancelled() && self.executor.is_open()
    }

    /// Close the connection with `cause`.
    ///
    /// The executor's error takes priority over the transport's. Calling this
    /// more than once does nothing.
    pub fn close_with_error(&mut self, cause: &Error) -> Result<(), BoxError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }

        self.shared.closed.store(true, Ordering::Release);
        self.shared.force.cancel(cause.clone());

        let executor = self.executor.close_with_error(cause);
        let transport = self.transport.close();
        executor.and(transport)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close_with_error(&Error::ConnectionClosed) {
                tracing::debug!(%error, "error closing dropped connection");
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.info.id)
            .field("protocol", &self.executor.protocol())
            .field("proxies", &self.proxies)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_obj_safe;

    use crate::client::conn::mock::{MockExecutor, MockTransport};

    assert_obj_safe!(Executor, Transport);

    #[test]
    fn protocol_versions() {
        assert_eq!(HttpProtocol::Http1.version(), ::http::Version::HTTP_11);
        assert_eq!(HttpProtocol::Http2.version(), ::http::Version::HTTP_2);
        assert_eq!(HttpProtocol::Http1.to_string(), "http/1.1");
    }

    #[test]
    fn close_is_idempotent() {
        let executor = MockExecutor::ok();
        let state = executor.state();
        let transport = MockTransport::new();
        let closes = transport.closes();

        let mut conn = Connection::new(executor, transport);
        conn.close_with_error(&Error::NoResponse).unwrap();
        conn.close_with_error(&Error::Canceled).unwrap();
        drop(conn);

        assert_eq!(state.closes().len(), 1);
        assert!(matches!(state.closes()[0].cause, Error::NoResponse));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_closes_when_executor_fails() {
        let executor = MockExecutor::ok().fail_close("executor close failed");
        let transport = MockTransport::new().fail_close("transport close failed");
        let closes = transport.closes();

        let mut conn = Connection::new(executor, transport);
        let err = conn.close_with_error(&Error::NoResponse).unwrap_err();

        assert_eq!(err.to_string(), "executor close failed");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transport_error_reported() {
        let transport = MockTransport::new().fail_close("transport close failed");
        let mut conn = Connection::new(MockExecutor::ok(), transport);
        let err = conn.close_with_error(&Error::NoResponse).unwrap_err();
        assert_eq!(err.to_string(), "transport close failed");
    }

    #[test]
    fn attach_derives_force() {
        let pool = CancelToken::new();
        let mut conn = Connection::new(MockExecutor::ok(), ());
        conn.attach(&pool, ConnectionId::new(7), PoolKey::detached());
        assert_eq!(conn.id().to_string(), "c7");
        assert!(conn.is_open());

        pool.cancel(Error::ClientClosed);
        assert!(conn.force().is_cancelled());
        assert!(!conn.is_open());
    }

    #[test]
    fn close_fires_force_only_for_this_connection() {
        let pool = CancelToken::new();
        let mut a = Connection::new(MockExecutor::ok(), ());
        let mut b = Connection::new(MockExecutor::ok(), ());
        a.attach(&pool, ConnectionId::new(1), PoolKey::detached());
        b.attach(&pool, ConnectionId::new(2), PoolKey::detached());

        a.close_with_error(&Error::NoResponse).unwrap();
        assert!(a.force().is_cancelled());
        assert!(!b.force().is_cancelled());
        assert!(!pool.is_cancelled());
    }
}
