//! Scripted executors, transports and dialers for testing the engine.
//!
//! A [`MockExecutor`] hands every request to a handler closure and records
//! what happened in a shared [`MockState`]: how many exchanges ran, how many
//! overlapped, and when and why connections were closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use http::header::HeaderName;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;

use super::{BoxIo, Connection, DialRequest, Dialer, Exchange, Executor, HttpProtocol, Transport};
use crate::cancel::{CancelToken, Cause};
use crate::client::Error;
use crate::{Body, BoxError};

/// Error raised by mocks on request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct MockError(pub String);

impl MockError {
    /// Box a mock error with the given message.
    pub fn boxed(message: impl Into<String>) -> BoxError {
        Box::new(MockError(message.into()))
    }
}

/// One request seen by a [`MockExecutor`].
#[derive(Debug)]
pub struct Call {
    /// Zero-based position of this call across every executor sharing the state.
    pub index: usize,

    /// The request as the engine sent it.
    pub request: http::Request<Body>,

    /// The header order the engine asked for.
    pub order: Vec<HeaderName>,
}

/// A record of one connection close.
#[derive(Debug, Clone)]
pub struct CloseRecord {
    /// The cause passed to `close_with_error`.
    pub cause: Error,

    /// When the close happened.
    pub at: Instant,
}

#[derive(Debug, Default)]
struct StateInner {
    executors: AtomicUsize,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: Mutex<Vec<CloseRecord>>,
}

/// Observations shared between mock executors.
#[derive(Debug, Clone, Default)]
pub struct MockState(Arc<StateInner>);

impl MockState {
    /// Create empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of executors created with this state.
    pub fn executors(&self) -> usize {
        self.0.executors.load(Ordering::SeqCst)
    }

    /// Number of exchanges started.
    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    /// Number of exchanges currently in progress.
    pub fn in_flight(&self) -> usize {
        self.0.in_flight.load(Ordering::SeqCst)
    }

    /// The largest number of exchanges ever in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.0.max_in_flight.load(Ordering::SeqCst)
    }

    /// Every connection close, in order.
    pub fn closes(&self) -> Vec<CloseRecord> {
        self.0.closes.lock().clone()
    }
}

struct InFlight(Arc<StateInner>);

impl InFlight {
    fn enter(state: &Arc<StateInner>) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Handles requests for a [`MockExecutor`].
pub type Handler = Arc<dyn Fn(Call) -> BoxFuture<'static, Result<Exchange, BoxError>> + Send + Sync>;

/// Build a response exchange with the given status and body.
pub fn respond(status: http::StatusCode, body: impl Into<Body>) -> Result<Exchange, BoxError> {
    let mut response = http::Response::new(body.into());
    *response.status_mut() = status;
    Ok(Exchange::new(response, CancelToken::new()))
}

/// An executor driven by a handler closure.
pub struct MockExecutor {
    handler: Handler,
    state: MockState,
    protocol: HttpProtocol,
    upgrade: Arc<Mutex<Option<BoxIo>>>,
    upgraded: Arc<AtomicBool>,
    peer: CancelToken,
    close_error: Option<String>,
}

impl MockExecutor {
    /// Create an executor which hands requests to `handler`.
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Call) -> BoxFuture<'static, Result<Exchange, BoxError>> + Send + Sync + 'static,
    {
        Self::from_handler(Arc::new(handler))
    }

    /// Create an executor from a shared handler.
    pub fn from_handler(handler: Handler) -> Self {
        let state = MockState::new();
        state.0.executors.fetch_add(1, Ordering::SeqCst);
        Self {
            handler,
            state,
            protocol: HttpProtocol::Http1,
            upgrade: Arc::new(Mutex::new(None)),
            upgraded: Arc::new(AtomicBool::new(false)),
            peer: CancelToken::new(),
            close_error: None,
        }
    }

    /// An executor which answers every request with an empty `200 OK`.
    pub fn ok() -> Self {
        Self::new(|_| async { respond(http::StatusCode::OK, Body::empty()) }.boxed())
    }

    /// Share observations with other executors.
    pub fn with_state(mut self, state: MockState) -> Self {
        self.state.0.executors.fetch_sub(1, Ordering::SeqCst);
        state.0.executors.fetch_add(1, Ordering::SeqCst);
        self.state = state;
        self
    }

    /// Report a different protocol.
    pub fn with_protocol(mut self, protocol: HttpProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// The stream to hand out after a `101` response.
    pub fn with_upgrade<IO>(self, io: IO) -> Self
    where
        IO: super::Io,
    {
        *self.upgrade.lock() = Some(Box::new(io));
        self
    }

    /// Fail `close_with_error` with this message.
    pub fn fail_close(mut self, message: impl Into<String>) -> Self {
        self.close_error = Some(message.into());
        self
    }

    /// The remote end of this executor. Firing it acts like the peer hanging
    /// up: the executor stops accepting exchanges.
    pub fn peer(&self) -> CancelToken {
        self.peer.clone()
    }

    /// The shared observations.
    pub fn state(&self) -> MockState {
        self.state.clone()
    }
}

impl fmt::Debug for MockExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockExecutor")
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .finish()
    }
}

impl Executor for MockExecutor {
    fn protocol(&self) -> HttpProtocol {
        self.protocol
    }

    fn do_request(
        &mut self,
        request: http::Request<Body>,
        order: &[HeaderName],
    ) -> BoxFuture<'static, Result<Exchange, BoxError>> {
        let index = self.state.0.calls.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::enter(&self.state.0);
        let exchange = (self.handler)(Call {
            index,
            request,
            order: order.to_vec(),
        });

        async move {
            let result = exchange.await;
            drop(guard);
            result
        }
        .boxed()
    }

    fn stream(&mut self) -> Option<BoxIo> {
        let stream = self.upgrade.lock().take();
        if stream.is_some() {
            self.upgraded.store(true, Ordering::SeqCst);
        }
        stream
    }

    fn close_with_error(&mut self, cause: &Error) -> Result<(), BoxError> {
        let mut closes = self.state.0.closes.lock();
        closes.push(CloseRecord {
            cause: cause.clone(),
            at: Instant::now(),
        });

        match &self.close_error {
            Some(message) => Err(MockError::boxed(message.clone())),
            None => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        !self.upgraded.load(Ordering::SeqCst) && !self.peer.is_cancelled()
    }

    fn closed(&self) -> BoxFuture<'static, Cause> {
        self.peer.cancelled().boxed()
    }
}

/// A transport which counts closes.
#[derive(Debug, Default)]
pub struct MockTransport {
    closes: Arc<AtomicUsize>,
    close_error: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `close` with this message.
    pub fn fail_close(mut self, message: impl Into<String>) -> Self {
        self.close_error = Some(message.into());
        self
    }

    /// Counter of closes.
    pub fn closes(&self) -> Arc<AtomicUsize> {
        self.closes.clone()
    }
}

impl Transport for MockTransport {
    fn close(&mut self) -> Result<(), BoxError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(message) => Err(MockError::boxed(message.clone())),
            None => Ok(()),
        }
    }
}

type Factory = Arc<dyn Fn(&DialRequest) -> Result<Connection, BoxError> + Send + Sync>;

/// A dialer which builds connections with a closure.
#[derive(Clone)]
pub struct MockDialer {
    factory: Factory,
    dials: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<DialRequest>>>,
}

impl MockDialer {
    /// Create a dialer from a connection factory.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&DialRequest) -> Result<Connection, BoxError> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            dials: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A dialer whose connections all run `handler`, sharing one [`MockState`].
    pub fn with_handler<F>(handler: F) -> (Self, MockState)
    where
        F: Fn(Call) -> BoxFuture<'static, Result<Exchange, BoxError>> + Send + Sync + 'static,
    {
        let state = MockState::new();
        let handler: Handler = Arc::new(handler);
        let shared = state.clone();
        let dialer = Self::new(move |_| {
            let executor = MockExecutor::from_handler(handler.clone()).with_state(shared.clone());
            Ok(Connection::new(executor, MockTransport::new()))
        });
        (dialer, state)
    }

    /// A dialer which always fails with `error`.
    pub fn failing(error: Error) -> Self {
        Self::new(move |_| Err(Box::new(error.clone())))
    }

    /// Number of dials attempted.
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// The requests this dialer received.
    pub fn requests(&self) -> Vec<DialRequest> {
        self.requests.lock().clone()
    }
}

impl fmt::Debug for MockDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDialer")
            .field("dials", &self.dials())
            .finish()
    }
}

impl Dialer for MockDialer {
    fn dial(&self, request: DialRequest) -> BoxFuture<'static, Result<Connection, BoxError>> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let result = (self.factory)(&request);
        async move { result }.boxed()
    }
}
