//! The request engine.
//!
//! A [`Client`] turns a method, a URL and [`RequestOptions`] into a
//! [`Response`], retrying failed attempts within the limits of its
//! [`Config`]. Underneath, every destination (target, proxy chain and
//! protocol class) gets its own [pool](self::pool), and every connection in a
//! pool is driven by one worker task. The [connection](self::conn) API is the
//! seam where dialers and executors plug in.

use std::fmt;
use std::future::{pending, Future};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::Method;
use http_body_util::BodyExt as _;
use tokio::sync::oneshot;
use tracing::{debug, trace, Instrument as _};
use url::Url;

mod builder;
pub mod conn;
mod error;
pub mod log;
mod options;
pub mod pool;
pub(crate) mod request;
mod response;

pub use self::builder::{Builder, Config};
pub use self::error::{Error, Source};
pub use self::options::{RequestOptions, ResultCallback};
pub use self::pool::{FailureCallback, PoolKey, ProtocolClass, Registry, TaskContext};
pub use self::request::Target;
pub use self::response::{Response, ResponseBody, Tunnel};

use self::conn::{DialRequest, Dialer};
use self::log::{LogKind, RequestId};
use self::pool::task::{Delivered, Delivery, Flags, Hooks, Outcome, Task};
use self::pool::{Pool, PoolConfig};
use self::request::Prepared;
use self::response::{is_event_stream, Payload};
use crate::cancel::Cause;
use crate::{Body, CancelToken};

/// Inner type for managing the client.
struct ClientRef {
    config: Config,
    pool: PoolConfig,
    registry: Registry,
    dialer: Arc<dyn Dialer>,
    root: CancelToken,
    next_id: AtomicU64,
}

impl ClientRef {
    fn close(&self) {
        if self.root.cancel(Error::ClientClosed) {
            debug!(pools = self.registry.len(), "closing client");
        }
        self.registry.close_all(Error::ClientClosed);
    }
}

impl Drop for ClientRef {
    fn drop(&mut self) {
        self.close();
    }
}

/// A failed attempt, with what the pool learned about it.
#[derive(Debug)]
struct Failed {
    error: Error,
    flags: Flags,
}

impl Failed {
    fn new(error: Error, single_use: bool) -> Self {
        Self {
            error,
            flags: Flags {
                single_use,
                ..Flags::default()
            },
        }
    }
}

/// Cancels an attempt's scope if the caller stops waiting for it.
struct AttemptGuard {
    scope: CancelToken,
    armed: bool,
}

impl AttemptGuard {
    fn new(scope: &CancelToken) -> Self {
        Self {
            scope: scope.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed && self.scope.cancel(Error::Canceled) {
            trace!("attempt abandoned");
        }
    }
}

/// Resolves when `token` fires with an error. Graceful completion never resolves.
fn fired(token: &CancelToken) -> impl Future<Output = Error> + Send + 'static {
    let cancelled = token.cancelled();
    async move {
        match cancelled.await {
            Cause::Error(error) => error,
            Cause::Done => pending().await,
        }
    }
}

/// A pooling HTTP client which retries through misbehaving networks.
///
/// Clones share pools and connections. Dropping the last clone, or calling
/// [`Client::close`], closes every pool.
///
/// # Example
/// ```no_run
/// # use steadfast::client::{Client, RequestOptions};
/// # async fn run() -> Result<(), steadfast::Error> {
/// let client = Client::new_tcp_http();
/// let response = client
///     .get("http://example.com", RequestOptions::new().with_max_retries(2))
///     .await?;
/// println!("{}: {:?}", response.status(), response.content());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pools", &self.inner.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Client {
    pub(crate) fn new(config: Config, dialer: Arc<dyn Dialer>) -> Self {
        let pool = PoolConfig {
            max_connections: config.max_connections_per_pool,
        };
        Client {
            inner: Arc::new(ClientRef {
                config,
                pool,
                registry: Registry::new(),
                dialer,
                root: CancelToken::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create a new builder for clients.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Create a new client which dials plain TCP, with default settings.
    pub fn new_tcp_http() -> Self {
        Builder::default().build()
    }

    /// The client-wide defaults.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The live pools.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Keys of the live pools.
    pub fn pools(&self) -> Vec<PoolKey> {
        self.inner.registry.keys()
    }

    /// Close every pool. Requests in flight fail, and later requests fail with
    /// [`Error::ClientClosed`].
    pub fn close(&self) {
        self.inner.close();
    }

    /// Whether [`Client::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.root.is_cancelled()
    }
}

impl Client {
    /// Make a request, retrying failed attempts.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        if self.is_closed() {
            return Err(Error::ClientClosed);
        }

        let id = RequestId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let span = tracing::debug_span!("request", request.id = %id, %method, %url);
        self.execute(id, method, url, options).instrument(span).await
    }

    async fn execute(
        &self,
        id: RequestId,
        method: Method,
        url: &str,
        mut options: RequestOptions,
    ) -> Result<Response, Error> {
        let config = &self.inner.config;
        let mut prepared = Prepared::new(config, method, url, &mut options, id)?;

        let RequestOptions {
            timeout,
            response_header_timeout,
            max_retries,
            stream,
            cancel,
            on_failure,
            on_result,
            logger,
            ..
        } = options;

        let hooks = Hooks { on_failure, logger };
        let retries = max_retries
            .unwrap_or(config.max_retries)
            .min(config.retry_ceiling);
        let timeout = timeout.or(config.timeout);
        let header_timeout = response_header_timeout.or(config.response_header_timeout);
        let parent = cancel.unwrap_or_else(|| self.inner.root.clone());

        let key = prepared.key();
        let dial = prepared.dial_request(key);
        let url = prepared.url.clone();

        let mut attempt = 0;
        loop {
            let scope = match timeout {
                Some(timeout) => parent.child_with_timeout(timeout),
                None => parent.child(),
            };
            let guard = AttemptGuard::new(&scope);

            let request = prepared.request()?;
            let (task, rx) = Task::new(
                id,
                attempt,
                request,
                prepared.order.clone(),
                scope.clone(),
                header_timeout,
                hooks.clone(),
            );
            let single_use = task.flags.single_use;

            let result = self
                .attempt(&dial, &url, task, rx, &scope, stream, on_result.as_ref())
                .await;

            let Failed { error, flags } = match result {
                Ok(response) => {
                    guard.disarm();
                    return Ok(response);
                }
                Err(failed) => failed,
            };
            drop(guard);

            if flags.notify {
                hooks.log(id, LogKind::Failure, error.to_string());
            }

            let stop = error.is_fatal()
                || flags.disable_retry
                || single_use
                || attempt >= retries
                || parent.is_cancelled()
                || self.is_closed();
            if stop {
                debug!(%error, attempt, "request failed");
                return Err(error);
            }

            debug!(%error, attempt, "attempt failed, retrying");
            hooks.log(
                id,
                LogKind::Retry,
                format!("attempt {} of {} failed: {error}", attempt + 1, retries + 1),
            );
            attempt += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        dial: &DialRequest,
        url: &Url,
        task: Task,
        rx: oneshot::Receiver<Outcome>,
        scope: &CancelToken,
        stream: bool,
        on_result: Option<&ResultCallback>,
    ) -> Result<Response, Failed> {
        let id = task.id;
        let single_use = task.flags.single_use;
        let Delivered {
            head,
            body,
            connection,
        } = self.submit(dial, task, rx, scope).await?;

        let payload = match body {
            Delivery::Tunnel(tunnel) => Payload::Tunnel(tunnel),
            Delivery::Body(body) if stream || is_event_stream(&head.headers) => {
                Payload::Streaming(body)
            }
            Delivery::Body(body) => {
                let read = tokio::select! {
                    biased;
                    error = fired(scope) => Err(error),
                    collected = body.collect() => collected.map(|collected| collected.to_bytes()),
                };
                match read {
                    Ok(data) => Payload::Buffered(data),
                    Err(error) => {
                        let mut failed = Failed::new(error, single_use);
                        failed.flags.enable_retry = true;
                        return Err(failed);
                    }
                }
            }
        };

        let buffered = matches!(payload, Payload::Buffered(_));
        let response = Response::new(id, url.clone(), head, payload, connection);

        if let Some(callback) = on_result {
            if let Err(error) = callback(&response) {
                return Err(Failed::new(Error::callback(error), single_use));
            }
        }

        if buffered {
            scope.finish();
        }
        Ok(response)
    }

    /// Queue `task` on its pool and wait for a worker to answer.
    ///
    /// A connection is dialed when no worker picks the task up. Tasks handed
    /// back by a closing pool are resubmitted a bounded number of times.
    async fn submit(
        &self,
        dial: &DialRequest,
        mut task: Task,
        mut rx: oneshot::Receiver<Outcome>,
        scope: &CancelToken,
    ) -> Result<Delivered, Failed> {
        let single_use = task.flags.single_use;
        let max_resubmits = self.inner.config.max_resubmits;
        let mut resubmits = 0;

        loop {
            if self.is_closed() {
                return Err(Failed::new(Error::ClientClosed, single_use));
            }

            let pool = self
                .inner
                .registry
                .get_or_create(&dial.key, &self.inner.root, &self.inner.pool);

            if let Err(returned) = pool.push(task) {
                task = returned;
                resubmits += 1;
                if resubmits > max_resubmits {
                    let error = pool.force().error().unwrap_or(Error::ConnectionClosed);
                    return Err(Failed::new(Error::PoolClosed(Box::new(error)), single_use));
                }
                trace!(resubmits, "pool closed before queueing, resubmitting");
                continue;
            }

            if pool.needs_connection() {
                // Give a worker which is just finishing a body the chance to
                // take the task before dialing another connection.
                tokio::task::yield_now().await;
                if pool.queued() > 0 && pool.needs_connection() {
                    if let Err(error) = self.dial(&pool, dial, scope).await {
                        if pool.is_closed() || scope.is_cancelled() {
                            return Err(Failed::new(error, single_use));
                        }
                        trace!(%error, "dial failed, waiting for another connection");
                    }
                }
            }

            let outcome = tokio::select! {
                biased;
                outcome = &mut rx => outcome,
                error = fired(scope) => return Err(Failed::new(error, single_use)),
            };

            match outcome {
                Ok(Outcome::Response(delivered)) => return Ok(delivered),
                Ok(Outcome::Failed { error, flags }) => return Err(Failed { error, flags }),
                Ok(Outcome::Requeue {
                    task: returned,
                    error,
                }) => {
                    task = *returned;
                    resubmits += 1;
                    if resubmits > max_resubmits {
                        return Err(Failed {
                            error,
                            flags: task.flags,
                        });
                    }
                    trace!(resubmits, %error, "task handed back, resubmitting");
                    rx = task.rearm();
                }
                Err(_) => return Err(Failed::new(Error::ConnectionClosed, single_use)),
            }
        }
    }

    /// Dial a connection for `pool` and start its worker.
    ///
    /// A failed dial closes the pool when nothing else is serving it, so that
    /// queued tasks are handed back instead of waiting forever.
    async fn dial(
        &self,
        pool: &Arc<Pool>,
        dial: &DialRequest,
        scope: &CancelToken,
    ) -> Result<(), Error> {
        let guard = pool.dialing();
        let connecting = self.inner.dialer.dial(dial.clone());
        let dial_timeout = self.inner.config.dial_timeout;

        let connect = async move {
            match dial_timeout {
                Some(timeout) => match tokio::time::timeout(timeout, connecting).await {
                    Ok(result) => result.map_err(Error::connect),
                    Err(_) => Err(Error::connect(format!("dial timeout after {timeout:?}"))),
                },
                None => connecting.await.map_err(Error::connect),
            }
        };

        let result = tokio::select! {
            biased;
            error = fired(&self.inner.root) => Err(error),
            error = fired(scope) => Err(error),
            result = connect => result,
        };

        match result {
            Ok(connection) => {
                if let Err(connection) = pool.spawn(connection) {
                    trace!("pool closed while dialing");
                    drop(connection);
                }
                drop(guard);
                Ok(())
            }
            Err(error) => {
                drop(guard);
                debug!(pool.key = %pool.key(), %error, "dial failed");
                if pool.is_empty() {
                    pool.close(error.clone());
                }
                Err(error)
            }
        }
    }
}

macro_rules! verb {
    ($name:ident, $method:ident, $doc:literal) => {
        #[doc = $doc]
        pub async fn $name(&self, url: &str, options: RequestOptions) -> Result<Response, Error> {
            self.request(Method::$method, url, options).await
        }
    };
}

impl Client {
    verb!(get, GET, "Make a `GET` request.");
    verb!(head, HEAD, "Make a `HEAD` request.");
    verb!(post, POST, "Make a `POST` request.");
    verb!(put, PUT, "Make a `PUT` request.");
    verb!(patch, PATCH, "Make a `PATCH` request.");
    verb!(delete, DELETE, "Make a `DELETE` request.");
    verb!(options, OPTIONS, "Make an `OPTIONS` request.");
    verb!(trace, TRACE, "Make a `TRACE` request.");
    verb!(connect, CONNECT, "Make a `CONNECT` request.");
}

impl tower::Service<http::Request<Body>> for Client {
    type Response = Response;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            Poll::Ready(Err(Error::ClientClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let client = self.clone();
        let (parts, body) = request.into_parts();
        let mut options = RequestOptions::new().with_body(body);
        options.headers = parts
            .headers
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let url = parts.uri.to_string();

        Box::pin(async move { client.request(parts.method, &url, options).await })
    }
}
