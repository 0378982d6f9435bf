//! HTTP/1.1 and HTTP/2 executors driven by hyper.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use http::header::{HeaderName, HeaderValue, HOST};
use http::uri::Port;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use hyper::client::conn::{http1, http2};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BoxIo, Connection, Exchange, Executor, HttpProtocol, Io, Transport};
use crate::bridge::io::{HyperIo, TokioIo};
use crate::bridge::rt::TokioExecutor;
use crate::cancel::{CancelToken, Cause};
use crate::client::Error;
use crate::{Body, BoxError};

/// A builder for configuring and starting HTTP connections.
#[derive(Debug, Clone)]
pub struct HttpConnectionBuilder {
    http1: http1::Builder,
    http2: http2::Builder<TokioExecutor>,
}

impl HttpConnectionBuilder {
    /// Get the HTTP/1.1 configuration.
    pub fn http1(&mut self) -> &mut http1::Builder {
        &mut self.http1
    }

    /// Get the HTTP/2 configuration.
    pub fn http2(&mut self) -> &mut http2::Builder<TokioExecutor> {
        &mut self.http2
    }
}

impl Default for HttpConnectionBuilder {
    fn default() -> Self {
        Self {
            http1: http1::Builder::new(),
            http2: http2::Builder::new(TokioExecutor::new()),
        }
    }
}

impl HttpConnectionBuilder {
    async fn handshake_h2<IO>(&self, stream: IO) -> Result<(HttpExecutor, DriverHandle), Error>
    where
        IO: Io,
    {
        trace!("handshake h2");
        let (sender, conn) = self
            .http2
            .handshake(TokioIo::new(stream))
            .await
            .map_err(Error::connect)?;

        let dead = CancelToken::new();
        let token = dead.clone();
        let driver = tokio::spawn(async move {
            match conn.await {
                Ok(()) => {
                    token.finish();
                }
                Err(err) => {
                    if err.is_user() {
                        tracing::error!(%err, "h2 connection driver error");
                    } else {
                        debug!(%err, "h2 connection driver error");
                    }
                    token.cancel(Error::round_trip(err));
                }
            }
        });

        trace!("handshake complete");
        Ok((
            HttpExecutor::new(Sender::H2(sender), HttpProtocol::Http2, dead.clone()),
            DriverHandle {
                abort: driver.abort_handle(),
                dead,
            },
        ))
    }

    async fn handshake_h1<IO>(&self, stream: IO) -> Result<(HttpExecutor, DriverHandle), Error>
    where
        IO: Io,
    {
        trace!("handshake h1");
        let (sender, conn) = self
            .http1
            .handshake(TokioIo::new(stream))
            .await
            .map_err(Error::connect)?;

        let dead = CancelToken::new();
        let token = dead.clone();
        let driver = tokio::spawn(async move {
            match conn.with_upgrades().await {
                Ok(()) => {
                    token.finish();
                }
                Err(err) => {
                    debug!(%err, "h1 connection driver error");
                    token.cancel(Error::round_trip(err));
                }
            }
        });

        trace!("handshake complete");
        Ok((
            HttpExecutor::new(
                Sender::H1(Arc::new(tokio::sync::Mutex::new(sender))),
                HttpProtocol::Http1,
                dead.clone(),
            ),
            DriverHandle {
                abort: driver.abort_handle(),
                dead,
            },
        ))
    }

    /// Run the handshake for `protocol` over `stream`.
    ///
    /// Returns the executor and the handle which owns the connection driver.
    #[tracing::instrument(name = "handshake", skip_all, fields(%protocol))]
    pub async fn handshake<IO>(
        &self,
        stream: IO,
        protocol: HttpProtocol,
    ) -> Result<(HttpExecutor, DriverHandle), Error>
    where
        IO: Io,
    {
        match protocol {
            HttpProtocol::Http1 => self.handshake_h1(stream).await,
            HttpProtocol::Http2 => self.handshake_h2(stream).await,
            HttpProtocol::Http3 | HttpProtocol::Tunnel => Err(Error::Unsupported(format!(
                "{protocol} over a byte stream"
            ))),
        }
    }

    /// Run the handshake and wrap the result in a [`Connection`].
    pub async fn connect<IO>(&self, stream: IO, protocol: HttpProtocol) -> Result<Connection, Error>
    where
        IO: Io,
    {
        let (executor, driver) = self.handshake(stream, protocol).await?;
        Ok(Connection::new(executor, driver))
    }
}

/// Owns the task driving a hyper connection. Closing it aborts the driver,
/// which drops the underlying stream.
#[derive(Debug)]
pub struct DriverHandle {
    abort: tokio::task::AbortHandle,
    dead: CancelToken,
}

impl Transport for DriverHandle {
    fn close(&mut self) -> Result<(), BoxError> {
        self.abort.abort();
        self.dead.cancel(Error::ConnectionClosed);
        Ok(())
    }
}

#[derive(Clone)]
enum Sender {
    H1(Arc<tokio::sync::Mutex<http1::SendRequest<Body>>>),
    H2(http2::SendRequest<Body>),
}

/// Performs exchanges over a hyper HTTP/1.1 or HTTP/2 connection.
///
/// Response bodies are tied to the connection driver: if the driver dies
/// mid-body, the body-done token fires with the driver's error.
pub struct HttpExecutor {
    sender: Sender,
    protocol: HttpProtocol,
    dead: CancelToken,
    upgrade: Arc<Mutex<Option<BoxIo>>>,
    upgraded: Arc<AtomicBool>,
    closed: bool,
}

impl HttpExecutor {
    fn new(sender: Sender, protocol: HttpProtocol, dead: CancelToken) -> Self {
        Self {
            sender,
            protocol,
            dead,
            upgrade: Arc::new(Mutex::new(None)),
            upgraded: Arc::new(AtomicBool::new(false)),
            closed: false,
        }
    }
}

impl fmt::Debug for HttpExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExecutor")
            .field("protocol", &self.protocol)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Executor for HttpExecutor {
    fn protocol(&self) -> HttpProtocol {
        self.protocol
    }

    fn do_request(
        &mut self,
        mut request: http::Request<Body>,
        order: &[HeaderName],
    ) -> BoxFuture<'static, Result<Exchange, BoxError>> {
        if let Err(error) = prepare_request(&mut request, self.protocol, order) {
            return futures_util::future::ready(Err(error)).boxed();
        }

        trace!(request.uri=%request.uri(), req.version=?request.version(), "sending request");

        let sender = self.sender.clone();
        let dead = self.dead.clone();
        let slot = self.upgrade.clone();
        let upgraded = self.upgraded.clone();

        async move {
            let mut response = match sender {
                Sender::H1(sender) => {
                    let sending = {
                        let mut sender = sender.lock().await;
                        sender.ready().await?;
                        sender.send_request(request)
                    };
                    sending.await?
                }
                Sender::H2(mut sender) => {
                    sender.ready().await?;
                    sender.send_request(request).await?
                }
            };

            if response.status() == StatusCode::SWITCHING_PROTOCOLS {
                let io = hyper::upgrade::on(&mut response).await?;
                *slot.lock() = Some(Box::new(HyperIo::new(io)));
                upgraded.store(true, Ordering::Release);
                trace!("connection upgraded");
                return Ok(Exchange::new(
                    response.map(|_| Body::empty()),
                    CancelToken::new(),
                ));
            }

            Ok(Exchange::new(response.map(Body::from), dead.child()))
        }
        .boxed()
    }

    fn stream(&mut self) -> Option<BoxIo> {
        self.upgrade.lock().take()
    }

    fn close_with_error(&mut self, cause: &Error) -> Result<(), BoxError> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        trace!(%cause, "closing executor");
        self.dead.cancel(cause.clone());
        Ok(())
    }

    fn closed(&self) -> BoxFuture<'static, Cause> {
        self.dead.cancelled().boxed()
    }

    fn is_open(&self) -> bool {
        if self.closed || self.upgraded.load(Ordering::Acquire) || self.dead.is_cancelled() {
            return false;
        }
        match &self.sender {
            Sender::H1(_) => true,
            Sender::H2(sender) => !sender.is_closed(),
        }
    }
}

/// Prepare a request for sending over a connection speaking `protocol`.
fn prepare_request(
    request: &mut http::Request<Body>,
    protocol: HttpProtocol,
    order: &[HeaderName],
) -> Result<(), BoxError> {
    match protocol {
        HttpProtocol::Http1 | HttpProtocol::Tunnel => {
            *request.version_mut() = Version::HTTP_11;
            set_host_header(request)?;

            if request.method() == Method::CONNECT {
                authority_form(request.uri_mut())?;
            } else {
                origin_form(request.uri_mut())?;
            }
        }
        HttpProtocol::Http2 => {
            if request.method() == Method::CONNECT {
                return Err(Error::Unsupported("CONNECT over h2".into()).into());
            }
            *request.version_mut() = Version::HTTP_2;
            request.headers_mut().remove(HOST);
        }
        HttpProtocol::Http3 => {
            return Err(Error::Unsupported("h3".into()).into());
        }
    }

    order_headers(request.headers_mut(), order);
    Ok(())
}

/// Rebuild `headers` so that names in `order` come first, in that order.
/// Everything else follows in its original order.
pub(crate) fn order_headers(headers: &mut HeaderMap, order: &[HeaderName]) {
    if order.is_empty() || headers.is_empty() {
        return;
    }

    let mut pairs: Vec<(HeaderName, HeaderValue)> = Vec::with_capacity(headers.len());
    let mut last: Option<HeaderName> = None;
    for (name, value) in std::mem::take(headers) {
        if let Some(name) = name {
            last = Some(name);
        }
        if let Some(name) = &last {
            pairs.push((name.clone(), value));
        }
    }

    for name in order {
        for (_, value) in pairs.iter().filter(|(n, _)| n == name) {
            headers.append(name.clone(), value.clone());
        }
    }

    for (name, value) in pairs.into_iter().filter(|(n, _)| !order.contains(n)) {
        headers.append(name, value);
    }
}

/// Convert the URI to authority-form, used by HTTP/1 CONNECT requests.
fn authority_form(uri: &mut Uri) -> Result<(), BoxError> {
    let authority = uri
        .authority()
        .cloned()
        .ok_or_else(|| Error::InvalidUrl(format!("{uri} has no authority")))?;
    let mut parts = http::uri::Parts::default();
    parts.authority = Some(authority);
    *uri = Uri::from_parts(parts)?;
    Ok(())
}

/// Convert the URI to origin-form, if it is not already.
///
/// This form of the URI has no scheme or authority, and contains just
/// the path, usually used in HTTP/1 requests.
fn origin_form(uri: &mut Uri) -> Result<(), BoxError> {
    let path = match uri.path_and_query() {
        Some(path) if path.as_str() != "/" => {
            let mut parts = http::uri::Parts::default();
            parts.path_and_query = Some(path.clone());
            Uri::from_parts(parts)?
        }
        _none_or_just_slash => Uri::default(),
    };
    *uri = path;
    Ok(())
}

/// Returns the port if it is not the default port for the scheme.
fn get_non_default_port(uri: &Uri) -> Option<Port<&str>> {
    match (uri.port().map(|p| p.as_u16()), is_schema_secure(uri)) {
        (Some(443), true) => None,
        (Some(80), false) => None,
        _ => uri.port(),
    }
}

/// Returns true if the URI scheme is presumed secure.
fn is_schema_secure(uri: &Uri) -> bool {
    uri.scheme_str()
        .map(|scheme_str| matches!(scheme_str, "wss" | "https"))
        .unwrap_or_default()
}

/// Set the Host header on the request if it is not already set,
/// using the authority from the URI.
fn set_host_header<B>(request: &mut http::Request<B>) -> Result<(), BoxError> {
    if request.headers().contains_key(HOST) {
        return Ok(());
    }

    let uri = request.uri();
    let Some(hostname) = uri.host() else {
        return Err(Error::InvalidUrl(format!("{uri} has no host")).into());
    };

    let value = match get_non_default_port(uri) {
        Some(port) => HeaderValue::from_str(&format!("{hostname}:{port}"))?,
        None => HeaderValue::from_str(hostname)?,
    };
    request.headers_mut().insert(HOST, value);
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;

    use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};

    #[test]
    fn test_set_host_header() {
        let mut request = http::Request::new(());
        *request.uri_mut() = "http://example.com".parse().unwrap();
        set_host_header(&mut request).unwrap();
        assert_eq!(request.headers().get(HOST).unwrap(), "example.com");

        let mut request = http::Request::new(());
        *request.uri_mut() = "http://example.com:8080".parse().unwrap();
        set_host_header(&mut request).unwrap();
        assert_eq!(request.headers().get(HOST).unwrap(), "example.com:8080");

        let mut request = http::Request::new(());
        *request.uri_mut() = "https://example.com:8443".parse().unwrap();
        set_host_header(&mut request).unwrap();
        assert_eq!(request.headers().get(HOST).unwrap(), "example.com:8443");

        let mut request = http::Request::new(());
        *request.uri_mut() = "http://example.com".parse().unwrap();
        request
            .headers_mut()
            .insert(HOST, HeaderValue::from_static("override.test"));
        set_host_header(&mut request).unwrap();
        assert_eq!(request.headers().get(HOST).unwrap(), "override.test");
    }

    #[test]
    fn test_host_header_requires_host() {
        let mut request = http::Request::new(());
        *request.uri_mut() = "/relative".parse().unwrap();
        assert!(set_host_header(&mut request).is_err());
    }

    #[test]
    fn test_is_schema_secure() {
        let uri = "http://example.com".parse().unwrap();
        assert!(!is_schema_secure(&uri));

        let uri = "wss://example.com".parse().unwrap();
        assert!(is_schema_secure(&uri));
    }

    #[test]
    fn test_get_non_default_port() {
        let uri = "http://example.com".parse().unwrap();
        assert_eq!(get_non_default_port(&uri).map(|p| p.as_u16()), None);

        let uri = "http://example.com:8080".parse().unwrap();
        assert_eq!(get_non_default_port(&uri).map(|p| p.as_u16()), Some(8080));

        let uri = "https://example.com:443".parse().unwrap();
        assert_eq!(get_non_default_port(&uri).map(|p| p.as_u16()), None);
    }

    #[test]
    fn test_origin_form() {
        let mut uri = "http://example.com".parse().unwrap();
        origin_form(&mut uri).unwrap();
        assert_eq!(uri, "/");

        let mut uri = "http://example.com:8080/some/path?query#fragment"
            .parse()
            .unwrap();
        origin_form(&mut uri).unwrap();
        assert_eq!(uri, "/some/path?query");
    }

    #[test]
    fn test_authority_form() {
        let mut uri = "http://example.com:8080/path".parse().unwrap();
        authority_form(&mut uri).unwrap();
        assert_eq!(uri, "example.com:8080");
    }

    #[test]
    fn ordered_headers_first() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert("x-custom", HeaderValue::from_static("1"));
        headers.append(ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(USER_AGENT, HeaderValue::from_static("ua"));

        order_headers(&mut headers, &[USER_AGENT, ACCEPT, HOST]);

        let names: Vec<_> = headers.keys().map(|k| k.as_str().to_owned()).collect();
        assert_eq!(names, ["user-agent", "accept", "content-type", "x-custom"]);

        let accept: Vec<_> = headers.get_all(ACCEPT).iter().collect();
        assert_eq!(accept, ["text/html", "*/*"]);
    }

    #[test]
    fn prepare_h1_uses_origin_form() {
        let mut request = http::Request::new(Body::empty());
        *request.uri_mut() = "http://example.com:8080/a?b".parse().unwrap();
        prepare_request(&mut request, HttpProtocol::Http1, &[]).unwrap();

        assert_eq!(request.uri(), "/a?b");
        assert_eq!(request.version(), Version::HTTP_11);
        assert_eq!(request.headers().get(HOST).unwrap(), "example.com:8080");
    }

    #[test]
    fn prepare_h2_keeps_absolute_form() {
        let mut request = http::Request::new(Body::empty());
        *request.uri_mut() = "http://example.com/a".parse().unwrap();
        request
            .headers_mut()
            .insert(HOST, HeaderValue::from_static("example.com"));
        prepare_request(&mut request, HttpProtocol::Http2, &[]).unwrap();

        assert_eq!(request.uri(), "http://example.com/a");
        assert_eq!(request.version(), Version::HTTP_2);
        assert!(request.headers().get(HOST).is_none());
    }

    #[tokio::test]
    async fn h1_exchange_over_duplex() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (client, mut server) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let mut read = 0;
            loop {
                let n = server.read(&mut buf[read..]).await.unwrap();
                read += n;
                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            server
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello")
                .await
                .unwrap();
            (String::from_utf8(buf[..read].to_vec()).unwrap(), server)
        });

        let (mut executor, _driver) = HttpConnectionBuilder::default()
            .handshake(client, HttpProtocol::Http1)
            .await
            .unwrap();

        let mut request = http::Request::new(Body::empty());
        *request.uri_mut() = "http://example.com/path".parse().unwrap();
        request
            .headers_mut()
            .insert("x-second", HeaderValue::from_static("2"));
        request
            .headers_mut()
            .insert("x-first", HeaderValue::from_static("1"));

        let order = [HeaderName::from_static("x-first")];
        let exchange = executor.do_request(request, &order).await.unwrap();
        let response = exchange.response.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        use http_body_util::BodyExt;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"hello");

        let (sent, server) = server.await.unwrap();
        assert!(sent.starts_with("GET /path HTTP/1.1\r\n"), "{sent}");
        let first = sent.find("x-first").unwrap();
        let second = sent.find("x-second").unwrap();
        assert!(first < second, "{sent}");
        assert!(executor.is_open());

        // The peer hanging up on the idle connection ends the driver.
        drop(server);
        tokio::time::timeout(std::time::Duration::from_secs(5), executor.closed())
            .await
            .expect("driver noticed the peer closing");
        assert!(!executor.is_open());
    }
}
