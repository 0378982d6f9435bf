//! Turning a method, URL and [`RequestOptions`] into requests for each attempt.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use http::header::{
    HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONNECTION, CONTENT_TYPE, HOST, REFERER,
    SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_VERSION, UPGRADE, USER_AGENT,
};
use http::{HeaderMap, Method, Uri};
use url::Url;

use super::builder::Config;
use super::conn::{DialRequest, Proxy};
use super::log::RequestId;
use super::options::RequestOptions;
use super::pool::{PoolKey, ProtocolClass};
use super::Error;
use crate::Body;

/// The destination of a request: scheme, host and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    secure: bool,
    host: String,
    port: u16,
}

impl Target {
    /// Parse the destination out of a URL.
    pub fn parse(url: &str) -> Result<Self, Error> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        Self::from_url(&url)
    }

    /// The destination of a parsed URL. WebSocket schemes map to their HTTP
    /// counterparts.
    pub fn from_url(url: &Url) -> Result<Self, Error> {
        let secure = match url.scheme() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => return Err(Error::InvalidUrl(format!("{url}: unsupported scheme {other}"))),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidUrl(format!("{url}: missing host")))?
            .to_owned();

        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        Ok(Self { secure, host, port })
    }

    /// Whether the destination expects TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// The HTTP scheme.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// The host, with brackets around IPv6 literals.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted from the scheme.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme(), self.host, self.port)
    }
}

/// Everything fixed about a request across its attempts.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) target: Target,
    pub(crate) proxies: Vec<Proxy>,
    pub(crate) protocol: ProtocolClass,
    pub(crate) order: Arc<[HeaderName]>,
    headers: HeaderMap,
    body: Body,
}

impl Prepared {
    pub(crate) fn new(
        config: &Config,
        method: Method,
        url: &str,
        options: &mut RequestOptions,
        id: RequestId,
    ) -> Result<Self, Error> {
        if let Some(error) = options.error.take() {
            return Err(error);
        }

        let mut url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let websocket = matches!(url.scheme(), "ws" | "wss");
        let target = Target::from_url(&url)?;
        if websocket && url.set_scheme(target.scheme()).is_err() {
            return Err(Error::InvalidUrl(format!("{url}: cannot map to http")));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in options.headers.drain(..) {
            headers.append(name, value);
        }

        if !url.username().is_empty() || url.password().is_some() {
            let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
            let value = format!(
                "Basic {}",
                base64::engine::general_purpose::STANDARD.encode(credentials)
            );
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&value).map_err(Error::build)?);
            let _ = url.set_username("");
            let _ = url.set_password(None);
        }

        let user_agent = options
            .user_agent
            .as_deref()
            .or(config.user_agent.as_deref());
        match user_agent {
            Some(agent) if options.user_agent.is_some() || !headers.contains_key(USER_AGENT) => {
                headers.insert(USER_AGENT, HeaderValue::from_str(agent).map_err(Error::build)?);
            }
            _ => {}
        }

        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }

        if !headers.contains_key(REFERER) {
            let referer = match &options.referer {
                Some(referer) => referer.clone(),
                None => format!("{}://{}", target.scheme(), url_authority(&url)),
            };
            headers.insert(REFERER, HeaderValue::from_str(&referer).map_err(Error::build)?);
        }

        if let Some(content_type) = &options.content_type {
            if !headers.contains_key(CONTENT_TYPE) {
                headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_str(content_type).map_err(Error::build)?,
                );
            }
        }

        if let Some(host) = &options.host {
            headers.insert(HOST, HeaderValue::from_str(host).map_err(Error::build)?);
        }

        if websocket {
            websocket_headers(&mut headers, id);
        }

        let protocol = if websocket || options.force_http1 {
            ProtocolClass::Http1
        } else if options.http3 {
            ProtocolClass::Http3
        } else if options.http2_prior_knowledge {
            ProtocolClass::Http2
        } else {
            ProtocolClass::Auto
        };

        let proxies = options
            .proxy
            .iter()
            .chain(options.proxies.iter())
            .map(|proxy| Proxy::parse(proxy))
            .collect::<Result<Vec<_>, _>>()?;

        let order: Arc<[HeaderName]> = match options.order_headers.take() {
            Some(order) => order.into(),
            None => config.order_headers.clone(),
        };

        Ok(Self {
            method,
            url,
            target,
            proxies,
            protocol,
            order,
            headers,
            body: options.body.take().unwrap_or_default(),
        })
    }

    /// The pool this request belongs to.
    pub(crate) fn key(&self) -> PoolKey {
        PoolKey::new(&self.target, &self.proxies, self.protocol)
    }

    pub(crate) fn dial_request(&self, key: PoolKey) -> DialRequest {
        DialRequest {
            key,
            target: self.target.clone(),
            proxies: self.proxies.clone(),
            protocol: self.protocol,
        }
    }

    /// Build the request for one attempt, from a fresh copy of the URL.
    ///
    /// Replayable bodies are cloned. A single-use body is handed to the first
    /// attempt only.
    pub(crate) fn request(&mut self) -> Result<http::Request<Body>, Error> {
        let mut url = self.url.clone();
        url.set_fragment(None);
        let uri: Uri = url.as_str().parse().map_err(Error::build)?;

        let body = match self.body.try_clone() {
            Some(body) => body,
            None => std::mem::take(&mut self.body),
        };

        let mut request = http::Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

fn url_authority(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_owned(),
        (None, _) => String::new(),
    }
}

fn websocket_headers(headers: &mut HeaderMap, id: RequestId) {
    if !headers.contains_key(CONNECTION) {
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    }
    if !headers.contains_key(UPGRADE) {
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    }
    if !headers.contains_key(SEC_WEBSOCKET_VERSION) {
        headers.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    }
    if !headers.contains_key(SEC_WEBSOCKET_KEY) {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let nonce = ((nanos as u128) << 64) | id.get() as u128;
        let key = base64::engine::general_purpose::STANDARD.encode(nonce.to_be_bytes());
        if let Ok(value) = HeaderValue::from_str(&key) {
            headers.insert(SEC_WEBSOCKET_KEY, value);
        }
    }
}
