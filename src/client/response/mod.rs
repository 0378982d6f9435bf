//! Responses returned by the client.

use std::fmt;
use std::sync::Weak;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, StatusCode, Version};
use http_body_util::BodyExt as _;
use url::Url;

use crate::client::conn::{ConnectionInfo, ConnectionShared};
use crate::client::log::RequestId;
use crate::client::Error;

mod body;
mod tunnel;

pub use self::body::ResponseBody;
pub use self::tunnel::Tunnel;

pub(crate) enum Payload {
    Buffered(Bytes),
    Streaming(ResponseBody),
    Tunnel(Tunnel),
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Buffered(data) => f.debug_tuple("Buffered").field(&data.len()).finish(),
            Payload::Streaming(body) => f.debug_tuple("Streaming").field(body).finish(),
            Payload::Tunnel(tunnel) => f.debug_tuple("Tunnel").field(tunnel).finish(),
        }
    }
}

/// A response to a client request.
///
/// By default the body has already been read into memory, see
/// [`Response::content`]. Streaming responses (requested with
/// `RequestOptions::stream`, or `text/event-stream`) keep the connection busy
/// until the body is read or dropped. Upgraded responses carry a [`Tunnel`].
#[derive(Debug)]
pub struct Response {
    id: RequestId,
    url: Url,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    payload: Payload,
    connection: Weak<ConnectionShared>,
}

impl Response {
    pub(crate) fn new(
        id: RequestId,
        url: Url,
        head: http::response::Parts,
        payload: Payload,
        connection: Weak<ConnectionShared>,
    ) -> Self {
        Self {
            id,
            url,
            status: head.status,
            version: head.version,
            headers: head.headers,
            payload,
            connection,
        }
    }

    /// The request id, as seen in [`Log`](crate::client::log::Log) records.
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The URL that was requested.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The HTTP version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Whether the connection switched protocols.
    pub fn is_upgrade(&self) -> bool {
        self.status == StatusCode::SWITCHING_PROTOCOLS
    }

    /// Whether this is a server-sent event stream.
    pub fn is_sse(&self) -> bool {
        is_event_stream(&self.headers)
    }

    /// The body, if it was read into memory.
    pub fn content(&self) -> Option<&Bytes> {
        match &self.payload {
            Payload::Buffered(data) => Some(data),
            _ => None,
        }
    }

    /// The connection that served this response, while it is still open.
    pub fn connection(&self) -> Option<ConnectionInfo> {
        body::connection_info(&self.connection)
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        match self.payload {
            Payload::Buffered(data) => Ok(data),
            Payload::Streaming(body) => Ok(body.collect().await?.to_bytes()),
            Payload::Tunnel(_) => Ok(Bytes::new()),
        }
    }

    /// Read the whole body as text. Invalid UTF-8 is replaced.
    pub async fn text(self) -> Result<String, Error> {
        let data = self.bytes().await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// The body as a stream of frames.
    pub fn into_body(self) -> ResponseBody {
        match self.payload {
            Payload::Buffered(data) => ResponseBody::buffered(data, self.id),
            Payload::Streaming(body) => body,
            Payload::Tunnel(_) => ResponseBody::buffered(Bytes::new(), self.id),
        }
    }

    /// The raw stream of an upgraded connection.
    pub fn into_tunnel(self) -> Result<Tunnel, Response> {
        match self.payload {
            Payload::Tunnel(tunnel) => Ok(tunnel),
            payload => Err(Self { payload, ..self }),
        }
    }
}

pub(crate) fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use http::HeaderValue;

    fn head(status: StatusCode, content_type: Option<&'static str>) -> http::response::Parts {
        let mut response = http::Response::new(());
        *response.status_mut() = status;
        if let Some(content_type) = content_type {
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        response.into_parts().0
    }

    fn url() -> Url {
        Url::parse("http://example.com/").unwrap()
    }

    #[test]
    fn event_stream_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_event_stream(&headers));
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert!(is_event_stream(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        assert!(!is_event_stream(&headers));
    }

    #[tokio::test]
    async fn buffered_content() {
        let response = Response::new(
            RequestId::new(3),
            url(),
            head(StatusCode::OK, Some("text/plain")),
            Payload::Buffered(Bytes::from_static(b"hello")),
            Weak::new(),
        );

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.content().unwrap(), "hello");
        assert!(!response.is_sse());
        assert!(response.connection().is_none());
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[test]
    fn into_tunnel_requires_upgrade() {
        let response = Response::new(
            RequestId::new(4),
            url(),
            head(StatusCode::OK, None),
            Payload::Buffered(Bytes::new()),
            Weak::new(),
        );
        let response = response.into_tunnel().unwrap_err();
        assert!(!response.is_upgrade());
    }
}
