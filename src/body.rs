//! Request and response bodies.
//!
//! [`Body`] wraps the body types the client deals with, and remembers whether
//! it can be replayed. Bodies built from bytes can be cloned for another
//! attempt; bodies built from a stream are single-use.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};

use crate::BoxError;

/// A wrapper for the body types used by the client, which implements
/// [http_body::Body](http_body::Body).
///
/// Bodies can be created from [`Bytes`](bytes::Bytes), [`String`](std::string::String),
/// `Vec<u8>` or [`&'static str`](str) using [`From`](std::convert::From) implementations.
/// Such bodies are replayable, see [`Body::try_clone`].
#[derive(Debug)]
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
}

impl Body {
    /// Create a new `Body` that wraps another [`http_body::Body`].
    ///
    /// The resulting body is single-use.
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        try_downcast(body).unwrap_or_else(|body| Self {
            inner: InnerBody::Boxed(Box::pin(body.map_err(Into::into))),
        })
    }

    /// Create a single-use body from a stream of byte chunks.
    pub fn wrap_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let frames = futures_util::StreamExt::map(stream, |chunk| {
            chunk.map(Frame::data).map_err(Into::into)
        });
        Self {
            inner: InnerBody::Boxed(Box::pin(StreamBody::new(frames))),
        }
    }

    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
        }
    }

    /// Whether this body comes from a stream which cannot be replayed.
    pub fn is_single_use(&self) -> bool {
        matches!(self.inner, InnerBody::Boxed(_) | InnerBody::Incoming(_))
    }

    /// Clone a replayable body. Returns `None` for single-use bodies.
    pub fn try_clone(&self) -> Option<Body> {
        match &self.inner {
            InnerBody::Empty => Some(Body::empty()),
            InnerBody::Full(data) => Some(Self {
                inner: InnerBody::Full(data.clone()),
            }),
            InnerBody::Boxed(_) | InnerBody::Incoming(_) => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self {
            inner: InnerBody::full(body),
        }
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Bytes::from(body).into()
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Bytes::from(body).into()
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Bytes::from_static(body.as_bytes()).into()
    }
}

impl From<&'static [u8]> for Body {
    fn from(body: &'static [u8]) -> Self {
        Bytes::from_static(body).into()
    }
}

impl From<hyper::body::Incoming> for Body {
    fn from(body: hyper::body::Incoming) -> Self {
        Self {
            inner: InnerBody::Incoming(body),
        }
    }
}

fn try_downcast<T, K>(k: K) -> Result<T, K>
where
    T: 'static,
    K: Send + 'static,
{
    let mut slot = Some(k);
    if let Some(inner) = <dyn std::any::Any>::downcast_mut::<Option<T>>(&mut slot) {
        if let Some(value) = inner.take() {
            return Ok(value);
        }
    }

    match slot {
        Some(k) => Err(k),
        None => unreachable!("body slot is only emptied by a successful downcast"),
    }
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(Option<Bytes>),
    Boxed(#[pin] Pin<Box<dyn http_body::Body<Data = Bytes, Error = BoxError> + Send + 'static>>),
    Incoming(#[pin] hyper::body::Incoming),
}

impl InnerBody {
    fn full(data: Bytes) -> Self {
        if data.is_empty() {
            Self::Empty
        } else {
            Self::Full(Some(data))
        }
    }
}

macro_rules! poll_frame {
    ($body:ident, $cx:ident) => {
        $body
            .poll_frame($cx)
            .map(|opt| opt.map(|res| res.map_err(Into::into)))
    };
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(data) => Poll::Ready(data.take().map(|data| Ok(Frame::data(data)))),
            InnerBodyProj::Boxed(body) => poll_frame!(body, cx),
            InnerBodyProj::Incoming(body) => poll_frame!(body, cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(ref data) => data.is_none(),
            InnerBody::Boxed(ref body) => body.is_end_stream(),
            InnerBody::Incoming(ref body) => body.is_end_stream(),
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self.inner {
            InnerBody::Empty => http_body::SizeHint::with_exact(0),
            InnerBody::Full(ref data) => {
                http_body::SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            InnerBody::Boxed(ref body) => body.size_hint(),
            InnerBody::Incoming(ref body) => body.size_hint(),
        }
    }
}

impl fmt::Debug for InnerBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(_) => f.debug_struct("Full").finish(),
            InnerBody::Boxed(_) => f.debug_struct("Boxed").finish(),
            InnerBody::Incoming(_) => f.debug_struct("Incoming").finish(),
        }
    }
}
