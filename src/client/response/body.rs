use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};
use pin_project::{pin_project, pinned_drop};

use crate::cancel::{CancelToken, Cause};
use crate::client::conn::{ConnectionInfo, ConnectionShared};
use crate::client::log::{LogKind, RequestId};
use crate::client::pool::task::Hooks;
use crate::client::Error;
use crate::Body;

/// Fires the body-done token exactly once, and tidies up the attempt scope.
struct Signal {
    done: CancelToken,
    scope: Option<CancelToken>,
    id: RequestId,
    hooks: Hooks,
    fired: bool,
}

impl Signal {
    fn fire(&mut self, cause: Cause) {
        if std::mem::replace(&mut self.fired, true) {
            return;
        }

        let message = match &cause {
            Cause::Done => "complete".to_owned(),
            Cause::Error(error) => error.to_string(),
        };
        tracing::trace!(request.id = %self.id, %message, "response body finished");

        self.done.fire(cause);
        if let Some(scope) = self.scope.take() {
            scope.finish();
        }
        self.hooks.log(self.id, LogKind::ResponseBody, message);
    }
}

/// A response body which reports its own end to the connection that produced it.
///
/// Reading to a clean end-of-stream fires the body-done token gracefully. A
/// read error fires it with that error. Closing or dropping the body before the
/// end fires it with [`Error::BodyClosed`]. The body only holds a weak
/// reference to its connection, so it never keeps a closed connection around.
#[pin_project(PinnedDrop)]
pub struct ResponseBody {
    #[pin]
    inner: Body,
    signal: Signal,
    connection: Weak<ConnectionShared>,
}

impl ResponseBody {
    pub(crate) fn new(
        inner: Body,
        done: CancelToken,
        scope: Option<CancelToken>,
        id: RequestId,
        hooks: Hooks,
        connection: Weak<ConnectionShared>,
    ) -> Self {
        let mut body = Self {
            inner,
            signal: Signal {
                done,
                scope,
                id,
                hooks,
                fired: false,
            },
            connection,
        };

        if body.inner.is_end_stream() {
            body.signal.fire(Cause::Done);
        }
        body
    }

    /// A body over bytes that were already read from the connection.
    pub(crate) fn buffered(data: Bytes, id: RequestId) -> Self {
        Self::new(
            Body::from(data),
            CancelToken::new(),
            None,
            id,
            Hooks::default(),
            Weak::new(),
        )
    }

    /// Whether the body-done signal has been sent.
    pub fn is_finished(&self) -> bool {
        self.signal.fired
    }

    /// The connection this body is streaming from, while it is still open.
    pub fn connection(&self) -> Option<ConnectionInfo> {
        connection_info(&self.connection)
    }

    /// Close the body. Closing before the end of the stream tells the
    /// connection the body was abandoned.
    pub fn close(mut self) {
        self.signal.fire(Cause::Error(Error::BodyClosed));
    }
}

pub(crate) fn connection_info(connection: &Weak<ConnectionShared>) -> Option<ConnectionInfo> {
    connection
        .upgrade()
        .filter(|shared| !shared.is_closed())
        .map(|shared: Arc<ConnectionShared>| shared.info.clone())
}

impl HttpBody for ResponseBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        if this.signal.fired && this.signal.done.cause().is_some_and(|c| c.is_done()) {
            return Poll::Ready(None);
        }

        match ready!(this.inner.as_mut().poll_frame(cx)) {
            Some(Ok(frame)) => {
                if this.inner.is_end_stream() {
                    this.signal.fire(Cause::Done);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(error)) => {
                let error = Error::body(error);
                this.signal.fire(Cause::Error(error.clone()));
                Poll::Ready(Some(Err(error)))
            }
            None => {
                this.signal.fire(Cause::Done);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pinned_drop]
impl PinnedDrop for ResponseBody {
    fn drop(self: Pin<&mut Self>) {
        self.project().signal.fire(Cause::Error(Error::BodyClosed));
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("id", &self.signal.id)
            .field("finished", &self.signal.fired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt as _;
    use parking_lot::Mutex;
    use static_assertions::assert_impl_all;

    use crate::client::log::Log;

    assert_impl_all!(ResponseBody: Send);

    fn body(inner: Body, done: &CancelToken) -> ResponseBody {
        ResponseBody::new(
            inner,
            done.clone(),
            None,
            RequestId::new(1),
            Hooks::default(),
            Weak::new(),
        )
    }

    fn chunks(items: Vec<Result<&'static str, &'static str>>) -> Body {
        Body::wrap_stream(futures_util::stream::iter(
            items
                .into_iter()
                .map(|item| {
                    item.map(|s| Bytes::from_static(s.as_bytes()))
                        .map_err(crate::BoxError::from)
                }),
        ))
    }

    #[tokio::test]
    async fn clean_eof_is_graceful() {
        let done = CancelToken::new();
        let scope = CancelToken::new();
        let logs = Arc::new(Mutex::new(Vec::<Log>::new()));
        let record = logs.clone();
        let hooks = Hooks {
            on_failure: None,
            logger: Some(Arc::new(move |log| record.lock().push(log))),
        };

        let body = ResponseBody::new(
            chunks(vec![Ok("hello "), Ok("world")]),
            done.clone(),
            Some(scope.clone()),
            RequestId::new(9),
            hooks,
            Weak::new(),
        );
        assert!(!done.is_cancelled());

        let data = body.collect().await.unwrap().to_bytes();
        assert_eq!(data, "hello world");

        assert!(done.cause().unwrap().is_done());
        assert!(scope.cause().unwrap().is_done());

        let logs = logs.lock();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].kind, LogKind::ResponseBody);
    }

    #[tokio::test]
    async fn read_error_becomes_cause() {
        let done = CancelToken::new();
        let body = body(chunks(vec![Ok("partial"), Err("reset by peer")]), &done);

        let err = body.collect().await.unwrap_err();
        assert!(err.is_body());
        assert_eq!(err.to_string(), "body error: reset by peer");

        let cause = done.error().unwrap();
        assert!(matches!(cause, Error::Body(_)));
    }

    #[tokio::test]
    async fn drop_before_eof_is_an_error() {
        let done = CancelToken::new();
        let mut body = body(chunks(vec![Ok("a"), Ok("b")]), &done);

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), "a");
        drop(body);

        assert!(matches!(done.error(), Some(Error::BodyClosed)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let done = CancelToken::new();
        let body = body(chunks(vec![Ok("a")]), &done);
        body.close();
        assert!(matches!(done.error(), Some(Error::BodyClosed)));
    }

    #[tokio::test]
    async fn buffered_body_reads_back() {
        let body = ResponseBody::buffered(Bytes::from_static(b"x"), RequestId::new(2));
        let data = body.collect().await.unwrap().to_bytes();
        assert_eq!(data, "x");
    }

    #[test]
    fn empty_body_finishes_immediately() {
        let done = CancelToken::new();
        let body = body(Body::empty(), &done);
        assert!(body.is_finished());
        assert!(done.cause().unwrap().is_done());

        drop(body);
        assert!(done.cause().unwrap().is_done());
    }

    #[test]
    fn connection_is_weak() {
        let done = CancelToken::new();
        let body = body(Body::from("x"), &done);
        assert!(body.connection().is_none());
    }
}
