use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::cancel::{CancelToken, Cause};
use crate::client::conn::BoxIo;
use crate::client::Error;

type Cancelled = Pin<Box<dyn Future<Output = Cause> + Send>>;

/// The raw bidirectional stream left behind by a `101 Switching Protocols`
/// response.
///
/// The connection that produced the tunnel stays in its pool until the tunnel
/// reaches end-of-stream, is shut down or dropped, or fails. A pool force-close
/// still tears the tunnel down: further reads and writes fail.
pub struct Tunnel {
    io: BoxIo,
    done: CancelToken,
    scope: Option<CancelToken>,
    force: Cancelled,
    aborted: Option<Error>,
}

impl Tunnel {
    pub(crate) fn new(io: BoxIo, done: CancelToken, force: &CancelToken) -> Self {
        Self {
            io,
            done,
            scope: None,
            force: Box::pin(force.cancelled()),
            aborted: None,
        }
    }

    /// Finish this scope when the tunnel ends.
    pub(crate) fn with_scope(mut self, scope: CancelToken) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Whether the tunnel has ended.
    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }

    fn fire(&mut self, cause: Cause) {
        if self.done.fire(cause) {
            tracing::trace!("tunnel closed");
        }
        if let Some(scope) = self.scope.take() {
            scope.finish();
        }
    }

    fn fail(&mut self, error: io::Error) -> io::Error {
        let kind = error.kind();
        let error = Error::body(error);
        self.fire(Cause::Error(error.clone()));
        io::Error::new(kind, error)
    }

    fn check_force(&mut self, cx: &mut Context<'_>) -> Result<(), io::Error> {
        if self.aborted.is_none() {
            if let Poll::Ready(cause) = self.force.as_mut().poll(cx) {
                let error = match cause {
                    Cause::Error(error) => error,
                    Cause::Done => Error::ConnectionClosed,
                };
                self.aborted = Some(error.clone());
                self.fire(Cause::Error(error));
            }
        }

        match &self.aborted {
            Some(error) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                error.clone(),
            )),
            None => Ok(()),
        }
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_force(cx)?;

        let before = buf.filled().len();
        match Pin::new(&mut this.io).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if buf.remaining() > 0 && buf.filled().len() == before {
                    this.fire(Cause::Done);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(this.fail(error))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_force(cx)?;

        match Pin::new(&mut this.io).poll_write(cx, buf) {
            Poll::Ready(Err(error)) => Poll::Ready(Err(this.fail(error))),
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.check_force(cx)?;

        match Pin::new(&mut this.io).poll_flush(cx) {
            Poll::Ready(Err(error)) => Poll::Ready(Err(this.fail(error))),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.io).poll_shutdown(cx) {
            Poll::Ready(Ok(())) => {
                this.fire(Cause::Done);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(error)) => Poll::Ready(Err(this.fail(error))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.fire(Cause::Done);
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("closed", &self.is_closed())
            .finish()
    }
}
