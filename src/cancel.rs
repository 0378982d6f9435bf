//! Hierarchical cancellation carrying a cause.
//!
//! A [`CancelToken`] fires at most once. The first [`Cause`] wins, and every
//! child derived from the token fires with the same cause. Children never
//! propagate upwards.
//!
//! [`Cause::Done`] marks graceful completion, which is different from a token
//! that has not fired yet (`cause()` returns `None`).

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::client::Error;

/// The reason a [`CancelToken`] fired.
#[derive(Debug, Clone)]
pub enum Cause {
    /// Completed without error.
    Done,

    /// Cancelled because of an error.
    Error(Error),
}

impl Cause {
    /// Whether this is the graceful, no-error cause.
    pub fn is_done(&self) -> bool {
        matches!(self, Cause::Done)
    }

    /// The error carried by this cause, if any.
    pub fn error(&self) -> Option<&Error> {
        match self {
            Cause::Done => None,
            Cause::Error(error) => Some(error),
        }
    }

    /// Convert into a result, where [`Cause::Done`] is `Ok(())`.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            Cause::Done => Ok(()),
            Cause::Error(error) => Err(error),
        }
    }
}

impl From<Error> for Cause {
    fn from(error: Error) -> Self {
        Cause::Error(error)
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Done => f.write_str("done"),
            Cause::Error(error) => write!(f, "{error}"),
        }
    }
}

struct Inner {
    state: watch::Sender<Option<Cause>>,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn new() -> Arc<Self> {
        let (state, _) = watch::channel(None);
        Arc::new(Self {
            state,
            children: Mutex::new(Vec::new()),
        })
    }

    fn fire(&self, cause: Cause) -> bool {
        let fired = self.state.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(cause.clone());
            true
        });

        if fired {
            let children = std::mem::take(&mut *self.children.lock());
            for child in children.iter().filter_map(Weak::upgrade) {
                child.fire(cause.clone());
            }
        }

        fired
    }

    fn cause(&self) -> Option<Cause> {
        self.state.borrow().clone()
    }
}

/// A cancellation scope which fires once, with a [`Cause`].
///
/// Cloning a token shares the same scope. Use [`CancelToken::child`] to derive
/// a nested scope.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a new root token.
    pub fn new() -> Self {
        Self {
            inner: Inner::new(),
        }
    }

    /// Derive a child token which fires when this token fires.
    ///
    /// If this token has already fired, the child is returned already fired
    /// with the same cause.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let mut children = self.inner.children.lock();

        if let Some(cause) = self.inner.cause() {
            drop(children);
            child.inner.fire(cause);
            return child;
        }

        if children.len() == children.capacity() {
            children.retain(|weak| weak.strong_count() > 0);
        }
        children.push(Arc::downgrade(&child.inner));
        child
    }

    /// Derive a child token which also fires with [`Error::Timeout`] once
    /// `timeout` elapses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn child_with_timeout(&self, timeout: Duration) -> CancelToken {
        let child = self.child();
        let token = child.clone();
        let cancelled = child.cancelled();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled => {},
                _ = tokio::time::sleep(timeout) => {
                    if token.cancel(Error::Timeout(timeout)) {
                        tracing::trace!(?timeout, "token deadline elapsed");
                    }
                }
            }
        });
        child
    }

    /// Fire this token with an error. Returns `true` if this call fired the token.
    pub fn cancel(&self, error: Error) -> bool {
        self.inner.fire(Cause::Error(error))
    }

    /// Fire this token with an arbitrary cause. Returns `true` if this call fired the token.
    pub fn fire(&self, cause: Cause) -> bool {
        self.inner.fire(cause)
    }

    /// Fire this token gracefully with [`Cause::Done`].
    pub fn finish(&self) -> bool {
        self.inner.fire(Cause::Done)
    }

    /// The cause this token fired with, or `None` if it has not fired.
    pub fn cause(&self) -> Option<Cause> {
        self.inner.cause()
    }

    /// The error this token fired with, if it fired with one.
    pub fn error(&self) -> Option<Error> {
        match self.inner.cause() {
            Some(Cause::Error(error)) => Some(error),
            _ => None,
        }
    }

    /// Whether this token has fired, for any cause.
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.borrow().is_some()
    }

    /// Wait for this token to fire and return the cause.
    ///
    /// The returned future owns a handle to the token, so it can be boxed or
    /// stored independently of `self`.
    pub fn cancelled(&self) -> impl Future<Output = Cause> + Send + 'static {
        let inner = self.inner.clone();
        let mut rx = inner.state.subscribe();
        async move {
            let cause = rx
                .wait_for(Option::is_some)
                .await
                .map(|cause| cause.clone());

            // The sender lives in `inner`, so the channel cannot close while we wait.
            drop(inner);
            cause.ok().flatten().unwrap_or(Cause::Done)
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cause", &self.inner.cause())
            .finish()
    }
}
