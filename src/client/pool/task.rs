//! A single attempt at executing a request, as seen by the pool.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use http::header::HeaderName;
use http::{Method, Uri};
use tokio::sync::oneshot;
use tracing::warn;

use crate::cancel::CancelToken;
use crate::client::conn::ConnectionShared;
use crate::client::log::{Log, LogKind, Logger, RequestId};
use crate::client::response::{ResponseBody, Tunnel};
use crate::client::Error;
use crate::{Body, BoxError};

/// Per-attempt retry and notification flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    /// The request body cannot be replayed.
    pub(crate) single_use: bool,

    /// The failure was not the task's fault; another attempt is warranted.
    pub(crate) enable_retry: bool,

    /// The caller should hear about this transient failure.
    pub(crate) notify: bool,

    /// The failure callback vetoed any further attempts.
    pub(crate) disable_retry: bool,
}

/// What the failure callback gets to see.
#[derive(Debug)]
#[non_exhaustive]
pub struct TaskContext<'a> {
    /// The request id, stable across attempts.
    pub id: RequestId,

    /// Zero-based attempt number.
    pub attempt: usize,

    /// The request method.
    pub method: &'a Method,

    /// The request URI.
    pub uri: &'a Uri,

    /// The error which ended the attempt.
    pub error: &'a Error,
}

/// Called on every failed attempt. Returning an error replaces the failure and
/// stops retries.
pub type FailureCallback = Arc<dyn Fn(&TaskContext<'_>) -> Option<BoxError> + Send + Sync>;

/// Callbacks carried by every attempt of a request.
#[derive(Clone, Default)]
pub(crate) struct Hooks {
    pub(crate) on_failure: Option<FailureCallback>,
    pub(crate) logger: Option<Logger>,
}

impl Hooks {
    pub(crate) fn log(&self, id: RequestId, kind: LogKind, message: impl Into<String>) {
        if let Some(logger) = &self.logger {
            logger(Log::new(id, kind, message));
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_failure", &self.on_failure.is_some())
            .field("logger", &self.logger.is_some())
            .finish()
    }
}

/// The response handed from a worker to the waiting caller.
#[derive(Debug)]
pub(crate) struct Delivered {
    pub(crate) head: http::response::Parts,
    pub(crate) body: Delivery,
    pub(crate) connection: Weak<ConnectionShared>,
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Body(ResponseBody),
    Tunnel(Tunnel),
}

/// How an attempt ended.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Headers arrived and the body is being streamed.
    Response(Delivered),

    /// The attempt failed.
    Failed { error: Error, flags: Flags },

    /// The task was never dispatched and is handed back for resubmission.
    Requeue { task: Box<Task>, error: Error },
}

/// One execution request, consumed by exactly one connection worker.
pub(crate) struct Task {
    pub(crate) id: RequestId,
    pub(crate) attempt: usize,
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    request: Option<http::Request<Body>>,
    pub(crate) order: Arc<[HeaderName]>,

    /// The attempt's cancellation scope, including its deadline.
    pub(crate) token: CancelToken,
    pub(crate) header_timeout: Option<Duration>,
    pub(crate) flags: Flags,
    pub(crate) hooks: Hooks,
    reply: Option<oneshot::Sender<Outcome>>,
}

impl Task {
    pub(crate) fn new(
        id: RequestId,
        attempt: usize,
        request: http::Request<Body>,
        order: Arc<[HeaderName]>,
        token: CancelToken,
        header_timeout: Option<Duration>,
        hooks: Hooks,
    ) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let flags = Flags {
            single_use: request.body().is_single_use(),
            ..Flags::default()
        };
        let task = Self {
            id,
            attempt,
            method: request.method().clone(),
            uri: request.uri().clone(),
            request: Some(request),
            order,
            token,
            header_timeout,
            flags,
            hooks,
            reply: Some(tx),
        };
        (task, rx)
    }

    /// Re-arm a task that was handed back, so it can be submitted again.
    pub(crate) fn rearm(&mut self) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.reply = Some(tx);
        rx
    }

    /// Take the request for dispatch. Only the first call returns it.
    pub(crate) fn take_request(&mut self) -> Option<http::Request<Body>> {
        self.request.take()
    }

    pub(crate) fn log(&self, kind: LogKind, message: impl Into<String>) {
        self.hooks.log(self.id, kind, message);
    }

    fn send(&mut self, outcome: Outcome) {
        if let Some(reply) = self.reply.take() {
            if reply.send(outcome).is_err() {
                tracing::trace!(request.id = %self.id, "caller went away before the outcome");
            }
        }
    }

    /// Hand the response to the caller.
    pub(crate) fn respond(&mut self, delivered: Delivered) {
        self.send(Outcome::Response(delivered));
    }

    /// Run the failure callback over `error` and report the result.
    ///
    /// Returns the final error, which the worker closes the connection with.
    pub(crate) fn fail(&mut self, error: Error) -> Error {
        let error = self.on_failure(error);
        let flags = self.flags;
        self.send(Outcome::Failed {
            error: error.clone(),
            flags,
        });
        error
    }

    fn on_failure(&mut self, error: Error) -> Error {
        let Some(callback) = self.hooks.on_failure.clone() else {
            return error;
        };

        let context = TaskContext {
            id: self.id,
            attempt: self.attempt,
            method: &self.method,
            uri: &self.uri,
            error: &error,
        };

        match callback(&context) {
            None => error,
            Some(reason) => {
                warn!(request.id = %self.id, original = %error, %reason, "failure callback replaced error");
                self.flags.disable_retry = true;
                self.flags.notify = false;
                Error::Vetoed {
                    reason: Arc::from(reason),
                    original: Box::new(error),
                }
            }
        }
    }

    /// Hand the task back to the caller without having dispatched it.
    pub(crate) fn requeue(mut self, error: Error) {
        if let Some(reply) = self.reply.take() {
            let id = self.id;
            let outcome = Outcome::Requeue {
                task: Box::new(self),
                error,
            };
            if reply.send(outcome).is_err() {
                tracing::trace!(request.id = %id, "caller went away before requeue");
            }
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("attempt", &self.attempt)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("flags", &self.flags)
            .finish()
    }
}
