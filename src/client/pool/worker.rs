//! The per-connection worker loop.

use std::future::pending;
use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, trace};

use super::task::{Delivered, Delivery, Task};
use super::Pool;
use crate::cancel::Cause;
use crate::client::conn::Connection;
use crate::client::log::LogKind;
use crate::client::response::{ResponseBody, Tunnel};
use crate::client::Error;

enum Next {
    Force(Cause),
    Gone(Cause),
    Task(Option<Task>),
}

fn cause_error(cause: Cause) -> Error {
    match cause {
        Cause::Error(error) => error,
        Cause::Done => Error::ConnectionClosed,
    }
}

/// Serve tasks from `pool` on `conn` until something goes wrong.
///
/// Tasks are handled one at a time. Any task error closes the connection and
/// ends the loop; the pool is told when the worker exits.
pub(super) async fn run(pool: Arc<Pool>, mut conn: Connection) {
    let force = conn.force().clone();

    let cause = loop {
        pool.idle.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        let next = tokio::select! {
            biased;
            cause = force.cancelled() => Next::Force(cause),
            cause = conn.closed() => Next::Gone(cause),
            task = pool.queue.pop() => Next::Task(task),
        };
        pool.idle.fetch_sub(1, std::sync::atomic::Ordering::AcqRel);

        match next {
            Next::Force(cause) => {
                trace!("connection force-closed");
                break cause_error(cause);
            }
            Next::Gone(cause) => {
                debug!(cause = ?cause.error(), "idle connection closed by peer");
                break cause_error(cause);
            }
            Next::Task(None) => {
                trace!("queue closed");
                break pool.force.error().unwrap_or(Error::ConnectionClosed);
            }
            Next::Task(Some(task)) => {
                if let Err(error) = run_task(&mut conn, task).await {
                    debug!(%error, "task failed, closing connection");
                    break error;
                }

                if !conn.is_open() {
                    trace!("connection no longer accepts tasks");
                    break Error::ConnectionClosed;
                }
            }
        }
    };

    if let Err(error) = conn.close_with_error(&cause) {
        debug!(%error, "error closing connection");
    }
    pool.release(cause);
}

/// Execute one task on `conn`.
///
/// Returns an error when the connection must not serve another task.
pub(super) async fn run_task(conn: &mut Connection, mut task: Task) -> Result<(), Error> {
    if let Some(cause) = task.token.cause() {
        // The caller gave up while the task was queued; the connection is untouched.
        trace!(request.id = %task.id, "task cancelled before dispatch");
        task.fail(cause_error_or(cause, Error::Canceled));
        return Ok(());
    }

    let force = conn.force().clone();
    if let Some(cause) = force.cause() {
        let error = cause_error(cause);
        task.flags.enable_retry = true;
        task.flags.notify = true;
        task.requeue(error.clone());
        return Err(error);
    }

    if !conn.is_open() {
        // The connection died after the task was taken off the queue.
        trace!(request.id = %task.id, "connection closed before dispatch");
        task.flags.enable_retry = true;
        task.flags.notify = true;
        task.requeue(Error::ConnectionClosed);
        return Err(Error::ConnectionClosed);
    }

    let Some(request) = task.take_request() else {
        task.fail(Error::NoResponse);
        return Ok(());
    };

    trace!(request.id = %task.id, attempt = task.attempt, "dispatch");
    let exchange = conn.executor().do_request(request, &task.order);
    let header_timeout = task.header_timeout;
    let headers_due = async move {
        match header_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => pending().await,
        }
    };
    let cancelled = task.token.cancelled();

    let result = tokio::select! {
        biased;
        cause = force.cancelled() => {
            task.flags.enable_retry = true;
            task.flags.notify = true;
            Err(cause_error(cause))
        }
        () = headers_due => Err(Error::HeaderTimeout(header_timeout.unwrap_or_default())),
        cause = cancelled => Err(cause_error_or(cause, Error::Canceled)),
        exchange = exchange => exchange.map_err(Error::round_trip),
    };

    let exchange = match result {
        Ok(exchange) => exchange,
        Err(error) => return Err(task.fail(error)),
    };

    let Some(response) = exchange.response else {
        let error = task.token.error().unwrap_or(Error::NoResponse);
        return Err(task.fail(error));
    };

    task.log(
        LogKind::ResponseHeader,
        format!("{} {} {}", response.status(), task.method, task.uri),
    );

    let body_done = exchange.body_done;
    let upgrade = response.status() == StatusCode::SWITCHING_PROTOCOLS;
    let (head, body) = response.into_parts();
    let connection = Arc::downgrade(conn.shared());

    let body = if upgrade {
        match conn.executor().stream() {
            Some(io) => Delivery::Tunnel(
                Tunnel::new(io, body_done.clone(), &force).with_scope(task.token.clone()),
            ),
            None => {
                let error = Error::round_trip("101 response without an upgraded stream");
                return Err(task.fail(error));
            }
        }
    } else {
        Delivery::Body(ResponseBody::new(
            body,
            body_done.clone(),
            Some(task.token.clone()),
            task.id,
            task.hooks.clone(),
            connection.clone(),
        ))
    };

    task.respond(Delivered {
        head,
        body,
        connection,
    });

    // Phase two: hold the connection until the body is done with it.
    let result = if upgrade {
        // An upgraded connection belongs to the tunnel, not the request deadline.
        tokio::select! {
            biased;
            cause = force.cancelled() => Err(cause_error(cause)),
            cause = body_done.cancelled() => cause.into_result(),
        }
    } else {
        tokio::select! {
            biased;
            cause = force.cancelled() => Err(cause_error(cause)),
            cause = body_done.cancelled() => cause.into_result(),
            cause = task.token.cancelled() => cause.into_result(),
        }
    };

    if let Err(error) = &result {
        trace!(request.id = %task.id, %error, "body ended with error");
    }
    result
}

fn cause_error_or(cause: Cause, done: Error) -> Error {
    match cause {
        Cause::Error(error) => error,
        Cause::Done => done,
    }
}
