//! Per-destination connection pools.
//!
//! A [`Pool`] owns a task queue, a force-close token and a count of the
//! connections serving it. Each connection gets its own worker, which pulls
//! tasks off the queue one at a time. When the last worker exits, the pool
//! force-closes, removes itself from its [`Registry`], and hands any tasks
//! still queued back to their callers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, Instrument as _};

mod key;
mod registry;
pub(crate) mod task;
mod worker;

pub use self::key::{PoolKey, ProtocolClass};
pub use self::registry::Registry;
pub use self::task::{FailureCallback, TaskContext};

use self::registry::Map;
use self::task::Task;
use crate::cancel::CancelToken;
use crate::client::conn::{Connection, ConnectionId};
use crate::client::Error;

/// Pool limits.
#[derive(Debug, Clone, Default)]
pub(crate) struct PoolConfig {
    /// Upper bound on connections per pool, counting those being dialed.
    pub(crate) max_connections: Option<usize>,
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    closed: bool,
}

/// A many-producer, many-consumer task queue.
#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn push(&self, task: Task) -> Result<(), Task> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(task);
        }
        state.tasks.push_back(task);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next task. Returns `None` once the queue is closed.
    async fn pop(&self) -> Option<Task> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(task) = state.tasks.pop_front() {
                    return Some(task);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn close(&self) -> Vec<Task> {
        let mut state = self.state.lock();
        state.closed = true;
        let tasks = state.tasks.drain(..).collect();
        drop(state);
        self.notify.notify_waiters();
        tasks
    }

    fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }
}

/// A set of connections to one destination, sharing one task queue.
pub struct Pool {
    key: PoolKey,
    queue: Queue,
    force: CancelToken,
    closed: AtomicBool,
    active: AtomicUsize,
    idle: AtomicUsize,
    dialing: AtomicUsize,
    next_id: AtomicU64,
    config: PoolConfig,
    registry: Weak<Map>,
}

impl Pool {
    pub(crate) fn new(
        key: PoolKey,
        parent: &CancelToken,
        config: &PoolConfig,
        registry: Weak<Map>,
    ) -> Arc<Self> {
        trace!(pool.key = %key, "new pool");
        Arc::new(Self {
            key,
            queue: Queue::default(),
            force: parent.child(),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            dialing: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            config: config.clone(),
            registry,
        })
    }

    /// The key this pool serves.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The pool's force-close scope.
    pub fn force(&self) -> &CancelToken {
        &self.force
    }

    /// Number of connections with a running worker.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of workers waiting for a task.
    pub fn idle(&self) -> usize {
        self.idle.load(Ordering::Acquire)
    }

    /// Number of tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether the pool has closed. A closed pool accepts no tasks.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.force.is_cancelled()
    }

    /// Whether a caller about to queue a task should dial another connection.
    pub(crate) fn needs_connection(&self) -> bool {
        if self.idle() > 0 {
            return false;
        }
        match self.config.max_connections {
            Some(max) => self.active() + self.dialing.load(Ordering::Acquire) < max,
            None => true,
        }
    }

    /// Note that a dial is in progress until the guard drops.
    pub(crate) fn dialing(self: &Arc<Self>) -> DialGuard {
        self.dialing.fetch_add(1, Ordering::AcqRel);
        DialGuard { pool: self.clone() }
    }

    /// Whether the pool has no connections and none on the way.
    pub(crate) fn is_empty(&self) -> bool {
        self.active() == 0 && self.dialing.load(Ordering::Acquire) == 0
    }

    /// Queue a task. A closed pool hands the task back.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        if self.is_closed() {
            return Err(task);
        }
        trace!(pool.key = %self.key, request.id = %task.id, "queue task");
        self.queue.push(task)
    }

    /// Start a worker for `conn`. A closed pool hands the connection back.
    pub fn spawn(self: &Arc<Self>, mut conn: Connection) -> Result<ConnectionId, Connection> {
        self.active.fetch_add(1, Ordering::AcqRel);
        if self.is_closed() {
            self.release(Error::ConnectionClosed);
            return Err(conn);
        }

        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        conn.attach(&self.force, id, self.key.clone());

        let span = tracing::debug_span!("connection", pool.key = %self.key, conn.id = %id);
        debug!(parent: &span, protocol = %conn.protocol(), "connection joined pool");
        tokio::spawn(worker::run(self.clone(), conn).instrument(span));
        Ok(id)
    }

    /// A worker has exited. The last one out closes the pool.
    fn release(&self, cause: Error) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "active connection count underflow");
        if previous == 1 {
            self.close(cause);
        }
    }

    /// Force-close the pool. Runs at most once.
    ///
    /// Every connection is cancelled with `cause`, the pool leaves its
    /// registry, and queued tasks are handed back with [`Error::PoolClosed`].
    pub fn close(&self, cause: Error) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!(pool.key = %self.key, %cause, "closing pool");
        self.force.cancel(cause.clone());

        if let Some(map) = self.registry.upgrade() {
            registry::deregister(&map, self);
        }

        let cause = self.force.error().unwrap_or(cause);
        for task in self.queue.close() {
            task.requeue(Error::PoolClosed(Box::new(cause.clone())));
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("key", &self.key)
            .field("active", &self.active())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Tracks an in-progress dial.
#[derive(Debug)]
pub(crate) struct DialGuard {
    pool: Arc<Pool>,
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        self.pool.dialing.fetch_sub(1, Ordering::AcqRel);
    }
}
