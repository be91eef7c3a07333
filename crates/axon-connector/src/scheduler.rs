// ABOUTME: Shared timer service for delayed callbacks.
// ABOUTME: A tick loop fires due tasks against the injected clock and isolates their failures.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::error::ConnectorError;
use crate::ids::TokenSequence;

pub const DEFAULT_TICK_FREQUENCY: Duration = Duration::from_millis(100);

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduledTaskHandle(u64);

type Task = BoxFuture<'static, ()>;

enum Command {
    Schedule {
        handle: ScheduledTaskHandle,
        due: Instant,
        task: Task,
    },
    Cancel(ScheduledTaskHandle),
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    clock: Clock,
    tokens: TokenSequence,
    inbox: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("disposed", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl Scheduler {
    /// Start a scheduler. Must be called from within a tokio runtime.
    pub fn new(clock: Clock, tick_frequency: Duration) -> Self {
        let (inbox, commands) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(run(
            clock.clone(),
            tick_frequency.max(Duration::from_millis(1)),
            commands,
            shutdown.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                clock,
                tokens: TokenSequence::new(),
                inbox,
                shutdown,
                worker: Mutex::new(Some(worker)),
            }),
        }
    }

    pub fn now(&self) -> Instant {
        self.inner.clock.now()
    }

    pub fn clock(&self) -> &Clock {
        &self.inner.clock
    }

    /// Run `task` once, no earlier than `now + delay`.
    pub fn schedule_task<F>(&self, task: F, delay: Duration) -> Result<ScheduledTaskHandle, ConnectorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_task_at(task, self.now() + delay)
    }

    pub fn schedule_task_at<F>(&self, task: F, due: Instant) -> Result<ScheduledTaskHandle, ConnectorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectorError::Disposed("scheduler"));
        }
        let handle = ScheduledTaskHandle(self.inner.tokens.next());
        self.inner
            .inbox
            .send(Command::Schedule {
                handle,
                due,
                task: task.boxed(),
            })
            .map_err(|_| ConnectorError::Disposed("scheduler"))?;
        Ok(handle)
    }

    /// Drop a task that has not fired yet. Unknown handles are ignored.
    pub fn cancel(&self, handle: ScheduledTaskHandle) {
        let _ = self.inner.inbox.send(Command::Cancel(handle));
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the tick loop and drop every pending task. Idempotent.
    pub async fn dispose(&self) {
        self.inner.shutdown.cancel();
        let worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

#[derive(Default)]
struct Pending {
    by_due: BTreeMap<(Instant, ScheduledTaskHandle), Task>,
    due_of: HashMap<ScheduledTaskHandle, Instant>,
}

impl Pending {
    fn insert(&mut self, handle: ScheduledTaskHandle, due: Instant, task: Task) {
        self.due_of.insert(handle, due);
        self.by_due.insert((due, handle), task);
    }

    fn cancel(&mut self, handle: ScheduledTaskHandle) {
        if let Some(due) = self.due_of.remove(&handle) {
            self.by_due.remove(&(due, handle));
        }
    }

    fn take_due(&mut self, now: Instant) -> Vec<Task> {
        let later = self
            .by_due
            .split_off(&(now, ScheduledTaskHandle(u64::MAX)));
        let due = std::mem::replace(&mut self.by_due, later);
        due.into_iter()
            .map(|((_, handle), task)| {
                self.due_of.remove(&handle);
                task
            })
            .collect()
    }
}

async fn run(
    clock: Clock,
    tick_frequency: Duration,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
) {
    let mut pending = Pending::default();
    let mut ticker = tokio::time::interval(tick_frequency);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(Command::Schedule { handle, due, task }) => pending.insert(handle, due, task),
                Some(Command::Cancel(handle)) => pending.cancel(handle),
                None => break,
            },
            _ = ticker.tick() => {}
        }

        for task in pending.take_due(clock.now()) {
            tokio::spawn(async move {
                if AssertUnwindSafe(task).catch_unwind().await.is_err() {
                    tracing::error!("scheduled task panicked");
                }
            });
        }
    }

    tracing::debug!(dropped = pending.by_due.len(), "scheduler stopped");
}
