// ABOUTME: Single-threaded message-processing actor used by every stateful channel.
// ABOUTME: Serializes state changes through a mailbox and publishes snapshots through a watch channel.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;
use crate::scheduler::{ScheduledTaskHandle, Scheduler};

/// The state an actor folds its messages into.
///
/// A fold that returns an error or panics is rolled back: the actor keeps the
/// state it had before the message. Shared resources (streams, tasks, completion
/// sources) sit behind handles, so a clone only copies the bookkeeping.
#[async_trait]
pub trait Receive<M>: Clone + Send + 'static
where
    M: Send + 'static,
{
    /// Read-only view, published whenever it changes.
    type Snapshot: Clone + PartialEq + Send + Sync + fmt::Debug + 'static;

    /// Handle one message. An error is logged, the state is restored and the
    /// actor keeps running.
    async fn receive(&mut self, message: M, actor: &ActorRef<M>) -> Result<(), ConnectorError>;

    fn snapshot(&self) -> Self::Snapshot;

    /// Called once when the actor stops.
    async fn stopped(&mut self) {}
}

/// Address of an actor, used to send it messages.
pub struct ActorRef<M> {
    name: Arc<str>,
    inbox: mpsc::UnboundedSender<M>,
    scheduler: Scheduler,
    stopped: CancellationToken,
}

impl<M> Clone for ActorRef<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inbox: self.inbox.clone(),
            scheduler: self.scheduler.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<M> fmt::Debug for ActorRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("name", &self.name)
            .field("stopped", &self.stopped.is_cancelled())
            .finish()
    }
}

impl<M: Send + 'static> ActorRef<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message. Returns once enqueued, not once processed.
    pub fn tell(&self, message: M) -> Result<(), ConnectorError> {
        if self.stopped.is_cancelled() {
            return Err(ConnectorError::Disposed("actor"));
        }
        self.inbox
            .send(message)
            .map_err(|_| ConnectorError::Disposed("actor"))
    }

    /// Deliver `message` to this actor after `delay`.
    pub fn schedule(&self, message: M, delay: Duration) -> Result<ScheduledTaskHandle, ConnectorError> {
        self.schedule_with_cancellation(message, delay, CancellationToken::new())
    }

    /// Deliver `message` after `delay` unless `cancellation` fires first.
    pub fn schedule_with_cancellation(
        &self,
        message: M,
        delay: Duration,
        cancellation: CancellationToken,
    ) -> Result<ScheduledTaskHandle, ConnectorError> {
        let actor = self.clone();
        self.scheduler.schedule_task(
            async move {
                if cancellation.is_cancelled() {
                    return;
                }
                if actor.tell(message).is_err() {
                    tracing::debug!(actor = %actor.name, "scheduled message dropped, actor stopped");
                }
            },
            delay,
        )
    }

    pub fn now(&self) -> Instant {
        self.scheduler.now()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}

/// An actor address whose message loop has not started yet.
///
/// Lets state that must talk to its own actor (timers, callbacks) be built
/// before the actor is started with [`AxonActor::start`].
pub struct Mailbox<M> {
    actor: ActorRef<M>,
    messages: mpsc::UnboundedReceiver<M>,
}

impl<M: Send + 'static> Mailbox<M> {
    pub fn new(name: impl Into<String>, scheduler: Scheduler) -> Self {
        let (inbox, messages) = mpsc::unbounded_channel();
        Self {
            actor: ActorRef {
                name: Arc::from(name.into()),
                inbox,
                scheduler,
                stopped: CancellationToken::new(),
            },
            messages,
        }
    }

    pub fn actor_ref(&self) -> ActorRef<M> {
        self.actor.clone()
    }
}

/// A running actor together with its latest state snapshot.
pub struct AxonActor<M, S>
where
    M: Send + 'static,
    S: Receive<M>,
{
    actor: ActorRef<M>,
    snapshot: watch::Receiver<S::Snapshot>,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<M, S> fmt::Debug for AxonActor<M, S>
where
    M: Send + 'static,
    S: Receive<M>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxonActor")
            .field("name", &self.actor.name)
            .field("state", &*self.snapshot.borrow())
            .finish()
    }
}

impl<M, S> AxonActor<M, S>
where
    M: fmt::Debug + Send + 'static,
    S: Receive<M>,
{
    /// Start the actor's message loop on the current runtime.
    pub fn spawn(name: impl Into<String>, state: S, scheduler: Scheduler) -> Self {
        Self::start(Mailbox::new(name, scheduler), state)
    }

    /// Start the loop on a mailbox whose address was handed out earlier.
    pub fn start(mailbox: Mailbox<M>, state: S) -> Self {
        let Mailbox { actor, messages } = mailbox;
        let (publish, snapshot) = watch::channel(state.snapshot());
        let worker = tokio::spawn(run(state, messages, actor.clone(), publish));
        Self {
            actor,
            snapshot,
            disposed: AtomicBool::new(false),
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn tell(&self, message: M) -> Result<(), ConnectorError> {
        self.actor.tell(message)
    }

    pub fn schedule(&self, message: M, delay: Duration) -> Result<ScheduledTaskHandle, ConnectorError> {
        self.actor.schedule(message, delay)
    }

    pub fn schedule_with_cancellation(
        &self,
        message: M,
        delay: Duration,
        cancellation: CancellationToken,
    ) -> Result<ScheduledTaskHandle, ConnectorError> {
        self.actor
            .schedule_with_cancellation(message, delay, cancellation)
    }

    /// Most recently published state. Never blocks the mailbox.
    pub fn state(&self) -> S::Snapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<S::Snapshot> {
        self.snapshot.clone()
    }

    pub fn actor_ref(&self) -> ActorRef<M> {
        self.actor.clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop accepting messages, drop the mailbox and wait for the loop to end.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.actor.stopped.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                tracing::error!(actor = %self.actor.name, error = %err, "actor loop ended abnormally");
            }
        }
    }
}

async fn run<M, S>(
    mut state: S,
    mut messages: mpsc::UnboundedReceiver<M>,
    actor: ActorRef<M>,
    publish: watch::Sender<S::Snapshot>,
) where
    M: fmt::Debug + Send + 'static,
    S: Receive<M>,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = actor.stopped.cancelled() => break,
            message = messages.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tracing::debug!(actor = %actor.name, ?message, "received");
        let last_good = state.clone();
        let outcome = AssertUnwindSafe(state.receive(message, &actor))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(actor = %actor.name, error = %err, "failed to handle message");
                state = last_good;
            }
            Err(_) => {
                tracing::error!(actor = %actor.name, "message handler panicked");
                state = last_good;
            }
        }
        publish_if_changed(&publish, state.snapshot());
    }

    messages.close();
    let dropped = std::iter::from_fn(|| messages.try_recv().ok()).count();
    if dropped > 0 {
        tracing::debug!(actor = %actor.name, dropped, "discarded pending messages");
    }
    state.stopped().await;
    publish_if_changed(&publish, state.snapshot());
}

fn publish_if_changed<T: PartialEq>(publish: &watch::Sender<T>, snapshot: T) {
    publish.send_if_modified(|current| {
        if *current == snapshot {
            return false;
        }
        *current = snapshot;
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use tokio::sync::oneshot;

    #[derive(Debug)]
    enum CounterMessage {
        Add(i64),
        AddThenFail(i64),
        AddThenPanic(i64),
        Fail,
        Panic,
        Get(oneshot::Sender<i64>),
    }

    #[derive(Clone)]
    struct Counter {
        total: i64,
    }

    #[async_trait]
    impl Receive<CounterMessage> for Counter {
        type Snapshot = i64;

        async fn receive(
            &mut self,
            message: CounterMessage,
            _actor: &ActorRef<CounterMessage>,
        ) -> Result<(), ConnectorError> {
            match message {
                CounterMessage::Add(value) => self.total += value,
                CounterMessage::AddThenFail(value) => {
                    self.total += value;
                    return Err(ConnectorError::InvalidArgument("refused".into()));
                }
                CounterMessage::AddThenPanic(value) => {
                    self.total += value;
                    panic!("handler exploded halfway");
                }
                CounterMessage::Fail => {
                    return Err(ConnectorError::InvalidArgument("refused".into()));
                }
                CounterMessage::Panic => panic!("handler exploded"),
                CounterMessage::Get(reply) => {
                    let _ = reply.send(self.total);
                }
            }
            Ok(())
        }

        fn snapshot(&self) -> i64 {
            self.total
        }
    }

    fn counter() -> AxonActor<CounterMessage, Counter> {
        let scheduler = Scheduler::new(Clock::system(), Duration::from_millis(10));
        AxonActor::spawn("counter", Counter { total: 0 }, scheduler)
    }

    async fn total(actor: &AxonActor<CounterMessage, Counter>) -> i64 {
        let (tx, rx) = oneshot::channel();
        actor.tell(CounterMessage::Get(tx)).unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_order() {
        let actor = counter();
        for value in 1..=10 {
            actor.tell(CounterMessage::Add(value)).unwrap();
        }
        assert_eq!(total(&actor).await, 55);
        assert_eq!(actor.state(), 55);
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_actor() {
        let actor = counter();
        actor.tell(CounterMessage::Add(1)).unwrap();
        actor.tell(CounterMessage::Fail).unwrap();
        actor.tell(CounterMessage::Panic).unwrap();
        actor.tell(CounterMessage::Add(2)).unwrap();
        assert_eq!(total(&actor).await, 3);
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_failed_fold_keeps_last_good_state() {
        let actor = counter();
        actor.tell(CounterMessage::Add(1)).unwrap();
        actor.tell(CounterMessage::AddThenFail(10)).unwrap();
        assert_eq!(total(&actor).await, 1);
        assert_eq!(actor.state(), 1);

        actor.tell(CounterMessage::AddThenPanic(100)).unwrap();
        assert_eq!(total(&actor).await, 1);
        assert_eq!(actor.state(), 1);

        actor.tell(CounterMessage::Add(2)).unwrap();
        assert_eq!(total(&actor).await, 3);
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_republished() {
        let actor = counter();
        let mut watch = actor.watch();
        watch.borrow_and_update();

        actor.tell(CounterMessage::Add(0)).unwrap();
        assert_eq!(total(&actor).await, 0);
        assert!(!watch.has_changed().unwrap());

        actor.tell(CounterMessage::Add(4)).unwrap();
        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow(), 4);
        actor.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_message_is_delivered_after_delay() {
        let actor = counter();
        let mut watch = actor.watch();
        let start = Instant::now();

        actor
            .schedule(CounterMessage::Add(5), Duration::from_millis(200))
            .unwrap();
        watch.wait_for(|total| *total == 5).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        actor.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_schedule_is_dropped() {
        let actor = counter();
        let cancellation = CancellationToken::new();
        actor
            .schedule_with_cancellation(
                CounterMessage::Add(5),
                Duration::from_millis(50),
                cancellation.clone(),
            )
            .unwrap();
        cancellation.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(total(&actor).await, 0);
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_messages_sent_before_start_are_kept() {
        let scheduler = Scheduler::new(Clock::system(), Duration::from_millis(10));
        let mailbox = Mailbox::new("early", scheduler);
        let early = mailbox.actor_ref();
        early.tell(CounterMessage::Add(7)).unwrap();

        let actor = AxonActor::start(mailbox, Counter { total: 0 });
        assert_eq!(total(&actor).await, 7);
        actor.dispose().await;
        assert!(early.is_stopped());
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_rejects_messages() {
        let actor = counter();
        actor.dispose().await;
        actor.dispose().await;
        assert!(actor.is_disposed());
        assert!(matches!(
            actor.tell(CounterMessage::Add(1)),
            Err(ConnectorError::Disposed(_))
        ));
    }
}
