// ABOUTME: Low-level coordination primitives.
// ABOUTME: An async mutual-exclusion lock and N-of-N completion aggregation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;

/// Asynchronous mutual exclusion that can be disposed.
#[derive(Debug, Clone)]
pub struct AsyncLock {
    semaphore: Arc<Semaphore>,
}

/// Releases the lock when dropped.
#[derive(Debug)]
pub struct AsyncLockGuard {
    _permit: OwnedSemaphorePermit,
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncLock {
    pub fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }

    /// Wait for the lock. Fails if `cancellation` fires or the lock is disposed.
    pub async fn acquire(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<AsyncLockGuard, ConnectorError> {
        if cancellation.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ConnectorError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map(|permit| AsyncLockGuard { _permit: permit })
                .map_err(|_| ConnectorError::Disposed("async lock")),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Refuse every acquisition from now on. Idempotent.
    pub fn dispose(&self) {
        self.semaphore.close();
    }
}

type Outcome = Result<(), ConnectorError>;

/// Awaitable result of a [`CountdownCompletionSource`].
#[derive(Clone)]
pub struct Completion {
    inner: Shared<BoxFuture<'static, Outcome>>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Completion {
    fn from_receiver(receiver: oneshot::Receiver<Outcome>) -> Self {
        let inner = receiver
            .map(|outcome| outcome.unwrap_or(Err(ConnectorError::Cancelled)))
            .boxed()
            .shared();
        Self { inner }
    }

    pub fn ready(outcome: Outcome) -> Self {
        Self {
            inner: futures::future::ready(outcome).boxed().shared(),
        }
    }

    pub async fn wait(&self) -> Outcome {
        self.inner.clone().await
    }

    /// Wait, giving up with `Cancelled` if `cancellation` fires first.
    pub async fn wait_with_cancellation(&self, cancellation: &CancellationToken) -> Outcome {
        tokio::select! {
            _ = cancellation.cancelled() => Err(ConnectorError::Cancelled),
            outcome = self.wait() => outcome,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.inner.clone().now_or_never().is_some()
    }

    /// The outcome, if already known.
    pub fn outcome(&self) -> Option<Outcome> {
        self.inner.clone().now_or_never()
    }
}

/// Aggregates `initial_count` signals into one completion.
///
/// Completes once every signal has arrived: successfully if all succeeded,
/// otherwise with every reported failure. Clones share the same countdown.
#[derive(Clone)]
pub struct CountdownCompletionSource {
    initial_count: usize,
    countdown: Arc<Mutex<Countdown>>,
    completion: Completion,
}

struct Countdown {
    current_count: usize,
    errors: Vec<ConnectorError>,
    sender: Option<oneshot::Sender<Outcome>>,
}

impl fmt::Debug for CountdownCompletionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountdownCompletionSource")
            .field("initial_count", &self.initial_count)
            .field("current_count", &self.current_count())
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl CountdownCompletionSource {
    pub fn new(initial_count: usize) -> Result<Self, ConnectorError> {
        if initial_count == 0 {
            return Err(ConnectorError::InvalidArgument(
                "the initial count must be greater than zero".into(),
            ));
        }
        let (sender, receiver) = oneshot::channel();
        Ok(Self {
            initial_count,
            countdown: Arc::new(Mutex::new(Countdown {
                current_count: 0,
                errors: Vec::new(),
                sender: Some(sender),
            })),
            completion: Completion::from_receiver(receiver),
        })
    }

    fn countdown(&self) -> MutexGuard<'_, Countdown> {
        self.countdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn initial_count(&self) -> usize {
        self.initial_count
    }

    /// Signals received so far.
    pub fn current_count(&self) -> usize {
        self.countdown().current_count
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.countdown().sender.is_none()
    }

    /// Returns true if this signal completed the source.
    pub fn try_signal_success(&self) -> bool {
        let mut countdown = self.countdown();
        if countdown.sender.is_none() {
            return false;
        }
        countdown.current_count += 1;
        countdown.complete_if_counted(self.initial_count)
    }

    /// Record a failure. Returns true if this signal completed the source.
    pub fn try_signal_failure(&self, error: ConnectorError) -> bool {
        let mut countdown = self.countdown();
        if countdown.sender.is_none() {
            return false;
        }
        countdown.errors.push(error);
        countdown.current_count += 1;
        countdown.complete_if_counted(self.initial_count)
    }

    /// Fail immediately, regardless of outstanding signals.
    pub fn fault(&self, error: ConnectorError) -> bool {
        match self.countdown().sender.take() {
            Some(sender) => {
                let _ = sender.send(Err(error));
                true
            }
            None => false,
        }
    }
}

impl Countdown {
    fn complete_if_counted(&mut self, initial_count: usize) -> bool {
        if self.current_count < initial_count {
            return false;
        }
        let Some(sender) = self.sender.take() else {
            return false;
        };
        let outcome = if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConnectorError::Aggregate(std::mem::take(&mut self.errors)))
        };
        let _ = sender.send(outcome);
        true
    }
}
