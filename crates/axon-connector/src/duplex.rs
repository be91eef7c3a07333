// ABOUTME: Bidirectional stream plumbing shared by the control, command and query channels.
// ABOUTME: A reader task forwards inbound messages to the owning actor, tagged with a stream generation.

use std::future::Future;
use std::time::Duration;

use axon_grpc::{InboundStream, OutboundStream, StreamSender, DEFAULT_CHANNEL_BUFFER};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

use crate::actor::ActorRef;
use crate::backoff::{BackoffPolicy, BackoffPolicyOptions};
use crate::error::ConnectorError;

/// What the reader task reports to the owning actor.
#[derive(Debug)]
pub(crate) enum StreamEvent<In> {
    Opened,
    Received(In),
    /// The stream ended. `None` when the server completed it.
    Closed(Option<ConnectorError>),
}

/// Outbound half of an open stream plus the switch that stops its reader.
#[derive(Debug)]
struct OpenStream<Out> {
    sender: StreamSender<Out>,
    cancel: CancellationToken,
}

impl<Out> Clone for OpenStream<Out> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// One channel's stream across reconnects.
///
/// Every (re)open starts a new generation. Events of older generations are
/// recognised with [`ChannelStream::is_current`] and ignored by the actor.
#[derive(Debug)]
pub(crate) struct ChannelStream<Out> {
    generation: u64,
    open: Option<OpenStream<Out>>,
    backoff: BackoffPolicy,
}

impl<Out> Clone for ChannelStream<Out> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            open: self.open.clone(),
            backoff: self.backoff.clone(),
        }
    }
}

impl<Out: Send + 'static> ChannelStream<Out> {
    pub(crate) fn new(backoff: BackoffPolicyOptions) -> Self {
        Self {
            generation: 0,
            open: None,
            backoff: BackoffPolicy::new(backoff),
        }
    }

    /// Close the current stream, if any, and open a new generation.
    ///
    /// `open` receives the outbound half and must start the call. Inbound
    /// messages reach `actor` wrapped by `wrap`.
    pub(crate) fn open<In, M, F, Fut>(
        &mut self,
        actor: &ActorRef<M>,
        open: F,
        wrap: fn(u64, StreamEvent<In>) -> M,
    ) -> u64
    where
        In: Send + 'static,
        M: Send + 'static,
        F: FnOnce(ReceiverStream<Out>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<InboundStream<In>, Status>> + Send + 'static,
    {
        self.close();
        let generation = self.generation;
        let OutboundStream { sender, stream } = OutboundStream::new(DEFAULT_CHANNEL_BUFFER);
        let cancel = CancellationToken::new();
        tokio::spawn(read(
            actor.clone(),
            generation,
            cancel.clone(),
            open(stream),
            wrap,
        ));
        self.open = Some(OpenStream { sender, cancel });
        generation
    }

    /// Stop the reader and drop the outbound half, which half-closes the call.
    pub(crate) fn close(&mut self) {
        self.generation += 1;
        if let Some(open) = self.open.take() {
            open.cancel.cancel();
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.open.is_some()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// A sender handlers can write through from their own tasks.
    pub(crate) fn sender(&self) -> Option<StreamSender<Out>> {
        self.open.as_ref().map(|open| open.sender.clone())
    }

    pub(crate) async fn send(&self, message: Out) -> Result<(), ConnectorError> {
        match &self.open {
            Some(open) => Ok(open.sender.send(message).await?),
            None => Err(ConnectorError::NotConnected("stream is not open".to_string())),
        }
    }

    /// The stream is established. Later failures start backing off from the initial delay.
    pub(crate) fn opened(&mut self) {
        self.backoff.reset();
    }

    /// The stream of `generation` failed. Drops it and returns how long to wait
    /// before reopening.
    pub(crate) fn failed(&mut self) -> Duration {
        self.close();
        self.backoff.next()
    }
}

async fn read<In, M, Fut>(
    actor: ActorRef<M>,
    generation: u64,
    cancel: CancellationToken,
    open: Fut,
    wrap: fn(u64, StreamEvent<In>) -> M,
) where
    In: Send + 'static,
    M: Send + 'static,
    Fut: Future<Output = Result<InboundStream<In>, Status>> + Send + 'static,
{
    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        opened = open => opened,
    };
    let mut inbound = match opened {
        Ok(inbound) => inbound,
        Err(status) => {
            let _ = actor.tell(wrap(generation, StreamEvent::Closed(Some(status.into()))));
            return;
        }
    };
    if actor.tell(wrap(generation, StreamEvent::Opened)).is_err() {
        return;
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = inbound.next() => next,
        };
        let event = match next {
            Some(Ok(message)) => StreamEvent::Received(message),
            Some(Err(status)) => StreamEvent::Closed(Some(status.into())),
            None => StreamEvent::Closed(None),
        };
        let closed = matches!(event, StreamEvent::Closed(_));
        if actor.tell(wrap(generation, event)).is_err() || closed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{AxonActor, Receive};
    use crate::clock::Clock;
    use crate::scheduler::Scheduler;
    use async_trait::async_trait;
    use futures::stream;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Relay {
        Stream(u64, StreamEvent<u32>),
    }

    #[derive(Clone)]
    struct Recorder {
        events: mpsc::UnboundedSender<(u64, String)>,
    }

    #[async_trait]
    impl Receive<Relay> for Recorder {
        type Snapshot = ();

        async fn receive(&mut self, message: Relay, _actor: &ActorRef<Relay>) -> Result<(), ConnectorError> {
            let Relay::Stream(generation, event) = message;
            let label = match event {
                StreamEvent::Opened => "opened".to_string(),
                StreamEvent::Received(value) => format!("received {value}"),
                StreamEvent::Closed(None) => "completed".to_string(),
                StreamEvent::Closed(Some(_)) => "failed".to_string(),
            };
            let _ = self.events.send((generation, label));
            Ok(())
        }

        fn snapshot(&self) {}
    }

    fn recorder() -> (AxonActor<Relay, Recorder>, mpsc::UnboundedReceiver<(u64, String)>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(Clock::system(), Duration::from_millis(10));
        (AxonActor::spawn("recorder", Recorder { events }, scheduler), rx)
    }

    #[tokio::test]
    async fn test_reader_forwards_then_reports_completion() {
        let (actor, mut events) = recorder();
        let mut channel = ChannelStream::<u32>::new(BackoffPolicyOptions::default());

        let generation = channel.open(
            &actor.actor_ref(),
            |_outbound| async { Ok(stream::iter(vec![Ok(1), Ok(2)]).boxed()) },
            Relay::Stream,
        );

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(events.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                (generation, "opened".to_string()),
                (generation, "received 1".to_string()),
                (generation, "received 2".to_string()),
                (generation, "completed".to_string()),
            ]
        );
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_open_failure_is_reported_as_closed() {
        let (actor, mut events) = recorder();
        let mut channel = ChannelStream::<u32>::new(BackoffPolicyOptions::default());

        channel.open(
            &actor.actor_ref(),
            |_outbound| async { Err::<InboundStream<u32>, _>(Status::unavailable("down")) },
            Relay::Stream,
        );
        assert_eq!(events.recv().await.unwrap().1, "failed");
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_reopen_retires_previous_generation() {
        let (actor, _events) = recorder();
        let mut channel = ChannelStream::<u32>::new(BackoffPolicyOptions::default());

        let first = channel.open(
            &actor.actor_ref(),
            |_outbound| async { Ok(stream::pending().boxed()) },
            Relay::Stream,
        );
        let first_sender = channel.sender().unwrap();
        let second = channel.open(
            &actor.actor_ref(),
            |_outbound| async { Ok(stream::pending().boxed()) },
            Relay::Stream,
        );

        assert_ne!(first, second);
        assert!(!channel.is_current(first));
        assert!(channel.is_current(second));
        // The first call's outbound receiver went away with its reader.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !first_sender.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        actor.dispose().await;
    }

    #[tokio::test]
    async fn test_send_without_stream_is_not_connected() {
        let channel = ChannelStream::<u32>::new(BackoffPolicyOptions::default());
        assert!(matches!(
            channel.send(1).await,
            Err(ConnectorError::NotConnected(_))
        ));
    }

    #[test]
    fn test_failures_back_off_until_opened() {
        let options = BackoffPolicyOptions::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            2.0,
        )
        .unwrap();
        let mut channel = ChannelStream::<u32>::new(options);
        assert_eq!(channel.failed(), Duration::from_millis(10));
        assert_eq!(channel.failed(), Duration::from_millis(20));
        channel.opened();
        assert_eq!(channel.failed(), Duration::from_millis(10));
    }
}
