// ABOUTME: Bidirectional gRPC stream management for the AxonServer channels.
// ABOUTME: Provides typed sender/receiver wrappers and the outbound stream pair.

use std::pin::Pin;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::error::GrpcClientError;

/// Default buffer size for outbound message channels.
pub const DEFAULT_CHANNEL_BUFFER: usize = 100;

/// Messages received from the server on a streaming call.
pub type InboundStream<T> = BoxStream<'static, Result<T, Status>>;

/// Sender half of a bidirectional stream.
///
/// Wraps an mpsc sender for outgoing messages with convenience methods.
#[derive(Debug)]
pub struct StreamSender<T> {
    inner: mpsc::Sender<T>,
}

impl<T> Clone for StreamSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> StreamSender<T> {
    /// Create a stream sender from an mpsc sender.
    pub fn new(sender: mpsc::Sender<T>) -> Self {
        Self { inner: sender }
    }

    /// Send a message on the stream.
    pub async fn send(&self, msg: T) -> Result<(), GrpcClientError> {
        self.inner
            .send(msg)
            .await
            .map_err(|_| GrpcClientError::StreamClosed)
    }

    /// Try to send a message without waiting.
    pub fn try_send(&self, msg: T) -> Result<(), GrpcClientError> {
        self.inner
            .try_send(msg)
            .map_err(|_| GrpcClientError::StreamClosed)
    }

    /// Check if the stream is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Receiver half of a bidirectional stream.
pub struct StreamReceiver<T> {
    inner: InboundStream<T>,
}

impl<T> StreamReceiver<T> {
    pub fn new(stream: InboundStream<T>) -> Self {
        Self { inner: stream }
    }

    /// Receive the next message, `None` once the server completes the call.
    pub async fn recv(&mut self) -> Result<Option<T>, Status> {
        self.inner.next().await.transpose()
    }

    pub fn into_inner(self) -> InboundStream<T> {
        self.inner
    }
}

impl<T> Stream for StreamReceiver<T> {
    type Item = Result<T, Status>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A pair of sender and outbound stream for initiating bidirectional communication.
///
/// The outbound stream is handed to the transport, while the sender is kept
/// by the channel that writes instructions.
pub struct OutboundStream<T> {
    /// Sender for pushing messages to the stream.
    pub sender: StreamSender<T>,
    /// The stream to pass to the transport.
    pub stream: ReceiverStream<T>,
}

impl<T> OutboundStream<T> {
    /// Create an outbound stream pair with the specified buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer_size);
        Self {
            sender: StreamSender::new(tx),
            stream: ReceiverStream::new(rx),
        }
    }

    /// Create an outbound stream pair with the default buffer size.
    pub fn with_default_buffer() -> Self {
        Self::new(DEFAULT_CHANNEL_BUFFER)
    }
}

/// A complete bidirectional stream pair after the call is established.
pub struct BidirectionalStream<TSend, TRecv> {
    /// Sender for outgoing messages.
    pub sender: StreamSender<TSend>,
    /// Receiver for incoming messages.
    pub receiver: StreamReceiver<TRecv>,
}

impl<TSend, TRecv> BidirectionalStream<TSend, TRecv> {
    pub fn new(sender: StreamSender<TSend>, receiver: StreamReceiver<TRecv>) -> Self {
        Self { sender, receiver }
    }

    /// Open a call by handing a fresh outbound stream to `open`.
    pub async fn open<F, Fut>(open: F) -> Result<Self, Status>
    where
        F: FnOnce(ReceiverStream<TSend>) -> Fut,
        Fut: std::future::Future<Output = Result<InboundStream<TRecv>, Status>>,
    {
        let outbound = OutboundStream::with_default_buffer();
        let inbound = open(outbound.stream).await?;
        Ok(Self::new(outbound.sender, StreamReceiver::new(inbound)))
    }

    /// Split into sender and receiver.
    pub fn split(self) -> (StreamSender<TSend>, StreamReceiver<TRecv>) {
        (self.sender, self.receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_outbound_stream_delivers_in_order() {
        let outbound = OutboundStream::new(4);
        outbound.sender.send(1).await.unwrap();
        outbound.sender.try_send(2).unwrap();
        drop(outbound.sender);

        let received: Vec<i32> = outbound.stream.collect().await;
        assert_eq!(received, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_sender_reports_closed_stream() {
        let outbound = OutboundStream::<i32>::new(1);
        drop(outbound.stream);
        assert!(outbound.sender.is_closed());
        assert!(matches!(
            outbound.sender.send(1).await,
            Err(GrpcClientError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn test_receiver_surfaces_status() {
        let inbound: InboundStream<i32> = futures::stream::iter(vec![
            Ok(1),
            Err(Status::unavailable("node went away")),
        ])
        .boxed();
        let mut receiver = StreamReceiver::new(inbound);

        assert_eq!(receiver.recv().await.unwrap(), Some(1));
        let status = receiver.recv().await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(receiver.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_bidirectional_stream() {
        let stream = BidirectionalStream::<String, String>::open(|outbound| async move {
            let echoed: InboundStream<String> = outbound.map(Ok).boxed();
            Ok(echoed)
        })
        .await
        .unwrap();

        let (sender, mut receiver) = stream.split();
        sender.send("ping".to_string()).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), Some("ping".to_string()));
    }
}
