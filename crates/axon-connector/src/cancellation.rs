// ABOUTME: Reconnect-aware cancellation for long-lived stream reads.
// ABOUTME: Each reconnect swaps in a new token generation and cancels the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;

#[derive(Debug)]
pub struct CooperativeCancellation {
    current: ArcSwapOption<CancellationToken>,
    disposed: AtomicBool,
}

impl Default for CooperativeCancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl CooperativeCancellation {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::from_pointee(CancellationToken::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Token of the current generation.
    pub fn token(&self) -> Result<CancellationToken, ConnectorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnectorError::Disposed("cooperative cancellation"));
        }
        self.current
            .load_full()
            .map(|token| (*token).clone())
            .ok_or(ConnectorError::Disposed("cooperative cancellation"))
    }

    /// Tie `source` to the current generation. Once that generation is
    /// cancelled the stream yields `Cancelled` and ends.
    pub fn open_stream<T, S>(
        &self,
        source: S,
    ) -> Result<BoxStream<'static, Result<T, ConnectorError>>, ConnectorError>
    where
        T: Send + 'static,
        S: Stream<Item = Result<T, ConnectorError>> + Send + 'static,
    {
        let token = self.token()?;
        let source = source.boxed();
        Ok(stream::unfold(Some((source, token)), |state| async move {
            let (mut source, token) = state?;
            tokio::select! {
                biased;
                _ = token.cancelled() => Some((Err(ConnectorError::Cancelled), None)),
                item = source.next() => item.map(|item| (item, Some((source, token)))),
            }
        })
        .boxed())
    }

    /// Start a new generation and cancel the previous one.
    pub fn reconnect(&self) -> Result<(), ConnectorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnectorError::Disposed("cooperative cancellation"));
        }
        let next = Arc::new(CancellationToken::new());
        match self.current.swap(Some(next.clone())) {
            Some(previous) => {
                previous.cancel();
                Ok(())
            }
            None => {
                // Disposal won the race: retire the generation we just installed.
                next.cancel();
                let installed = Some(next);
                let _ = self
                    .current
                    .compare_and_swap(&installed, None::<Arc<CancellationToken>>);
                Err(ConnectorError::Disposed("cooperative cancellation"))
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Cancel the final generation. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(current) = self.current.swap(None) {
            current.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    fn source() -> (
        mpsc::UnboundedSender<Result<u32, ConnectorError>>,
        UnboundedReceiverStream<Result<u32, ConnectorError>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, UnboundedReceiverStream::new(rx))
    }

    #[tokio::test]
    async fn test_stream_passes_items_through() {
        let cancellation = CooperativeCancellation::new();
        let (tx, rx) = source();
        let mut stream = cancellation.open_stream(rx).unwrap();

        tx.send(Ok(1)).unwrap();
        tx.send(Ok(2)).unwrap();
        drop(tx);

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_cancels_open_streams_once() {
        let cancellation = CooperativeCancellation::new();
        let (_tx, rx) = source();
        let mut stream = cancellation.open_stream(rx).unwrap();

        cancellation.reconnect().unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(ConnectorError::Cancelled))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_streams_opened_after_reconnect_use_new_generation() {
        let cancellation = CooperativeCancellation::new();
        cancellation.reconnect().unwrap();

        let (tx, rx) = source();
        let mut stream = cancellation.open_stream(rx).unwrap();
        tx.send(Ok(7)).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dispose_cancels_and_rejects_new_streams() {
        let cancellation = CooperativeCancellation::new();
        let token = cancellation.token().unwrap();
        cancellation.dispose();
        cancellation.dispose();

        assert!(token.is_cancelled());
        let (_tx, rx) = source();
        assert!(matches!(
            cancellation.open_stream(rx),
            Err(ConnectorError::Disposed(_))
        ));
        assert!(cancellation.reconnect().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_reconnect_and_dispose_leave_nothing_uncancelled() {
        for _ in 0..50 {
            let cancellation = Arc::new(CooperativeCancellation::new());
            let first = cancellation.token().unwrap();

            let reconnecting = {
                let cancellation = cancellation.clone();
                tokio::spawn(async move {
                    let _ = cancellation.reconnect();
                    cancellation.token().ok()
                })
            };
            let disposing = {
                let cancellation = cancellation.clone();
                tokio::spawn(async move { cancellation.dispose() })
            };

            let observed = reconnecting.await.unwrap();
            disposing.await.unwrap();

            assert!(first.is_cancelled());
            if let Some(token) = observed {
                assert!(token.is_cancelled());
            }
            assert!(cancellation.is_disposed());
        }
    }
}
