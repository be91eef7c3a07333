// ABOUTME: Application-facing handler traits for commands, queries and event processors.
// ABOUTME: Closures implement them directly, so simple handlers need no boilerplate type.

use std::future::Future;

use async_trait::async_trait;
use axon_proto::command::{Command, CommandResponse};
use axon_proto::control::EventProcessorInfo;
use axon_proto::query::{QueryRequest, QueryResponse, QueryUpdate, SubscriptionQuery};
use tokio_util::sync::CancellationToken;

use crate::error::ConnectorError;
use crate::ids::SegmentId;

/// Handles commands routed to this client.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        command: Command,
        cancellation: CancellationToken,
    ) -> Result<CommandResponse, ConnectorError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Command, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResponse, ConnectorError>> + Send + 'static,
{
    async fn handle(
        &self,
        command: Command,
        cancellation: CancellationToken,
    ) -> Result<CommandResponse, ConnectorError> {
        (self)(command, cancellation).await
    }
}

/// Where a query handler writes its answers.
#[async_trait]
pub trait QueryResponder: Send + Sync {
    async fn send(&self, response: QueryResponse) -> Result<(), ConnectorError>;

    async fn complete(&self) -> Result<(), ConnectorError>;

    async fn complete_with_error(&self, error: ConnectorError) -> Result<(), ConnectorError>;

    /// Send one response and complete.
    async fn send_last(&self, response: QueryResponse) -> Result<(), ConnectorError> {
        self.send(response).await?;
        self.complete().await
    }
}

/// Where a subscription query handler pushes updates.
#[async_trait]
pub trait QueryUpdateSink: Send + Sync {
    async fn send_update(&self, update: QueryUpdate) -> Result<(), ConnectorError>;

    async fn complete(&self) -> Result<(), ConnectorError>;

    async fn complete_with_error(&self, error: ConnectorError) -> Result<(), ConnectorError>;
}

/// Handles queries routed to this client.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        request: QueryRequest,
        responder: &dyn QueryResponder,
    ) -> Result<(), ConnectorError>;

    /// A subscription query started. Keep `updates` to push updates later.
    async fn subscribe(
        &self,
        _query: SubscriptionQuery,
        _updates: Box<dyn QueryUpdateSink>,
    ) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn unsubscribe(&self, _query: SubscriptionQuery) -> Result<(), ConnectorError> {
        Ok(())
    }
}

/// Adapts a closure returning one response into a [`QueryHandler`].
pub struct QueryFn<F>(pub F);

#[async_trait]
impl<F, Fut> QueryHandler for QueryFn<F>
where
    F: Fn(QueryRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<QueryResponse, ConnectorError>> + Send + 'static,
{
    async fn handle(
        &self,
        request: QueryRequest,
        responder: &dyn QueryResponder,
    ) -> Result<(), ConnectorError> {
        match (self.0)(request).await {
            Ok(response) => responder.send_last(response).await,
            Err(err) => responder.complete_with_error(err).await,
        }
    }
}

/// Reports the current status of a local event processor.
///
/// `Ok(None)` means there is nothing to report right now.
#[async_trait]
pub trait EventProcessorInfoSupplier: Send + Sync + 'static {
    async fn info(&self) -> Result<Option<EventProcessorInfo>, ConnectorError>;
}

#[async_trait]
impl<F, Fut> EventProcessorInfoSupplier for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<EventProcessorInfo>, ConnectorError>> + Send + 'static,
{
    async fn info(&self) -> Result<Option<EventProcessorInfo>, ConnectorError> {
        (self)().await
    }
}

/// Carries out instructions the server sends to a local event processor.
///
/// Segment operations return `false` when the processor declined.
#[async_trait]
pub trait EventProcessorInstructionHandler: Send + Sync + 'static {
    async fn release_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError>;

    async fn split_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError>;

    async fn merge_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError>;

    async fn pause(&self) -> Result<(), ConnectorError>;

    async fn start(&self) -> Result<(), ConnectorError>;
}
