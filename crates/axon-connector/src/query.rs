// ABOUTME: Query channel: answers routed queries with registered handlers and issues queries.
// ABOUTME: Covers plain, streaming and subscription queries on both the provider and consumer side.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_grpc::{InboundStream, OutboundStream, StreamSender, DEFAULT_CHANNEL_BUFFER};
use axon_proto::query::{
    query_provider_inbound, subscription_query_request, subscription_query_response,
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse, QueryUpdate,
    SubscriptionQuery, SubscriptionQueryRequest, SubscriptionQueryResponse,
};
use axon_proto::{FlowControl, InstructionAck, ProcessingKey, SerializedObject};
use futures::future::{BoxFuture, Shared};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::actor::{ActorRef, AxonActor, Mailbox, Receive};
use crate::channel::{ChannelContext, ChannelStatus};
use crate::clock::millis;
use crate::duplex::{ChannelStream, StreamEvent};
use crate::error::{ConnectorError, ErrorCategory};
use crate::handlers::{QueryHandler, QueryResponder, QueryUpdateSink};
use crate::ids::{IdGenerator, InstructionId, QueryDefinition, QueryName, RegistrationId};
use crate::ongoing_queries::{OngoingQuery, OngoingQueryCollection, StreamingPermits};
use crate::permits::{FlowController, PermitCount};
use crate::query_handlers::QueryHandlerCollection;
use crate::query_reply::{QueryReply, QueryReplyTranslator, SubscriptionUpdateTranslator};
use crate::sync::{Completion, CountdownCompletionSource};

const PURGE_INTERVAL: Duration = Duration::from_secs(15);
const INSTRUCTION_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) enum QueryMessage {
    Connect,
    Disconnect,
    Reopen { generation: u64 },
    Stream(u64, StreamEvent<QueryProviderInbound>),
    Register {
        handler: Arc<dyn QueryHandler>,
        queries: Vec<(RegistrationId, QueryDefinition, CountdownCompletionSource)>,
    },
    Unregister {
        queries: Vec<(RegistrationId, CountdownCompletionSource)>,
    },
    QueryFinished { request_id: InstructionId },
    Purge,
}

impl fmt::Debug for QueryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMessage::Connect => f.write_str("Connect"),
            QueryMessage::Disconnect => f.write_str("Disconnect"),
            QueryMessage::Reopen { generation } => {
                f.debug_struct("Reopen").field("generation", generation).finish()
            }
            QueryMessage::Stream(generation, event) => {
                f.debug_tuple("Stream").field(generation).field(event).finish()
            }
            QueryMessage::Register { queries, .. } => {
                let definitions: Vec<&QueryDefinition> =
                    queries.iter().map(|(_, definition, _)| definition).collect();
                f.debug_struct("Register")
                    .field("queries", &definitions)
                    .finish_non_exhaustive()
            }
            QueryMessage::Unregister { queries } => {
                let ids: Vec<&RegistrationId> = queries.iter().map(|(id, _)| id).collect();
                f.debug_struct("Unregister").field("queries", &ids).finish()
            }
            QueryMessage::QueryFinished { request_id } => f
                .debug_struct("QueryFinished")
                .field("request_id", request_id)
                .finish(),
            QueryMessage::Purge => f.write_str("Purge"),
        }
    }
}

/// Replies of every handler answering one query. Completes once the last handler did.
struct QueryResponseChannel {
    translator: QueryReplyTranslator,
    sender: StreamSender<QueryProviderOutbound>,
    ids: IdGenerator,
    permits: Option<StreamingPermits>,
    cancellation: CancellationToken,
    remaining: AtomicUsize,
}

impl QueryResponseChannel {
    async fn write(&self, messages: Vec<QueryProviderOutbound>) -> Result<(), ConnectorError> {
        for message in messages {
            self.sender.send(message).await?;
        }
        Ok(())
    }

    /// Count one handler as done. True for the last one.
    fn finish(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .map(|left| left == 1)
            .unwrap_or(false)
    }
}

#[async_trait]
impl QueryResponder for QueryResponseChannel {
    async fn send(&self, response: QueryResponse) -> Result<(), ConnectorError> {
        if self.cancellation.is_cancelled() {
            return Err(ConnectorError::Cancelled);
        }
        if let Some(permits) = &self.permits {
            permits.acquire(&self.cancellation).await?;
        }
        self.write(self.translator.translate(QueryReply::Send(response), &self.ids))
            .await
    }

    async fn complete(&self) -> Result<(), ConnectorError> {
        if !self.finish() {
            return Ok(());
        }
        self.write(self.translator.translate(QueryReply::Complete, &self.ids))
            .await
    }

    async fn complete_with_error(&self, error: ConnectorError) -> Result<(), ConnectorError> {
        let category = error.category().unwrap_or(ErrorCategory::QueryExecutionError);
        let message = error.to_error_message(category, "Client");
        let mut messages = self
            .translator
            .translate(QueryReply::CompleteWithError(message), &self.ids);
        let complete = messages.pop();
        self.write(messages).await?;
        if self.finish() {
            self.write(complete.into_iter().collect()).await?;
        }
        Ok(())
    }
}

/// Pushes updates of one subscription query to the server.
struct SubscriptionUpdateChannel {
    translator: SubscriptionUpdateTranslator,
    sender: StreamSender<QueryProviderOutbound>,
    ids: IdGenerator,
}

#[async_trait]
impl QueryUpdateSink for SubscriptionUpdateChannel {
    async fn send_update(&self, update: QueryUpdate) -> Result<(), ConnectorError> {
        Ok(self.sender.send(self.translator.update(update, &self.ids)).await?)
    }

    async fn complete(&self) -> Result<(), ConnectorError> {
        Ok(self.sender.send(self.translator.complete(&self.ids)).await?)
    }

    async fn complete_with_error(&self, error: ConnectorError) -> Result<(), ConnectorError> {
        let category = error.category().unwrap_or(ErrorCategory::QueryExecutionError);
        let message = error.to_error_message(category, "Client");
        Ok(self
            .sender
            .send(self.translator.complete_with_error(message, &self.ids))
            .await?)
    }
}

#[derive(Clone)]
struct QueryState {
    ctx: ChannelContext,
    stream: ChannelStream<QueryProviderOutbound>,
    handlers: QueryHandlerCollection,
    ongoing: OngoingQueryCollection,
    permits: PermitCount,
    flow: FlowController,
    purge_scheduled: bool,
    connected: bool,
}

impl QueryState {
    fn flow_control(&self, permits: PermitCount) -> QueryProviderOutbound {
        QueryProviderOutbound::flow_control(FlowControl {
            client_id: self.ctx.client_id().to_string(),
            permits: permits.value(),
        })
    }

    async fn open(&mut self, actor: &ActorRef<QueryMessage>) -> Result<(), ConnectorError> {
        let transport = self.ctx.transport.require()?;
        self.connected = false;
        if !self.purge_scheduled {
            self.purge_scheduled = schedule_purge(actor);
        }

        let generation = self.stream.open(
            actor,
            move |outbound| async move { transport.open_query_stream(outbound).await },
            QueryMessage::Stream,
        );
        tracing::debug!(generation, "opening query stream");

        // Write failures surface as a closed stream of this generation.
        self.flow.reset();
        self.write(self.flow_control(self.permits)).await;
        // A fresh stream knows nothing of earlier instructions.
        self.handlers.forget_pending_instructions();
        for instruction in self.handlers.begin_subscribe_to_all_instructions() {
            self.write(instruction).await;
        }
        Ok(())
    }

    async fn on_stream(&mut self, event: StreamEvent<QueryProviderInbound>, actor: &ActorRef<QueryMessage>) {
        match event {
            StreamEvent::Opened => {
                self.stream.opened();
                self.connected = true;
                tracing::info!(client = %self.ctx.client_id(), "query channel connected");
            }
            StreamEvent::Received(message) => self.handle(message, actor).await,
            StreamEvent::Closed(error) => {
                self.connected = false;
                self.ongoing.cancel_all();
                let due = self.stream.failed();
                match &error {
                    Some(error) => tracing::warn!(
                        error = %error,
                        due_ms = millis(due),
                        "query stream failed, reopening"
                    ),
                    None => tracing::info!(due_ms = millis(due), "query stream completed, reopening"),
                }
                let reopen = QueryMessage::Reopen {
                    generation: self.stream.generation(),
                };
                if let Err(err) = actor.schedule(reopen, due) {
                    tracing::debug!(error = %err, "query stream will not be reopened");
                }
            }
        }
    }

    async fn handle(&mut self, message: QueryProviderInbound, actor: &ActorRef<QueryMessage>) {
        use query_provider_inbound::Request;

        let instruction_id = message.instruction_id;
        match message.request {
            Some(Request::Ack(ack)) => {
                if !self.handlers.try_complete_subscribe_to_query_instruction(&ack)
                    && !self.handlers.try_complete_unsubscribe_from_query_instruction(&ack)
                {
                    tracing::debug!(instruction_id = %ack.instruction_id, "acknowledgement of an unknown instruction");
                }
            }
            Some(Request::Query(request)) => {
                self.acknowledge(&instruction_id).await;
                let translator = QueryReplyTranslator::for_query(request.message_identifier.clone());
                self.answer(request, translator, actor).await;
                self.consume_permit().await;
            }
            Some(Request::SubscriptionQueryRequest(request)) => {
                self.acknowledge(&instruction_id).await;
                self.on_subscription_request(request, actor).await;
                self.consume_permit().await;
            }
            Some(Request::QueryCancel(reference)) => {
                self.acknowledge(&instruction_id).await;
                let cancelled = InstructionId::new(reference.request_id)
                    .ok()
                    .and_then(|id| self.ongoing.remove_query(&id));
                if let Some(query) = cancelled {
                    tracing::debug!("query cancelled by the server");
                    query.cancel();
                }
            }
            Some(Request::QueryFlowControl(control)) => {
                self.acknowledge(&instruction_id).await;
                let granted = control
                    .query_reference
                    .and_then(|reference| InstructionId::new(reference.request_id).ok())
                    .map(|id| self.ongoing.try_flow_control_request_for_query(&id, control.permits))
                    .unwrap_or(false);
                if !granted {
                    tracing::debug!("permits for a query that is not streaming");
                }
            }
            None => {
                tracing::debug!(instruction_id = %instruction_id, "ignoring empty query instruction");
            }
        }
    }

    async fn on_subscription_request(&mut self, request: SubscriptionQueryRequest, actor: &ActorRef<QueryMessage>) {
        use subscription_query_request::Request;

        match request.request {
            Some(Request::GetInitialResult(query)) => {
                let Some(request) = query.query_request else {
                    return;
                };
                let translator = QueryReplyTranslator::for_subscription_query(
                    request.message_identifier.clone(),
                    query.subscription_identifier,
                );
                self.answer(request, translator, actor).await
            }
            Some(Request::Subscribe(query)) => {
                let Some(sender) = self.stream.sender() else {
                    return;
                };
                for handler in self.handlers_for(query.query_request.as_ref()) {
                    let sink = SubscriptionUpdateChannel {
                        translator: SubscriptionUpdateTranslator::new(
                            self.ctx.identity.clone(),
                            query.subscription_identifier.clone(),
                        ),
                        sender: sender.clone(),
                        ids: self.ctx.ids.clone(),
                    };
                    let query = query.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler.subscribe(query, Box::new(sink)).await {
                            tracing::warn!(error = %err, "subscription query handler failed to subscribe");
                        }
                    });
                }
            }
            Some(Request::Unsubscribe(query)) => {
                for handler in self.handlers_for(query.query_request.as_ref()) {
                    let query = query.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handler.unsubscribe(query).await {
                            tracing::warn!(error = %err, "subscription query handler failed to unsubscribe");
                        }
                    });
                }
            }
            Some(Request::FlowControl(_)) | None => {}
        }
    }

    fn handlers_for(&self, request: Option<&QueryRequest>) -> Vec<Arc<dyn QueryHandler>> {
        request
            .and_then(|request| QueryName::new(request.query.clone()).ok())
            .map(|name| self.handlers.resolve_query_handlers(&name))
            .unwrap_or_default()
    }

    /// Run every handler registered for the query, or reply that there is none.
    async fn answer(&mut self, request: QueryRequest, translator: QueryReplyTranslator, actor: &ActorRef<QueryMessage>) {
        let Some(sender) = self.stream.sender() else {
            return;
        };
        let handlers = self.handlers_for(Some(&request));
        let streaming = request
            .processing_instructions
            .iter()
            .any(|instruction| instruction.is_enabled(ProcessingKey::ClientSupportsStreaming));
        let permits = streaming.then(StreamingPermits::new);
        let cancellation = CancellationToken::new();
        let responder = Arc::new(QueryResponseChannel {
            translator,
            sender,
            ids: self.ctx.ids.clone(),
            permits: permits.clone(),
            cancellation: cancellation.clone(),
            remaining: AtomicUsize::new(handlers.len().max(1)),
        });

        if handlers.is_empty() {
            tracing::warn!(query = %request.query, "no handler for query");
            let error = ConnectorError::axon_server(
                self.ctx.client_id(),
                ErrorCategory::NoHandlerForQuery,
                format!("No Handler for query: {}", request.query),
            );
            if let Err(err) = responder.complete_with_error(error).await {
                tracing::debug!(error = %err, "could not reply to unhandled query");
            }
            return;
        }

        let request_id = match InstructionId::new(request.message_identifier.clone()) {
            Ok(request_id) => request_id,
            Err(err) => {
                tracing::warn!(query = %request.query, error = %err, "dropping query without message identifier");
                return;
            }
        };
        let mut ongoing = OngoingQuery::new(cancellation.clone());
        if let Some(permits) = permits {
            ongoing = ongoing.with_flow_control(Arc::new(permits));
        }
        if let Err(err) = self.ongoing.add_query(request_id.clone(), ongoing) {
            tracing::warn!(%request_id, error = %err, "query is already being answered");
            return;
        }
        tokio::spawn(run_query(
            handlers,
            request,
            responder,
            request_id,
            actor.clone(),
        ));
    }

    async fn consume_permit(&mut self) {
        if self.flow.increment() {
            let refill = self.flow_control(self.flow.threshold());
            self.write(refill).await;
        }
    }

    async fn acknowledge(&self, instruction_id: &str) {
        if instruction_id.is_empty() {
            return;
        }
        self.write(QueryProviderOutbound::ack(InstructionAck {
            instruction_id: instruction_id.to_string(),
            success: true,
            error: None,
        }))
        .await;
    }

    async fn write(&self, message: QueryProviderOutbound) {
        if let Err(err) = self.stream.send(message).await {
            tracing::debug!(error = %err, "could not write to query stream");
        }
    }

    async fn register(
        &mut self,
        handler: Arc<dyn QueryHandler>,
        queries: Vec<(RegistrationId, QueryDefinition, CountdownCompletionSource)>,
    ) {
        for (id, definition, completion) in queries {
            self.handlers
                .register_query_handler(id, definition.clone(), handler.clone());
            match self.handlers.try_begin_subscribe_to_query_instruction(&definition) {
                Some(instruction) => {
                    self.handlers
                        .register_subscribe_completion(definition, completion);
                    // Without a stream, the next open subscribes every registered definition.
                    if self.stream.is_open() {
                        self.write(instruction).await;
                    }
                }
                None if self.handlers.has_pending_subscribe(&definition) => {
                    self.handlers
                        .register_subscribe_completion(definition, completion);
                }
                None => {
                    completion.try_signal_success();
                }
            }
        }
    }

    async fn unregister(&mut self, queries: Vec<(RegistrationId, CountdownCompletionSource)>) {
        for (id, completion) in queries {
            let instruction = self
                .handlers
                .unregister_query_handler(&id)
                .and_then(|definition| {
                    self.handlers
                        .try_begin_unsubscribe_from_query_instruction(&definition)
                        .map(|instruction| (definition, instruction))
                });
            match instruction {
                Some((definition, instruction)) if self.stream.is_open() => {
                    self.handlers
                        .register_unsubscribe_completion(definition, completion);
                    self.write(instruction).await;
                }
                _ => {
                    completion.try_signal_success();
                }
            }
        }
    }
}

fn schedule_purge(actor: &ActorRef<QueryMessage>) -> bool {
    match actor.schedule(QueryMessage::Purge, PURGE_INTERVAL) {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(error = %err, "could not schedule query purge");
            false
        }
    }
}

async fn run_query(
    handlers: Vec<Arc<dyn QueryHandler>>,
    request: QueryRequest,
    responder: Arc<QueryResponseChannel>,
    request_id: InstructionId,
    actor: ActorRef<QueryMessage>,
) {
    let runs = handlers.into_iter().map(|handler| {
        let request = request.clone();
        let responder = responder.clone();
        async move {
            let outcome = AssertUnwindSafe(handler.handle(request, responder.as_ref()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) | Ok(Err(ConnectorError::Cancelled)) => return,
                Ok(Err(error)) => error,
                Err(_) => {
                    tracing::error!("query handler panicked");
                    ConnectorError::axon_server(
                        "",
                        ErrorCategory::QueryExecutionError,
                        "query handler panicked",
                    )
                }
            };
            tracing::warn!(error = %error, "query handler failed");
            if let Err(err) = responder.complete_with_error(error).await {
                tracing::debug!(error = %err, "could not report query handler failure");
            }
        }
    });

    // Handlers observe cancellation through their responder.
    futures::future::join_all(runs).await;
    let _ = actor.tell(QueryMessage::QueryFinished { request_id });
}

#[async_trait]
impl Receive<QueryMessage> for QueryState {
    type Snapshot = ChannelStatus;

    async fn receive(&mut self, message: QueryMessage, actor: &ActorRef<QueryMessage>) -> Result<(), ConnectorError> {
        match message {
            QueryMessage::Connect => {
                if !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            QueryMessage::Reopen { generation } => {
                if self.stream.generation() == generation && !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            QueryMessage::Disconnect => {
                self.stream.close();
                self.connected = false;
                self.ongoing.cancel_all();
            }
            QueryMessage::Stream(generation, event) => {
                if !self.stream.is_current(generation) {
                    tracing::debug!(generation, "ignoring event of a retired query stream");
                    return Ok(());
                }
                self.on_stream(event, actor).await;
            }
            QueryMessage::Register { handler, queries } => self.register(handler, queries).await,
            QueryMessage::Unregister { queries } => self.unregister(queries).await,
            QueryMessage::QueryFinished { request_id } => {
                self.ongoing.remove_query(&request_id);
            }
            QueryMessage::Purge => {
                if self.connected {
                    self.handlers.purge(INSTRUCTION_TIMEOUT);
                }
                self.purge_scheduled = schedule_purge(actor);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> ChannelStatus {
        ChannelStatus {
            connected: self.connected,
        }
    }

    async fn stopped(&mut self) {
        self.stream.close();
        self.connected = false;
        self.ongoing.cancel_all();
    }
}

/// Query handlers registered through [`QueryChannel::register_query_handler`].
#[derive(Debug)]
pub struct QueryHandlerRegistration {
    ids: Vec<RegistrationId>,
    completions: Vec<Completion>,
    actor: ActorRef<QueryMessage>,
}

impl QueryHandlerRegistration {
    /// Resolves once every query of the handler is subscribed.
    pub async fn wait_until_completed(&self) -> Result<(), ConnectorError> {
        futures::future::try_join_all(self.completions.iter().map(Completion::wait))
            .await
            .map(|_| ())
    }

    /// Remove the handler and wait until the server stopped routing its queries here.
    pub async fn dispose(self) -> Result<(), ConnectorError> {
        let mut queries = Vec::with_capacity(self.ids.len());
        let mut completions = Vec::with_capacity(self.ids.len());
        for id in self.ids {
            let source = CountdownCompletionSource::new(1)?;
            completions.push(source.completion());
            queries.push((id, source));
        }
        self.actor.tell(QueryMessage::Unregister { queries })?;
        futures::future::try_join_all(completions.iter().map(Completion::wait))
            .await
            .map(|_| ())
    }
}

type InitialResult = Shared<BoxFuture<'static, Result<QueryResponse, ConnectorError>>>;

/// An open subscription query: its initial result and the updates that follow.
pub struct QuerySubscriptionResult {
    query: SubscriptionQuery,
    sender: StreamSender<SubscriptionQueryRequest>,
    initial: InitialResult,
    updates: ReceiverStream<Result<QueryUpdate, ConnectorError>>,
    cancellation: CancellationToken,
    _guard: DropGuard,
}

impl fmt::Debug for QuerySubscriptionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySubscriptionResult")
            .field("subscription_identifier", &self.query.subscription_identifier)
            .field("cancelled", &self.cancellation.is_cancelled())
            .finish()
    }
}

impl QuerySubscriptionResult {
    pub fn subscription_identifier(&self) -> &str {
        &self.query.subscription_identifier
    }

    pub async fn initial_result(&self) -> Result<QueryResponse, ConnectorError> {
        self.initial.clone().await
    }

    /// Next update, or `None` once the subscription ended.
    pub async fn next_update(&mut self) -> Option<Result<QueryUpdate, ConnectorError>> {
        self.updates.next().await
    }

    /// Tell the server to stop sending updates and end the update stream.
    pub async fn unsubscribe(&self) -> Result<(), ConnectorError> {
        if self.cancellation.is_cancelled() {
            return Ok(());
        }
        let request = SubscriptionQueryRequest {
            request: Some(subscription_query_request::Request::Unsubscribe(self.query.clone())),
        };
        let sent = self.sender.send(request).await;
        self.cancellation.cancel();
        Ok(sent?)
    }
}

struct SubscriptionReader {
    inbound: InboundStream<SubscriptionQueryResponse>,
    initial: Option<oneshot::Sender<Result<QueryResponse, ConnectorError>>>,
    updates: mpsc::Sender<Result<QueryUpdate, ConnectorError>>,
    sender: StreamSender<SubscriptionQueryRequest>,
    query: SubscriptionQuery,
    flow: FlowController,
    client: String,
    cancellation: CancellationToken,
}

impl SubscriptionReader {
    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                next = self.inbound.next() => next,
            };
            let response = match next {
                Some(Ok(response)) => response,
                Some(Err(status)) => {
                    let error = ConnectorError::from(status);
                    self.resolve_initial(Err(error.clone()));
                    self.push(Err(error)).await;
                    break;
                }
                None => break,
            };
            match response.response {
                Some(subscription_query_response::Response::InitialResult(result)) => {
                    let outcome = if result.error_code.is_empty() && result.error_message.is_none() {
                        Ok(result)
                    } else {
                        Err(ConnectorError::from_error_message(
                            self.client.clone(),
                            result.error_message.as_ref(),
                        ))
                    };
                    self.resolve_initial(outcome);
                }
                Some(subscription_query_response::Response::Update(update)) => {
                    if !self.push(Ok(update)).await {
                        break;
                    }
                    if self.flow.increment() {
                        let refill = SubscriptionQuery {
                            number_of_permits: self.flow.threshold().value(),
                            ..self.query.clone()
                        };
                        let request = SubscriptionQueryRequest {
                            request: Some(subscription_query_request::Request::FlowControl(refill)),
                        };
                        if self.sender.send(request).await.is_err() {
                            break;
                        }
                    }
                }
                Some(subscription_query_response::Response::Complete(_)) => break,
                Some(subscription_query_response::Response::CompleteExceptionally(failure)) => {
                    let error = ConnectorError::from_error_message(
                        self.client.clone(),
                        failure.error_message.as_ref(),
                    );
                    self.push(Err(error)).await;
                    break;
                }
                None => {}
            }
        }
        tracing::debug!(subscription = %self.query.subscription_identifier, "subscription query ended");
    }

    fn resolve_initial(&mut self, outcome: Result<QueryResponse, ConnectorError>) {
        if let Some(initial) = self.initial.take() {
            let _ = initial.send(outcome);
        }
    }

    async fn push(&mut self, update: Result<QueryUpdate, ConnectorError>) -> bool {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => false,
            sent = self.updates.send(update) => sent.is_ok(),
        }
    }
}

/// Query channel handle. Owned by its connection.
pub struct QueryChannel {
    actor: AxonActor<QueryMessage, QueryState>,
    ctx: ChannelContext,
}

impl fmt::Debug for QueryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryChannel")
            .field("status", &self.actor.state())
            .finish()
    }
}

impl QueryChannel {
    pub(crate) fn new(ctx: ChannelContext, permits: PermitCount, permits_batch: PermitCount) -> Self {
        let mailbox = Mailbox::new("query", ctx.scheduler.clone());
        let state = QueryState {
            stream: ChannelStream::new(ctx.backoff),
            handlers: QueryHandlerCollection::new(ctx.identity.clone(), ctx.clock.clone(), ctx.ids.clone()),
            ongoing: OngoingQueryCollection::new(),
            permits,
            flow: FlowController::new(permits, permits_batch),
            purge_scheduled: false,
            connected: false,
            ctx: ctx.clone(),
        };
        Self {
            actor: AxonActor::start(mailbox, state),
            ctx,
        }
    }

    pub(crate) fn connect(&self) -> Result<(), ConnectorError> {
        self.actor.tell(QueryMessage::Connect)
    }

    pub(crate) fn disconnect(&self) -> Result<(), ConnectorError> {
        self.actor.tell(QueryMessage::Disconnect)
    }

    /// Answer `queries` with `handler`. Several handlers may answer the same query.
    pub fn register_query_handler(
        &self,
        handler: Arc<dyn QueryHandler>,
        queries: impl IntoIterator<Item = QueryDefinition>,
    ) -> Result<QueryHandlerRegistration, ConnectorError> {
        let mut registered = Vec::new();
        let mut completions = Vec::new();
        for definition in queries {
            let source = CountdownCompletionSource::new(1)?;
            completions.push(source.completion());
            registered.push((self.ctx.ids.registration_id(), definition, source));
        }
        if registered.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "at least one query definition is required".into(),
            ));
        }

        let ids = registered.iter().map(|(id, _, _)| id.clone()).collect();
        self.actor.tell(QueryMessage::Register {
            handler,
            queries: registered,
        })?;
        Ok(QueryHandlerRegistration {
            ids,
            completions,
            actor: self.actor.actor_ref(),
        })
    }

    fn prepare(&self, mut request: QueryRequest) -> QueryRequest {
        if request.message_identifier.is_empty() {
            request.message_identifier = self.ctx.ids.next_id();
        }
        request.client_id = self.ctx.client_id().to_string();
        request.component_name = self.ctx.component_name().to_string();
        request
    }

    /// Send a query and stream back every response. Ends early when `cancellation` fires.
    pub async fn query(
        &self,
        request: QueryRequest,
        cancellation: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<QueryResponse, ConnectorError>>, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let request = self.prepare(request);
        let name = request.query.clone();
        let responses = tokio::select! {
            _ = cancellation.cancelled() => return Err(ConnectorError::Cancelled),
            responses = transport.query(request) => responses.map_err(|status| {
                tracing::warn!(query = %name, status = %status, "query dispatch failed");
                ConnectorError::AxonServer {
                    client: self.ctx.client_id().to_string(),
                    category: ErrorCategory::QueryDispatchError,
                    message: "An error occurred while attempting to dispatch a query".to_string(),
                    location: String::new(),
                    details: vec![status.message().to_string()],
                }
            })?,
        };
        Ok(responses
            .map(|response| response.map_err(ConnectorError::from))
            .take_until(cancellation.clone().cancelled_owned())
            .boxed())
    }

    /// Open a subscription query.
    ///
    /// The server may buffer `buffer_size` updates ahead of the consumer; more
    /// are requested `fetch_size` at a time.
    pub async fn subscription_query(
        &self,
        request: QueryRequest,
        update_type: SerializedObject,
        buffer_size: PermitCount,
        fetch_size: PermitCount,
        cancellation: &CancellationToken,
    ) -> Result<QuerySubscriptionResult, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let request = self.prepare(request);
        let query = SubscriptionQuery {
            subscription_identifier: request.message_identifier.clone(),
            number_of_permits: buffer_size.value(),
            query_request: Some(request),
            update_response_type: Some(update_type),
        };

        let OutboundStream { sender, stream } = OutboundStream::new(DEFAULT_CHANNEL_BUFFER);
        sender
            .send(SubscriptionQueryRequest {
                request: Some(subscription_query_request::Request::Subscribe(query.clone())),
            })
            .await?;
        sender
            .send(SubscriptionQueryRequest {
                request: Some(subscription_query_request::Request::GetInitialResult(query.clone())),
            })
            .await?;
        let inbound = tokio::select! {
            _ = cancellation.cancelled() => return Err(ConnectorError::Cancelled),
            inbound = transport.subscription(stream) => inbound?,
        };

        let cancellation = cancellation.child_token();
        let (initial_tx, initial_rx) = oneshot::channel();
        let buffer = usize::try_from(buffer_size.value()).unwrap_or(usize::MAX).clamp(1, 10_000);
        let (updates_tx, updates_rx) = mpsc::channel(buffer);
        tokio::spawn(
            SubscriptionReader {
                inbound,
                initial: Some(initial_tx),
                updates: updates_tx,
                sender: sender.clone(),
                query: query.clone(),
                flow: FlowController::new(buffer_size, fetch_size),
                client: self.ctx.client_id().to_string(),
                cancellation: cancellation.clone(),
            }
            .run(),
        );

        let initial = initial_rx
            .map(|outcome| outcome.unwrap_or(Err(ConnectorError::Cancelled)))
            .boxed()
            .shared();
        Ok(QuerySubscriptionResult {
            query,
            sender,
            initial,
            updates: ReceiverStream::new(updates_rx),
            _guard: cancellation.clone().drop_guard(),
            cancellation,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.actor.state().connected
    }

    pub fn watch(&self) -> watch::Receiver<ChannelStatus> {
        self.actor.watch()
    }

    pub(crate) async fn dispose(&self) {
        self.actor.dispose().await;
    }
}
