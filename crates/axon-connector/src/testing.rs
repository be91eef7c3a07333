// ABOUTME: In-memory transport for unit tests of the channels.
// ABOUTME: Hands every opened stream to the test, which scripts the server side by hand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axon_grpc::{
    AdminCall, AdminReply, AxonServerTransport, EventStoreCall, EventStoreReply, InboundStream,
    ServerEndpoint,
};
use axon_proto::command::{Command, CommandProviderInbound, CommandProviderOutbound, CommandResponse};
use axon_proto::control::{
    ClientIdentification, EventProcessorInfo, PlatformInboundInstruction, PlatformInfo,
    PlatformOutboundInstruction,
};
use axon_proto::event::{
    Confirmation, Event, EventWithToken, GetAggregateEventsRequest, GetAggregateSnapshotsRequest,
    GetEventsRequest, QueryEventsRequest, QueryEventsResponse, ReadHighestSequenceNrResponse,
    ScheduleToken, TrackingToken,
};
use axon_proto::InstructionAck;
use axon_proto::query::{
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
    SubscriptionQueryRequest, SubscriptionQueryResponse,
};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tonic::Status;

use crate::backoff::BackoffPolicyOptions;
use crate::channel::{ChannelContext, ConnectionNotifier};
use crate::clock::Clock;
use crate::error::ConnectorError;
use crate::handlers::{EventProcessorInfoSupplier, EventProcessorInstructionHandler};
use crate::ids::{ClientIdentity, ClientInstanceId, ComponentName, Context, IdGenerator, SegmentId};
use crate::routing::TransportSlot;
use crate::scheduler::Scheduler;

/// One opened streaming call, seen from the server side.
pub(crate) struct Call<Out, In> {
    pub(crate) outbound: ReceiverStream<Out>,
    pub(crate) inbound: mpsc::UnboundedSender<Result<In, Status>>,
}

impl<Out, In> Call<Out, In> {
    /// Next message the client wrote, failing the test after a second.
    pub(crate) async fn next(&mut self) -> Out {
        tokio::time::timeout(Duration::from_secs(1), self.outbound.next())
            .await
            .expect("timed out waiting for the client")
            .expect("client closed the stream")
    }

    pub(crate) fn push(&self, message: In) {
        let _ = self.inbound.send(Ok(message));
    }

    pub(crate) fn fail(&self, status: Status) {
        let _ = self.inbound.send(Err(status));
    }
}

struct Calls<Out, In> {
    opened: mpsc::UnboundedSender<Call<Out, In>>,
    waiting: tokio::sync::Mutex<mpsc::UnboundedReceiver<Call<Out, In>>>,
}

impl<Out: Send + 'static, In: Send + 'static> Calls<Out, In> {
    fn new() -> Self {
        let (opened, waiting) = mpsc::unbounded_channel();
        Self {
            opened,
            waiting: tokio::sync::Mutex::new(waiting),
        }
    }

    fn open(&self, outbound: ReceiverStream<Out>) -> InboundStream<In> {
        let (inbound, rx) = mpsc::unbounded_channel();
        let _ = self.opened.send(Call { outbound, inbound });
        UnboundedReceiverStream::new(rx).boxed()
    }

    async fn next(&self) -> Call<Out, In> {
        let mut waiting = self.waiting.lock().await;
        tokio::time::timeout(Duration::from_secs(1), waiting.recv())
            .await
            .expect("timed out waiting for a stream to open")
            .expect("fake transport dropped")
    }
}

pub(crate) struct FakeTransport {
    endpoint: ServerEndpoint,
    control: Calls<PlatformInboundInstruction, PlatformOutboundInstruction>,
    command: Calls<CommandProviderOutbound, CommandProviderInbound>,
    query: Calls<QueryProviderOutbound, QueryProviderInbound>,
    subscription: Calls<SubscriptionQueryRequest, SubscriptionQueryResponse>,
    events: Calls<GetEventsRequest, EventWithToken>,
    event_queries: Calls<QueryEventsRequest, QueryEventsResponse>,
    pub(crate) dispatched: Mutex<Vec<Command>>,
    pub(crate) query_responses: Mutex<Vec<QueryResponse>>,
    pub(crate) appended: Mutex<Vec<Event>>,
    pub(crate) aggregate: Mutex<Vec<Event>>,
    pub(crate) snapshots: Mutex<Vec<Event>>,
    pub(crate) event_store_replies: Mutex<HashMap<&'static str, Result<EventStoreReply, Status>>>,
    pub(crate) event_store_calls: Mutex<Vec<EventStoreCall>>,
    pub(crate) admin_replies: Mutex<HashMap<&'static str, Result<AdminReply, Status>>>,
    pub(crate) admin_calls: Mutex<Vec<AdminCall>>,
}

impl std::fmt::Debug for FakeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeTransport")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoint: ServerEndpoint::new("fake", 8124),
            control: Calls::new(),
            command: Calls::new(),
            query: Calls::new(),
            subscription: Calls::new(),
            events: Calls::new(),
            event_queries: Calls::new(),
            dispatched: Mutex::new(Vec::new()),
            query_responses: Mutex::new(Vec::new()),
            appended: Mutex::new(Vec::new()),
            aggregate: Mutex::new(Vec::new()),
            snapshots: Mutex::new(Vec::new()),
            event_store_replies: Mutex::new(HashMap::new()),
            event_store_calls: Mutex::new(Vec::new()),
            admin_replies: Mutex::new(HashMap::new()),
            admin_calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) async fn control_call(
        &self,
    ) -> Call<PlatformInboundInstruction, PlatformOutboundInstruction> {
        self.control.next().await
    }

    pub(crate) async fn command_call(&self) -> Call<CommandProviderOutbound, CommandProviderInbound> {
        self.command.next().await
    }

    pub(crate) async fn query_call(&self) -> Call<QueryProviderOutbound, QueryProviderInbound> {
        self.query.next().await
    }

    pub(crate) async fn subscription_call(
        &self,
    ) -> Call<SubscriptionQueryRequest, SubscriptionQueryResponse> {
        self.subscription.next().await
    }

    pub(crate) async fn events_call(&self) -> Call<GetEventsRequest, EventWithToken> {
        self.events.next().await
    }

    pub(crate) async fn event_query_call(&self) -> Call<QueryEventsRequest, QueryEventsResponse> {
        self.event_queries.next().await
    }

    /// What a cooperative server answers when the test scripted nothing else.
    fn default_event_store_reply(&self, call: &EventStoreCall) -> EventStoreReply {
        match call {
            EventStoreCall::AppendSnapshot(snapshot) => {
                self.snapshots.lock().unwrap().push(snapshot.clone());
                EventStoreReply::Confirmation(Confirmation { success: true })
            }
            EventStoreCall::ReadHighestSequenceNr(request) => {
                let to_sequence_nr = self
                    .aggregate
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|event| event.aggregate_identifier == request.aggregate_id)
                    .map(|event| event.aggregate_sequence_number)
                    .max()
                    .unwrap_or(-1);
                EventStoreReply::HighestSequence(ReadHighestSequenceNrResponse { to_sequence_nr })
            }
            EventStoreCall::GetFirstToken
            | EventStoreCall::GetLastToken
            | EventStoreCall::GetTokenAt(_) => EventStoreReply::Token(TrackingToken { token: 0 }),
            EventStoreCall::ScheduleEvent(_) | EventStoreCall::RescheduleEvent(_) => {
                let count = self.event_store_calls.lock().unwrap().len();
                EventStoreReply::Scheduled(ScheduleToken {
                    token: format!("scheduled-{count}"),
                })
            }
            EventStoreCall::CancelScheduledEvent(request) => EventStoreReply::Ack(InstructionAck {
                instruction_id: request.token.clone(),
                success: true,
                error: None,
            }),
        }
    }
}

#[async_trait]
impl AxonServerTransport for FakeTransport {
    fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    async fn get_platform_server(&self, _: ClientIdentification) -> Result<PlatformInfo, Status> {
        Ok(PlatformInfo {
            primary: None,
            same_connection: true,
        })
    }

    async fn open_control_stream(
        &self,
        outbound: ReceiverStream<PlatformInboundInstruction>,
    ) -> Result<InboundStream<PlatformOutboundInstruction>, Status> {
        Ok(self.control.open(outbound))
    }

    async fn open_command_stream(
        &self,
        outbound: ReceiverStream<CommandProviderOutbound>,
    ) -> Result<InboundStream<CommandProviderInbound>, Status> {
        Ok(self.command.open(outbound))
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, Status> {
        let response = CommandResponse {
            message_identifier: format!("reply-to-{}", command.message_identifier),
            request_identifier: command.message_identifier.clone(),
            ..Default::default()
        };
        self.dispatched.lock().unwrap().push(command);
        Ok(response)
    }

    async fn open_query_stream(
        &self,
        outbound: ReceiverStream<QueryProviderOutbound>,
    ) -> Result<InboundStream<QueryProviderInbound>, Status> {
        Ok(self.query.open(outbound))
    }

    async fn query(&self, _: QueryRequest) -> Result<InboundStream<QueryResponse>, Status> {
        let responses = self.query_responses.lock().unwrap().clone();
        Ok(futures::stream::iter(responses.into_iter().map(Ok)).boxed())
    }

    async fn subscription(
        &self,
        outbound: ReceiverStream<SubscriptionQueryRequest>,
    ) -> Result<InboundStream<SubscriptionQueryResponse>, Status> {
        Ok(self.subscription.open(outbound))
    }

    async fn append_events(&self, events: Vec<Event>) -> Result<Confirmation, Status> {
        self.appended.lock().unwrap().extend(events);
        Ok(Confirmation { success: true })
    }

    async fn list_events(
        &self,
        outbound: ReceiverStream<GetEventsRequest>,
    ) -> Result<InboundStream<EventWithToken>, Status> {
        Ok(self.events.open(outbound))
    }

    async fn list_aggregate_events(
        &self,
        request: GetAggregateEventsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        let events: Vec<Event> = self
            .aggregate
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.aggregate_identifier == request.aggregate_id)
            .filter(|event| request.allow_snapshots || !event.snapshot)
            .cloned()
            .collect();
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn list_aggregate_snapshots(
        &self,
        request: GetAggregateSnapshotsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        let limit = usize::try_from(request.max_results).unwrap_or(0);
        let snapshots: Vec<Event> = self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|snapshot| snapshot.aggregate_identifier == request.aggregate_id)
            .filter(|snapshot| snapshot.aggregate_sequence_number >= request.initial_sequence)
            .filter(|snapshot| {
                request.max_sequence == 0 || snapshot.aggregate_sequence_number <= request.max_sequence
            })
            .rev()
            .take(limit)
            .cloned()
            .collect();
        Ok(futures::stream::iter(snapshots.into_iter().map(Ok)).boxed())
    }

    async fn query_events(
        &self,
        outbound: ReceiverStream<QueryEventsRequest>,
    ) -> Result<InboundStream<QueryEventsResponse>, Status> {
        Ok(self.event_queries.open(outbound))
    }

    async fn event_store(&self, call: EventStoreCall) -> Result<EventStoreReply, Status> {
        let scripted = self.event_store_replies.lock().unwrap().get(call.name()).cloned();
        let reply = match scripted {
            Some(reply) => reply,
            None => Ok(self.default_event_store_reply(&call)),
        };
        self.event_store_calls.lock().unwrap().push(call);
        reply
    }

    async fn admin(&self, call: AdminCall) -> Result<AdminReply, Status> {
        let name = call.name();
        self.admin_calls.lock().unwrap().push(call);
        self.admin_replies
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(Ok(AdminReply::Done))
    }
}

pub(crate) fn identity() -> ClientIdentity {
    ClientIdentity::new(
        ComponentName::new("orders").unwrap(),
        ClientInstanceId::new("client-1").unwrap(),
    )
}

/// A channel context whose slot already holds `transport`.
pub(crate) fn context(transport: Option<Arc<FakeTransport>>, notifier: ConnectionNotifier) -> ChannelContext {
    let slot = Arc::new(TransportSlot::new());
    if let Some(transport) = transport {
        let transport: Arc<dyn AxonServerTransport> = transport;
        slot.replace(Some(transport));
    }
    ChannelContext {
        context: Context::default(),
        identity: identity(),
        ids: IdGenerator::sequential("id"),
        clock: Clock::system(),
        scheduler: Scheduler::new(Clock::system(), Duration::from_millis(10)),
        transport: slot,
        backoff: BackoffPolicyOptions::new(Duration::from_millis(50), Duration::from_millis(200), 2.0)
            .unwrap(),
        notifier,
    }
}

/// A local event processor that records the instructions it receives.
pub(crate) struct FakeEventProcessor {
    info: Mutex<Result<Option<EventProcessorInfo>, ConnectorError>>,
    outcome: Mutex<Result<bool, ConnectorError>>,
    pub(crate) instructions: Mutex<Vec<String>>,
}

impl FakeEventProcessor {
    pub(crate) fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            info: Mutex::new(Ok(Some(EventProcessorInfo {
                processor_name: name.to_string(),
                mode: "Tracking".to_string(),
                running: true,
                ..Default::default()
            }))),
            outcome: Mutex::new(Ok(true)),
            instructions: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_info(&self, info: EventProcessorInfo) {
        *self.info.lock().unwrap() = Ok(Some(info));
    }

    pub(crate) fn set_info_outcome(&self, outcome: Result<Option<EventProcessorInfo>, ConnectorError>) {
        *self.info.lock().unwrap() = outcome;
    }

    /// What every later instruction returns. Pause and start map `Ok(false)` to success.
    pub(crate) fn set_outcome(&self, outcome: Result<bool, ConnectorError>) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub(crate) fn instructions(&self) -> Vec<String> {
        self.instructions.lock().unwrap().clone()
    }

    fn record(&self, instruction: String) -> Result<bool, ConnectorError> {
        self.instructions.lock().unwrap().push(instruction);
        self.outcome.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventProcessorInfoSupplier for FakeEventProcessor {
    async fn info(&self) -> Result<Option<EventProcessorInfo>, ConnectorError> {
        self.info.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventProcessorInstructionHandler for FakeEventProcessor {
    async fn release_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError> {
        self.record(format!("release {segment}"))
    }

    async fn split_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError> {
        self.record(format!("split {segment}"))
    }

    async fn merge_segment(&self, segment: SegmentId) -> Result<bool, ConnectorError> {
        self.record(format!("merge {segment}"))
    }

    async fn pause(&self) -> Result<(), ConnectorError> {
        self.record("pause".to_string()).map(|_| ())
    }

    async fn start(&self) -> Result<(), ConnectorError> {
        self.record("start".to_string()).map(|_| ())
    }
}
