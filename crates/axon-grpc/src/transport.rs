// ABOUTME: The transport seam between the connector core and the wire.
// ABOUTME: One trait method per RPC the core consumes, plus the connector that builds transports.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axon_proto::admin::{
    AdminActionResult, ApplicationId, ApplicationRequest, ContextOverview, CreateContextRequest,
    CreateOrUpdateUserRequest, CreateReplicationGroupRequest, DeleteContextRequest,
    DeleteReplicationGroupRequest, DeleteUserRequest, EventProcessor, EventProcessorIdentifier,
    MoveSegment, Token,
};
use axon_proto::command::{
    Command, CommandProviderInbound, CommandProviderOutbound, CommandResponse,
};
use axon_proto::control::{
    ClientIdentification, PlatformInboundInstruction, PlatformInfo, PlatformOutboundInstruction,
};
use axon_proto::event::{
    CancelScheduledEventRequest, Confirmation, Event, EventWithToken, GetAggregateEventsRequest,
    GetAggregateSnapshotsRequest, GetEventsRequest, GetTokenAtRequest, QueryEventsRequest,
    QueryEventsResponse, ReadHighestSequenceNrRequest, ReadHighestSequenceNrResponse,
    RescheduleEventRequest, ScheduleEventRequest, ScheduleToken, TrackingToken,
};
use axon_proto::InstructionAck;
use axon_proto::query::{
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
    SubscriptionQueryRequest, SubscriptionQueryResponse,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

use crate::channel::ServerEndpoint;
use crate::error::GrpcClientError;
use crate::stream::InboundStream;

/// Administrative requests, one variant per admin RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCall {
    CreateContext(CreateContextRequest),
    DeleteContext(DeleteContextRequest),
    GetContexts,
    CreateReplicationGroup(CreateReplicationGroupRequest),
    DeleteReplicationGroup(DeleteReplicationGroupRequest),
    CreateOrUpdateApplication(ApplicationRequest),
    DeleteApplication(ApplicationId),
    CreateOrUpdateUser(CreateOrUpdateUserRequest),
    DeleteUser(DeleteUserRequest),
    GetAllEventProcessors,
    PauseEventProcessor(EventProcessorIdentifier),
    StartEventProcessor(EventProcessorIdentifier),
    SplitEventProcessor(EventProcessorIdentifier),
    MergeEventProcessor(EventProcessorIdentifier),
    MoveEventProcessorSegment(MoveSegment),
}

impl AdminCall {
    /// RPC method name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            AdminCall::CreateContext(_) => "CreateContext",
            AdminCall::DeleteContext(_) => "DeleteContext",
            AdminCall::GetContexts => "GetContexts",
            AdminCall::CreateReplicationGroup(_) => "CreateReplicationGroup",
            AdminCall::DeleteReplicationGroup(_) => "DeleteReplicationGroup",
            AdminCall::CreateOrUpdateApplication(_) => "CreateOrUpdateApplication",
            AdminCall::DeleteApplication(_) => "DeleteApplication",
            AdminCall::CreateOrUpdateUser(_) => "CreateOrUpdateUser",
            AdminCall::DeleteUser(_) => "DeleteUser",
            AdminCall::GetAllEventProcessors => "GetAllEventProcessors",
            AdminCall::PauseEventProcessor(_) => "PauseEventProcessor",
            AdminCall::StartEventProcessor(_) => "StartEventProcessor",
            AdminCall::SplitEventProcessor(_) => "SplitEventProcessor",
            AdminCall::MergeEventProcessor(_) => "MergeEventProcessor",
            AdminCall::MoveEventProcessorSegment(_) => "MoveEventProcessorSegment",
        }
    }
}

/// Replies to [`AdminCall`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminReply {
    /// The call completed without a payload.
    Done,
    Contexts(Vec<ContextOverview>),
    Token(Token),
    EventProcessors(Vec<EventProcessor>),
    Action(AdminActionResult),
}

/// Unary event store and event scheduler requests.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStoreCall {
    AppendSnapshot(Event),
    ReadHighestSequenceNr(ReadHighestSequenceNrRequest),
    GetFirstToken,
    GetLastToken,
    GetTokenAt(GetTokenAtRequest),
    ScheduleEvent(ScheduleEventRequest),
    RescheduleEvent(RescheduleEventRequest),
    CancelScheduledEvent(CancelScheduledEventRequest),
}

impl EventStoreCall {
    /// RPC method name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            EventStoreCall::AppendSnapshot(_) => "AppendSnapshot",
            EventStoreCall::ReadHighestSequenceNr(_) => "ReadHighestSequenceNr",
            EventStoreCall::GetFirstToken => "GetFirstToken",
            EventStoreCall::GetLastToken => "GetLastToken",
            EventStoreCall::GetTokenAt(_) => "GetTokenAt",
            EventStoreCall::ScheduleEvent(_) => "ScheduleEvent",
            EventStoreCall::RescheduleEvent(_) => "RescheduleEvent",
            EventStoreCall::CancelScheduledEvent(_) => "CancelScheduledEvent",
        }
    }
}

/// Replies to [`EventStoreCall`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum EventStoreReply {
    Confirmation(Confirmation),
    HighestSequence(ReadHighestSequenceNrResponse),
    Token(TrackingToken),
    Scheduled(ScheduleToken),
    Ack(InstructionAck),
}

/// A live connection to one AxonServer node, bound to a context.
///
/// Streaming calls take the outbound half as a receiver stream and return the
/// inbound half. Dropping the outbound sender half-closes the call.
#[async_trait]
pub trait AxonServerTransport: Send + Sync + fmt::Debug {
    /// Node this transport is connected to.
    fn endpoint(&self) -> &ServerEndpoint;

    async fn get_platform_server(
        &self,
        identification: ClientIdentification,
    ) -> Result<PlatformInfo, Status>;

    async fn open_control_stream(
        &self,
        outbound: ReceiverStream<PlatformInboundInstruction>,
    ) -> Result<InboundStream<PlatformOutboundInstruction>, Status>;

    async fn open_command_stream(
        &self,
        outbound: ReceiverStream<CommandProviderOutbound>,
    ) -> Result<InboundStream<CommandProviderInbound>, Status>;

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, Status>;

    async fn open_query_stream(
        &self,
        outbound: ReceiverStream<QueryProviderOutbound>,
    ) -> Result<InboundStream<QueryProviderInbound>, Status>;

    async fn query(&self, request: QueryRequest) -> Result<InboundStream<QueryResponse>, Status>;

    async fn subscription(
        &self,
        outbound: ReceiverStream<SubscriptionQueryRequest>,
    ) -> Result<InboundStream<SubscriptionQueryResponse>, Status>;

    async fn append_events(&self, events: Vec<Event>) -> Result<Confirmation, Status>;

    async fn list_events(
        &self,
        outbound: ReceiverStream<GetEventsRequest>,
    ) -> Result<InboundStream<EventWithToken>, Status>;

    async fn list_aggregate_events(
        &self,
        request: GetAggregateEventsRequest,
    ) -> Result<InboundStream<Event>, Status>;

    async fn list_aggregate_snapshots(
        &self,
        request: GetAggregateSnapshotsRequest,
    ) -> Result<InboundStream<Event>, Status>;

    async fn query_events(
        &self,
        outbound: ReceiverStream<QueryEventsRequest>,
    ) -> Result<InboundStream<QueryEventsResponse>, Status>;

    async fn event_store(&self, call: EventStoreCall) -> Result<EventStoreReply, Status>;

    async fn admin(&self, call: AdminCall) -> Result<AdminReply, Status>;
}

/// Dials an endpoint and produces a transport bound to a context.
#[async_trait]
pub trait TransportConnector: Send + Sync + fmt::Debug {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        context: &str,
    ) -> Result<Arc<dyn AxonServerTransport>, GrpcClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_call_names_match_rpc_methods() {
        assert_eq!(AdminCall::GetContexts.name(), "GetContexts");
        assert_eq!(
            AdminCall::MergeEventProcessor(EventProcessorIdentifier::default()).name(),
            "MergeEventProcessor"
        );
        assert_eq!(
            AdminCall::MoveEventProcessorSegment(MoveSegment::default()).name(),
            "MoveEventProcessorSegment"
        );
    }

    #[test]
    fn event_store_call_names_match_rpc_methods() {
        assert_eq!(EventStoreCall::GetLastToken.name(), "GetLastToken");
        assert_eq!(
            EventStoreCall::CancelScheduledEvent(CancelScheduledEventRequest::default()).name(),
            "CancelScheduledEvent"
        );
        assert_eq!(
            EventStoreCall::AppendSnapshot(Event::default()).name(),
            "AppendSnapshot"
        );
    }
}
