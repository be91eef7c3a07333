// ABOUTME: tonic implementation of the AxonServer transport traits.
// ABOUTME: Calls methods by path through tonic's generic client with the prost codec.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_proto::admin::{
    AdminActionResult, ContextOverview, Empty, EventProcessor, Token,
};
use axon_proto::command::{
    Command, CommandProviderInbound, CommandProviderOutbound, CommandResponse,
};
use axon_proto::control::{
    ClientIdentification, PlatformInboundInstruction, PlatformInfo, PlatformOutboundInstruction,
};
use axon_proto::event::{
    Confirmation, Event, EventWithToken, GetAggregateEventsRequest, GetAggregateSnapshotsRequest,
    GetEventsRequest, GetFirstTokenRequest, GetLastTokenRequest, QueryEventsRequest,
    QueryEventsResponse, ReadHighestSequenceNrResponse, ScheduleToken, TrackingToken,
};
use axon_proto::InstructionAck;
use axon_proto::paths;
use axon_proto::query::{
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
    SubscriptionQueryRequest, SubscriptionQueryResponse,
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tonic::client::Grpc;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Channel;
use tonic::{Request, Status};

use crate::auth::{Authentication, CONTEXT_HEADER};
use crate::channel::{create_channel, ChannelConfig, KeepAliveConfig, ServerEndpoint};
use crate::error::GrpcClientError;
use crate::stream::InboundStream;
use crate::transport::{
    AdminCall, AdminReply, AxonServerTransport, EventStoreCall, EventStoreReply, TransportConnector,
};

/// Transport over a tonic channel, stamping context and credentials on every call.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    endpoint: ServerEndpoint,
    channel: Channel,
    headers: Vec<(&'static str, AsciiMetadataValue)>,
}

impl GrpcTransport {
    pub fn new(
        endpoint: ServerEndpoint,
        channel: Channel,
        context: &str,
        authentication: &Authentication,
    ) -> Result<Self, GrpcClientError> {
        let mut headers = authentication.headers()?;
        let context = AsciiMetadataValue::try_from(context).map_err(|_| {
            GrpcClientError::InvalidMetadata {
                header: CONTEXT_HEADER,
            }
        })?;
        headers.push((CONTEXT_HEADER, context));

        Ok(Self {
            endpoint,
            channel,
            headers,
        })
    }

    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        for (header, value) in &self.headers {
            request.metadata_mut().insert(*header, value.clone());
        }
        request
    }

    async fn ready(&self) -> Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("service was not ready: {e}")))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Resp, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(self.request(message), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn server_streaming<Req, Resp>(
        &self,
        path: &'static str,
        message: Req,
    ) -> Result<InboundStream<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .server_streaming(self.request(message), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner().boxed())
    }

    async fn client_streaming<S, Req, Resp>(
        &self,
        path: &'static str,
        outbound: S,
    ) -> Result<Resp, Status>
    where
        S: Stream<Item = Req> + Send + 'static,
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .client_streaming(self.request(outbound), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner())
    }

    async fn streaming<Req, Resp>(
        &self,
        path: &'static str,
        outbound: ReceiverStream<Req>,
    ) -> Result<InboundStream<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.ready().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .streaming(self.request(outbound), PathAndQuery::from_static(path), codec)
            .await?;
        Ok(response.into_inner().boxed())
    }

    /// Drain a server-streaming admin call into a vector.
    async fn collect<Req, Resp>(&self, path: &'static str, message: Req) -> Result<Vec<Resp>, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut stream = self.server_streaming::<Req, Resp>(path, message).await?;
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    /// Admin mutations reply with a stream of `Empty` progress markers.
    async fn drain<Req>(&self, path: &'static str, message: Req) -> Result<AdminReply, Status>
    where
        Req: prost::Message + Send + Sync + 'static,
    {
        self.collect::<Req, Empty>(path, message).await?;
        Ok(AdminReply::Done)
    }
}

#[async_trait]
impl AxonServerTransport for GrpcTransport {
    fn endpoint(&self) -> &ServerEndpoint {
        &self.endpoint
    }

    async fn get_platform_server(
        &self,
        identification: ClientIdentification,
    ) -> Result<PlatformInfo, Status> {
        self.unary(paths::platform_service::GET_PLATFORM_SERVER, identification)
            .await
    }

    async fn open_control_stream(
        &self,
        outbound: ReceiverStream<PlatformInboundInstruction>,
    ) -> Result<InboundStream<PlatformOutboundInstruction>, Status> {
        self.streaming(paths::platform_service::OPEN_STREAM, outbound)
            .await
    }

    async fn open_command_stream(
        &self,
        outbound: ReceiverStream<CommandProviderOutbound>,
    ) -> Result<InboundStream<CommandProviderInbound>, Status> {
        self.streaming(paths::command_service::OPEN_STREAM, outbound)
            .await
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, Status> {
        self.unary(paths::command_service::DISPATCH, command).await
    }

    async fn open_query_stream(
        &self,
        outbound: ReceiverStream<QueryProviderOutbound>,
    ) -> Result<InboundStream<QueryProviderInbound>, Status> {
        self.streaming(paths::query_service::OPEN_STREAM, outbound)
            .await
    }

    async fn query(&self, request: QueryRequest) -> Result<InboundStream<QueryResponse>, Status> {
        self.server_streaming(paths::query_service::QUERY, request)
            .await
    }

    async fn subscription(
        &self,
        outbound: ReceiverStream<SubscriptionQueryRequest>,
    ) -> Result<InboundStream<SubscriptionQueryResponse>, Status> {
        self.streaming(paths::query_service::SUBSCRIPTION, outbound)
            .await
    }

    async fn append_events(&self, events: Vec<Event>) -> Result<Confirmation, Status> {
        self.client_streaming(paths::event_store::APPEND_EVENT, futures::stream::iter(events))
            .await
    }

    async fn list_events(
        &self,
        outbound: ReceiverStream<GetEventsRequest>,
    ) -> Result<InboundStream<EventWithToken>, Status> {
        self.streaming(paths::event_store::LIST_EVENTS, outbound)
            .await
    }

    async fn list_aggregate_events(
        &self,
        request: GetAggregateEventsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        self.server_streaming(paths::event_store::LIST_AGGREGATE_EVENTS, request)
            .await
    }

    async fn list_aggregate_snapshots(
        &self,
        request: GetAggregateSnapshotsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        self.server_streaming(paths::event_store::LIST_AGGREGATE_SNAPSHOTS, request)
            .await
    }

    async fn query_events(
        &self,
        outbound: ReceiverStream<QueryEventsRequest>,
    ) -> Result<InboundStream<QueryEventsResponse>, Status> {
        self.streaming(paths::event_store::QUERY_EVENTS, outbound)
            .await
    }

    async fn event_store(&self, call: EventStoreCall) -> Result<EventStoreReply, Status> {
        use paths::{event_scheduler, event_store};

        tracing::debug!(call = call.name(), endpoint = %self.endpoint, "event store call");
        match call {
            EventStoreCall::AppendSnapshot(snapshot) => self
                .unary::<_, Confirmation>(event_store::APPEND_SNAPSHOT, snapshot)
                .await
                .map(EventStoreReply::Confirmation),
            EventStoreCall::ReadHighestSequenceNr(request) => self
                .unary::<_, ReadHighestSequenceNrResponse>(
                    event_store::READ_HIGHEST_SEQUENCE_NR,
                    request,
                )
                .await
                .map(EventStoreReply::HighestSequence),
            EventStoreCall::GetFirstToken => self
                .unary::<_, TrackingToken>(event_store::GET_FIRST_TOKEN, GetFirstTokenRequest {})
                .await
                .map(EventStoreReply::Token),
            EventStoreCall::GetLastToken => self
                .unary::<_, TrackingToken>(event_store::GET_LAST_TOKEN, GetLastTokenRequest {})
                .await
                .map(EventStoreReply::Token),
            EventStoreCall::GetTokenAt(request) => self
                .unary::<_, TrackingToken>(event_store::GET_TOKEN_AT, request)
                .await
                .map(EventStoreReply::Token),
            EventStoreCall::ScheduleEvent(request) => self
                .unary::<_, ScheduleToken>(event_scheduler::SCHEDULE_EVENT, request)
                .await
                .map(EventStoreReply::Scheduled),
            EventStoreCall::RescheduleEvent(request) => self
                .unary::<_, ScheduleToken>(event_scheduler::RESCHEDULE_EVENT, request)
                .await
                .map(EventStoreReply::Scheduled),
            EventStoreCall::CancelScheduledEvent(request) => self
                .unary::<_, InstructionAck>(event_scheduler::CANCEL_SCHEDULED_EVENT, request)
                .await
                .map(EventStoreReply::Ack),
        }
    }

    async fn admin(&self, call: AdminCall) -> Result<AdminReply, Status> {
        use paths::{
            application_admin, context_admin, event_processor_admin, replication_group_admin,
            user_admin,
        };

        tracing::debug!(call = call.name(), endpoint = %self.endpoint, "admin call");
        match call {
            AdminCall::CreateContext(request) => {
                self.drain(context_admin::CREATE_CONTEXT, request).await
            }
            AdminCall::DeleteContext(request) => {
                self.drain(context_admin::DELETE_CONTEXT, request).await
            }
            AdminCall::GetContexts => self
                .collect::<Empty, ContextOverview>(context_admin::GET_CONTEXTS, Empty {})
                .await
                .map(AdminReply::Contexts),
            AdminCall::CreateReplicationGroup(request) => {
                self.drain(replication_group_admin::CREATE_REPLICATION_GROUP, request)
                    .await
            }
            AdminCall::DeleteReplicationGroup(request) => {
                self.drain(replication_group_admin::DELETE_REPLICATION_GROUP, request)
                    .await
            }
            AdminCall::CreateOrUpdateApplication(request) => self
                .unary::<_, Token>(application_admin::CREATE_OR_UPDATE_APPLICATION, request)
                .await
                .map(AdminReply::Token),
            AdminCall::DeleteApplication(request) => {
                self.drain(application_admin::DELETE_APPLICATION, request)
                    .await
            }
            AdminCall::CreateOrUpdateUser(request) => {
                self.drain(user_admin::CREATE_OR_UPDATE_USER, request).await
            }
            AdminCall::DeleteUser(request) => self.drain(user_admin::DELETE_USER, request).await,
            AdminCall::GetAllEventProcessors => self
                .collect::<Empty, EventProcessor>(
                    event_processor_admin::GET_ALL_EVENT_PROCESSORS,
                    Empty {},
                )
                .await
                .map(AdminReply::EventProcessors),
            AdminCall::PauseEventProcessor(identifier) => self
                .unary::<_, AdminActionResult>(
                    event_processor_admin::PAUSE_EVENT_PROCESSOR,
                    identifier,
                )
                .await
                .map(AdminReply::Action),
            AdminCall::StartEventProcessor(identifier) => self
                .unary::<_, AdminActionResult>(
                    event_processor_admin::START_EVENT_PROCESSOR,
                    identifier,
                )
                .await
                .map(AdminReply::Action),
            AdminCall::SplitEventProcessor(identifier) => self
                .unary::<_, AdminActionResult>(
                    event_processor_admin::SPLIT_EVENT_PROCESSOR,
                    identifier,
                )
                .await
                .map(AdminReply::Action),
            AdminCall::MergeEventProcessor(identifier) => self
                .unary::<_, AdminActionResult>(
                    event_processor_admin::MERGE_EVENT_PROCESSOR,
                    identifier,
                )
                .await
                .map(AdminReply::Action),
            AdminCall::MoveEventProcessorSegment(request) => self
                .unary::<_, AdminActionResult>(
                    event_processor_admin::MOVE_EVENT_PROCESSOR_SEGMENT,
                    request,
                )
                .await
                .map(AdminReply::Action),
        }
    }
}

/// Dials AxonServer nodes over tonic channels.
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    authentication: Authentication,
    connect_timeout: Duration,
    keep_alive: Option<KeepAliveConfig>,
    use_tls: bool,
}

impl GrpcConnector {
    pub fn new(authentication: Authentication) -> Self {
        Self {
            authentication,
            connect_timeout: Duration::from_secs(10),
            keep_alive: Some(KeepAliveConfig::default()),
            use_tls: false,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

#[async_trait]
impl TransportConnector for GrpcConnector {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        context: &str,
    ) -> Result<Arc<dyn AxonServerTransport>, GrpcClientError> {
        let mut config = ChannelConfig::for_endpoint(endpoint, self.use_tls)
            .with_connect_timeout(self.connect_timeout);
        config.keep_alive = self.keep_alive.clone();

        // tonic only bounds the TCP connect; the HTTP/2 handshake needs its own deadline.
        let channel = tokio::time::timeout(self.connect_timeout, create_channel(&config))
            .await
            .map_err(|_| GrpcClientError::ConnectTimeout {
                address: config.address.clone(),
                timeout: self.connect_timeout,
            })??;

        let transport =
            GrpcTransport::new(endpoint.clone(), channel, context, &self.authentication)?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::transport::Endpoint;

    fn lazy_transport(context: &str) -> Result<GrpcTransport, GrpcClientError> {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        GrpcTransport::new(
            ServerEndpoint::new("127.0.0.1", 1),
            channel,
            context,
            &Authentication::token("secret"),
        )
    }

    #[tokio::test]
    async fn stamps_context_and_token_on_requests() {
        let transport = lazy_transport("default").unwrap();
        let request = transport.request(Empty {});
        let metadata = request.metadata();
        assert_eq!(
            metadata.get(CONTEXT_HEADER).unwrap().to_str().unwrap(),
            "default"
        );
        assert_eq!(
            metadata
                .get(crate::auth::ACCESS_TOKEN_HEADER)
                .unwrap()
                .to_str()
                .unwrap(),
            "secret"
        );
    }

    #[tokio::test]
    async fn rejects_context_that_is_not_valid_metadata() {
        let err = lazy_transport("bad\ncontext").unwrap_err();
        assert!(matches!(
            err,
            GrpcClientError::InvalidMetadata {
                header: CONTEXT_HEADER
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_node_fails_calls_with_status() {
        let transport = lazy_transport("default").unwrap();
        let result = transport
            .get_platform_server(ClientIdentification::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connector_fails_fast_for_unreachable_endpoint() {
        let connector = GrpcConnector::new(Authentication::None)
            .without_keep_alive()
            .with_connect_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let result = connector
            .connect(&ServerEndpoint::new("127.0.0.1", 1), "default")
            .await;

        assert!(matches!(
            result.unwrap_err(),
            GrpcClientError::ConnectionFailed(_) | GrpcClientError::ConnectTimeout { .. }
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unreachable_node_fails_event_store_calls_with_status() {
        let transport = lazy_transport("default").unwrap();
        let result = transport.event_store(EventStoreCall::GetLastToken).await;
        assert!(result.is_err());
    }

    #[test]
    fn connector_builder_defaults() {
        let connector = GrpcConnector::new(Authentication::None);
        assert_eq!(connector.connect_timeout(), Duration::from_secs(10));
        let connector = connector.with_connect_timeout(Duration::from_secs(2));
        assert_eq!(connector.connect_timeout(), Duration::from_secs(2));
    }
}
