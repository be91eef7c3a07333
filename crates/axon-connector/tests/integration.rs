// ABOUTME: Integration tests for axon-connector against an in-memory AxonServer stand-in.
// ABOUTME: Covers command round trips, handler supersession, heartbeats and unreachable servers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axon_connector::axon_proto::command::{
    command_provider_inbound, command_provider_outbound, Command, CommandProviderInbound,
    CommandProviderOutbound, CommandResponse,
};
use axon_connector::axon_proto::common::{ErrorMessage, InstructionAck};
use axon_connector::axon_proto::control::{
    platform_inbound_instruction, platform_outbound_instruction, ClientIdentification,
    PlatformInboundInstruction, PlatformInfo, PlatformOutboundInstruction,
};
use axon_connector::axon_proto::event::{
    Confirmation, Event, EventWithToken, GetAggregateEventsRequest, GetAggregateSnapshotsRequest,
    GetEventsRequest, QueryEventsRequest, QueryEventsResponse,
};
use axon_connector::axon_proto::query::{
    QueryProviderInbound, QueryProviderOutbound, QueryRequest, QueryResponse,
    SubscriptionQueryRequest, SubscriptionQueryResponse,
};
use axon_connector::{
    AxonServerConnectionFactory, AxonServerConnectorOptions, ClientInstanceId, CommandHandler,
    CommandName, ComponentName, ConnectionEvent, ConnectorError, Context, LoadFactor,
    ServerEndpoint,
};
use axon_grpc::{
    AdminCall, AdminReply, AxonServerTransport, EventStoreCall, EventStoreReply, GrpcClientError,
    InboundStream, TransportConnector,
};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;

// ============================================================================
// Mini server
// ============================================================================

type Outbox<T> = mpsc::Sender<Result<T, Status>>;

#[derive(Default)]
struct Router {
    /// Latest provider stream subscribed to each command name.
    subscribers: HashMap<String, Outbox<CommandProviderInbound>>,
    /// Dispatched commands waiting for their response, by message id.
    pending: HashMap<String, oneshot::Sender<CommandResponse>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("subscribers", &self.subscribers.keys().collect::<Vec<_>>())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Acknowledges subscriptions and heartbeats and routes each command to the
/// stream that subscribed to its name last.
#[derive(Debug)]
struct MiniServer {
    endpoint: ServerEndpoint,
    router: Arc<Mutex<Router>>,
    heartbeats: Arc<AtomicUsize>,
    instructions: Arc<AtomicUsize>,
}

fn ack(instruction_id: String) -> InstructionAck {
    InstructionAck {
        instruction_id,
        success: true,
        error: None,
    }
}

impl MiniServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoint: ServerEndpoint::default(),
            router: Arc::new(Mutex::new(Router::default())),
            heartbeats: Arc::new(AtomicUsize::new(0)),
            instructions: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn next_instruction(&self) -> String {
        format!("server-{}", self.instructions.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl AxonServerTransport for MiniServer {
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
        mut outbound: ReceiverStream<PlatformInboundInstruction>,
    ) -> Result<InboundStream<PlatformOutboundInstruction>, Status> {
        let (tx, rx) = mpsc::channel(64);
        let heartbeats = self.heartbeats.clone();
        tokio::spawn(async move {
            while let Some(instruction) = outbound.next().await {
                if let Some(platform_inbound_instruction::Request::Heartbeat(_)) = instruction.request {
                    heartbeats.fetch_add(1, Ordering::SeqCst);
                    let reply = PlatformOutboundInstruction {
                        request: Some(platform_outbound_instruction::Request::Ack(ack(
                            instruction.instruction_id,
                        ))),
                        instruction_id: String::new(),
                    };
                    if tx.send(Ok(reply)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn open_command_stream(
        &self,
        mut outbound: ReceiverStream<CommandProviderOutbound>,
    ) -> Result<InboundStream<CommandProviderInbound>, Status> {
        let (tx, rx) = mpsc::channel(64);
        let router = self.router.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound.next().await {
                let instruction_id = message.instruction_id;
                match message.request {
                    Some(command_provider_outbound::Request::Subscribe(subscription)) => {
                        router
                            .lock()
                            .unwrap()
                            .subscribers
                            .insert(subscription.command, tx.clone());
                    }
                    Some(command_provider_outbound::Request::Unsubscribe(subscription)) => {
                        router.lock().unwrap().subscribers.remove(&subscription.command);
                    }
                    Some(command_provider_outbound::Request::CommandResponse(response)) => {
                        let waiter = router.lock().unwrap().pending.remove(&response.request_identifier);
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(response);
                        }
                        continue;
                    }
                    _ => continue,
                }
                if !instruction_id.is_empty() {
                    let reply = CommandProviderInbound {
                        request: Some(command_provider_inbound::Request::Ack(ack(instruction_id))),
                        instruction_id: String::new(),
                    };
                    if tx.send(Ok(reply)).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn dispatch_command(&self, command: Command) -> Result<CommandResponse, Status> {
        let (waiter, response) = oneshot::channel();
        let subscriber = {
            let mut router = self.router.lock().unwrap();
            let subscriber = router.subscribers.get(&command.name).cloned();
            if subscriber.is_some() {
                router.pending.insert(command.message_identifier.clone(), waiter);
            }
            subscriber
        };
        let Some(subscriber) = subscriber else {
            return Ok(CommandResponse {
                request_identifier: command.message_identifier,
                error_code: "AXONIQ-4000".to_string(),
                error_message: Some(ErrorMessage {
                    message: format!("No Handler for command: {}", command.name),
                    ..Default::default()
                }),
                ..Default::default()
            });
        };

        let delivery = CommandProviderInbound {
            request: Some(command_provider_inbound::Request::Command(command)),
            instruction_id: self.next_instruction(),
        };
        subscriber
            .send(Ok(delivery))
            .await
            .map_err(|_| Status::unavailable("command handler went away"))?;
        response
            .await
            .map_err(|_| Status::unavailable("command handler went away"))
    }

    async fn open_query_stream(
        &self,
        _: ReceiverStream<QueryProviderOutbound>,
    ) -> Result<InboundStream<QueryProviderInbound>, Status> {
        Err(Status::unimplemented("queries"))
    }

    async fn query(&self, _: QueryRequest) -> Result<InboundStream<QueryResponse>, Status> {
        Err(Status::unimplemented("queries"))
    }

    async fn subscription(
        &self,
        _: ReceiverStream<SubscriptionQueryRequest>,
    ) -> Result<InboundStream<SubscriptionQueryResponse>, Status> {
        Err(Status::unimplemented("subscription queries"))
    }

    async fn append_events(&self, _: Vec<Event>) -> Result<Confirmation, Status> {
        Err(Status::unimplemented("events"))
    }

    async fn list_events(
        &self,
        _: ReceiverStream<GetEventsRequest>,
    ) -> Result<InboundStream<EventWithToken>, Status> {
        Err(Status::unimplemented("events"))
    }

    async fn list_aggregate_events(
        &self,
        _: GetAggregateEventsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        Err(Status::unimplemented("events"))
    }

    async fn list_aggregate_snapshots(
        &self,
        _: GetAggregateSnapshotsRequest,
    ) -> Result<InboundStream<Event>, Status> {
        Err(Status::unimplemented("snapshots"))
    }

    async fn query_events(
        &self,
        _: ReceiverStream<QueryEventsRequest>,
    ) -> Result<InboundStream<QueryEventsResponse>, Status> {
        Err(Status::unimplemented("event queries"))
    }

    async fn event_store(&self, _: EventStoreCall) -> Result<EventStoreReply, Status> {
        Err(Status::unimplemented("events"))
    }

    async fn admin(&self, _: AdminCall) -> Result<AdminReply, Status> {
        Err(Status::unimplemented("admin"))
    }
}

#[derive(Debug)]
struct MiniConnector {
    server: Arc<MiniServer>,
}

#[async_trait]
impl TransportConnector for MiniConnector {
    async fn connect(
        &self,
        _endpoint: &ServerEndpoint,
        _context: &str,
    ) -> Result<Arc<dyn AxonServerTransport>, GrpcClientError> {
        Ok(self.server.clone())
    }
}

fn options() -> AxonServerConnectorOptions {
    AxonServerConnectorOptions::for_client(
        ComponentName::new("ping-service").unwrap(),
        ClientInstanceId::new("ping-1").unwrap(),
    )
    .with_tick_frequency(Duration::from_millis(5))
}

fn factory(server: &Arc<MiniServer>, options: AxonServerConnectorOptions) -> AxonServerConnectionFactory {
    AxonServerConnectionFactory::with_connector(
        options,
        Arc::new(MiniConnector {
            server: server.clone(),
        }),
    )
}

fn answering(reply_id: &'static str) -> Arc<dyn CommandHandler> {
    Arc::new(move |_command: Command, _cancellation: CancellationToken| async move {
        Ok(CommandResponse {
            message_identifier: reply_id.to_string(),
            ..Default::default()
        })
    })
}

fn ping(message_identifier: &str) -> Command {
    Command {
        name: "ping".to_string(),
        message_identifier: message_identifier.to_string(),
        ..Default::default()
    }
}

// ============================================================================
// Command round trips
// ============================================================================

#[tokio::test]
async fn test_ping_round_trip() {
    let server = MiniServer::new();
    let factory = factory(&server, options().without_heartbeat());
    let connection = factory.connect(Context::default()).await.unwrap();
    connection.wait_until_ready().await.unwrap();

    let channel = connection.command_channel().unwrap();
    let registration = channel
        .register_command_handler(
            answering("pong-1"),
            LoadFactor::new(1).unwrap(),
            [CommandName::new("ping").unwrap()],
        )
        .unwrap();
    registration.wait_until_completed().await.unwrap();

    let response = channel
        .send_command(ping("request-1"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.request_identifier, "request-1");
    assert_eq!(response.message_identifier, "pong-1");
    factory.dispose().await;
}

#[tokio::test]
async fn test_second_handler_supersedes_first() {
    let server = MiniServer::new();
    let factory = factory(&server, options().without_heartbeat());
    let connection = factory.connect(Context::default()).await.unwrap();
    connection.wait_until_ready().await.unwrap();
    let channel = connection.command_channel().unwrap();
    let ping_name = CommandName::new("ping").unwrap();

    let first = channel
        .register_command_handler(answering("first"), LoadFactor::default(), [ping_name.clone()])
        .unwrap();
    first.wait_until_completed().await.unwrap();
    let response = channel
        .send_command(ping("request-1"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.message_identifier, "first");

    let second = channel
        .register_command_handler(answering("second"), LoadFactor::default(), [ping_name])
        .unwrap();
    second.wait_until_completed().await.unwrap();
    let response = channel
        .send_command(ping("request-2"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.message_identifier, "second");
    assert_eq!(response.request_identifier, "request-2");
    factory.dispose().await;
}

#[tokio::test]
async fn test_command_without_handler_reports_error_code() {
    let server = MiniServer::new();
    let factory = factory(&server, options().without_heartbeat());
    let connection = factory.connect(Context::default()).await.unwrap();
    connection.wait_until_ready().await.unwrap();

    let response = connection
        .command_channel()
        .unwrap()
        .send_command(ping("request-1"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.error_code, "AXONIQ-4000");
    factory.dispose().await;
}

// ============================================================================
// Heartbeats
// ============================================================================

#[tokio::test]
async fn test_acknowledged_heartbeats_keep_connection() {
    let server = MiniServer::new();
    let factory = factory(
        &server,
        options().with_heartbeat(Duration::from_millis(20), Duration::from_millis(200)),
    );
    let connection = factory.connect(Context::default()).await.unwrap();
    let mut events = connection.subscribe();
    connection.wait_until_ready().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(server.heartbeats.load(Ordering::SeqCst) >= 3);
    assert!(connection.is_connected());
    while let Ok(event) = events.try_recv() {
        assert_ne!(event, ConnectionEvent::Disconnected);
    }
    factory.dispose().await;
}

// ============================================================================
// Unreachable servers
// ============================================================================

#[tokio::test]
async fn test_unreachable_server_fails_fast() {
    let connect_timeout = Duration::from_millis(500);
    let options = options()
        .without_heartbeat()
        .with_routing_servers([ServerEndpoint::new("127.0.0.1", 1)])
        .with_connect_timeout(connect_timeout);
    let factory = AxonServerConnectionFactory::new(options);
    let connection = factory.connect(Context::default()).await.unwrap();

    let admin = tokio::time::timeout(connect_timeout, connection.admin_channel().unwrap().get_all_contexts())
        .await
        .expect("admin call hung");
    assert!(matches!(admin, Err(ConnectorError::NotConnected(_))));

    let command = tokio::time::timeout(
        connect_timeout,
        connection
            .command_channel()
            .unwrap()
            .send_command(ping("request-1"), &CancellationToken::new()),
    )
    .await
    .expect("command dispatch hung");
    assert!(command.unwrap_err().is_connectivity());

    let query = tokio::time::timeout(
        connect_timeout,
        connection
            .query_channel()
            .unwrap()
            .query(QueryRequest::default(), &CancellationToken::new()),
    )
    .await
    .expect("query dispatch hung");
    assert!(query.is_err());

    let connected = tokio::time::timeout(connect_timeout * 2, connection.wait_until_connected()).await;
    assert!(connected.is_err());
    assert!(!connection.is_connected());
    factory.dispose().await;
}
