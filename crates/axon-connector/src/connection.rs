// ABOUTME: A connection to one AxonServer context and the channels that run over it.
// ABOUTME: An actor drives connect, retry and reconnect; channels are created on first use.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use axon_grpc::{AxonServerTransport, TransportConnector};
use tokio::sync::{broadcast, watch};

use crate::actor::{ActorRef, AxonActor, Mailbox, Receive};
use crate::admin::AdminChannel;
use crate::backoff::BackoffPolicy;
use crate::channel::{ChannelContext, ChannelStatus, ConnectionNotifier};
use crate::clock::millis;
use crate::command::CommandChannel;
use crate::config::{refill_batch, AxonServerConnectorOptions};
use crate::control::ControlChannel;
use crate::error::ConnectorError;
use crate::event::EventChannel;
use crate::ids::{ClientIdentity, Context};
use crate::permits::PermitCount;
use crate::query::QueryChannel;
use crate::routing::{RoutingChannelFactory, TransportSlot};
use crate::scheduler::Scheduler;

const EVENT_CAPACITY: usize = 16;

/// Lifecycle notifications, delivered to every subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    /// Connected, and every stream-backed channel in use is connected too.
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub ready: bool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}

#[derive(Debug)]
pub(crate) enum ConnectionMessage {
    Connect,
    Reconnect { reason: String },
    Disconnect,
    Retry,
    TransportCreated(Option<Arc<dyn AxonServerTransport>>),
    ChannelCreated,
    ChannelStatusChanged { channel: &'static str, connected: bool },
}

/// The channels of one connection. Only the control channel exists up front.
#[derive(Debug)]
struct Channels {
    ctx: ChannelContext,
    control: ControlChannel,
    command: OnceLock<CommandChannel>,
    query: OnceLock<QueryChannel>,
    event: OnceLock<EventChannel>,
    admin: OnceLock<AdminChannel>,
    command_permits: PermitCount,
    query_permits: PermitCount,
}

impl Channels {
    /// Open the streams of every channel that is not connected yet.
    fn connect_all(&self) {
        let mut outcomes = vec![("control", self.control.connect())];
        if let Some(command) = self.command.get() {
            outcomes.push(("command", command.connect()));
        }
        if let Some(query) = self.query.get() {
            outcomes.push(("query", query.connect()));
        }
        for (channel, outcome) in outcomes {
            if let Err(err) = outcome {
                tracing::debug!(channel, error = %err, "could not connect channel");
            }
        }
    }

    fn disconnect_all(&self) {
        let mut outcomes = vec![("control", self.control.disconnect())];
        if let Some(command) = self.command.get() {
            outcomes.push(("command", command.disconnect()));
        }
        if let Some(query) = self.query.get() {
            outcomes.push(("query", query.disconnect()));
        }
        for (channel, outcome) in outcomes {
            if let Err(err) = outcome {
                tracing::debug!(channel, error = %err, "could not disconnect channel");
            }
        }
        if let Some(event) = self.event.get() {
            event.reconnect();
        }
    }

    // The event and admin channels have no stream of their own to wait for.
    fn is_ready(&self) -> bool {
        self.control.is_connected()
            && self.command.get().map_or(true, CommandChannel::is_connected)
            && self.query.get().map_or(true, QueryChannel::is_connected)
    }

    async fn dispose(&self) {
        self.control.dispose().await;
        if let Some(command) = self.command.get() {
            command.dispose().await;
        }
        if let Some(query) = self.query.get() {
            query.dispose().await;
        }
        if let Some(event) = self.event.get() {
            event.dispose();
        }
    }
}

#[derive(Clone)]
struct ConnectionActorState {
    context: Context,
    routing: Arc<RoutingChannelFactory>,
    transport: Arc<TransportSlot>,
    channels: Arc<Channels>,
    backoff: BackoffPolicy,
    state: ConnectionState,
    ready: bool,
    creating: bool,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionActorState {
    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Resolve a transport off the mailbox; the result comes back as a message.
    fn create_transport(&mut self, actor: &ActorRef<ConnectionMessage>) {
        if self.creating {
            return;
        }
        self.creating = true;
        let routing = self.routing.clone();
        let context = self.context.clone();
        let actor = actor.clone();
        tokio::spawn(async move {
            let transport = routing.create(&context).await;
            let _ = actor.tell(ConnectionMessage::TransportCreated(transport));
        });
    }

    fn on_transport(&mut self, transport: Option<Arc<dyn AxonServerTransport>>, actor: &ActorRef<ConnectionMessage>) {
        self.creating = false;
        let attempt = match self.state {
            ConnectionState::Connecting { attempt } | ConnectionState::Reconnecting { attempt } => attempt,
            _ => {
                tracing::debug!(state = ?self.state, "discarding transport, no longer connecting");
                return;
            }
        };

        match transport {
            Some(transport) => {
                tracing::info!(
                    context = %self.context,
                    server = %transport.endpoint(),
                    attempt,
                    "connected to AxonServer"
                );
                self.transport.replace(Some(transport));
                self.backoff.reset();
                self.state = ConnectionState::Connected;
                self.publish(ConnectionEvent::Connected);
                self.channels.connect_all();
                self.check_readiness();
            }
            None => {
                let due = self.backoff.next();
                tracing::warn!(
                    context = %self.context,
                    attempt,
                    due_ms = millis(due),
                    "could not connect to any AxonServer node, retrying"
                );
                self.state = match self.state {
                    ConnectionState::Reconnecting { .. } => ConnectionState::Reconnecting { attempt: attempt + 1 },
                    _ => ConnectionState::Connecting { attempt: attempt + 1 },
                };
                if let Err(err) = actor.schedule(ConnectionMessage::Retry, due) {
                    tracing::debug!(error = %err, "connection attempts stopped");
                }
            }
        }
    }

    fn tear_down(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        self.ready = false;
        self.channels.disconnect_all();
        self.transport.replace(None);
        if was_connected {
            self.publish(ConnectionEvent::Disconnected);
        }
    }

    fn check_readiness(&mut self) {
        let ready = self.state == ConnectionState::Connected && self.channels.is_ready();
        if ready == self.ready {
            return;
        }
        self.ready = ready;
        if ready {
            tracing::info!(context = %self.context, "connection ready");
            self.publish(ConnectionEvent::Ready);
        } else {
            tracing::info!(context = %self.context, "connection no longer ready");
        }
    }
}

#[async_trait]
impl Receive<ConnectionMessage> for ConnectionActorState {
    type Snapshot = ConnectionStatus;

    async fn receive(
        &mut self,
        message: ConnectionMessage,
        actor: &ActorRef<ConnectionMessage>,
    ) -> Result<(), ConnectorError> {
        match message {
            ConnectionMessage::Connect => {
                if self.state == ConnectionState::Disconnected {
                    self.state = ConnectionState::Connecting { attempt: 1 };
                    self.create_transport(actor);
                }
            }
            ConnectionMessage::Retry => {
                if matches!(
                    self.state,
                    ConnectionState::Connecting { .. } | ConnectionState::Reconnecting { .. }
                ) {
                    self.create_transport(actor);
                }
            }
            ConnectionMessage::Reconnect { reason } => {
                if self.state != ConnectionState::Connected {
                    tracing::debug!(%reason, state = ?self.state, "ignoring reconnect request");
                    return Ok(());
                }
                tracing::warn!(context = %self.context, %reason, "reconnecting");
                self.tear_down();
                self.state = ConnectionState::Reconnecting { attempt: 1 };
                self.create_transport(actor);
            }
            ConnectionMessage::Disconnect => {
                if self.state != ConnectionState::Closed {
                    self.tear_down();
                    self.state = ConnectionState::Disconnected;
                    tracing::info!(context = %self.context, "disconnected");
                }
            }
            ConnectionMessage::TransportCreated(transport) => self.on_transport(transport, actor),
            ConnectionMessage::ChannelCreated => {
                if self.state == ConnectionState::Connected {
                    self.channels.connect_all();
                }
                self.check_readiness();
            }
            ConnectionMessage::ChannelStatusChanged { channel, connected } => {
                tracing::debug!(channel, connected, "channel status changed");
                self.check_readiness();
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            ready: self.ready,
        }
    }

    async fn stopped(&mut self) {
        self.tear_down();
        self.state = ConnectionState::Closed;
    }
}

/// Report every status change of a channel to its connection until either stops.
fn watch_channel(
    channel: &'static str,
    mut status: watch::Receiver<ChannelStatus>,
    connection: ActorRef<ConnectionMessage>,
) {
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let connected = status.borrow_and_update().connected;
            if connection
                .tell(ConnectionMessage::ChannelStatusChanged { channel, connected })
                .is_err()
            {
                break;
            }
        }
    });
}

/// A connection to one context of AxonServer.
pub struct AxonServerConnection {
    context: Context,
    identity: ClientIdentity,
    actor: AxonActor<ConnectionMessage, ConnectionActorState>,
    channels: Arc<Channels>,
    events: broadcast::Sender<ConnectionEvent>,
    scheduler: Scheduler,
    disposed: AtomicBool,
}

impl fmt::Debug for AxonServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AxonServerConnection")
            .field("context", &self.context)
            .field("status", &self.actor.state())
            .finish()
    }
}

impl AxonServerConnection {
    pub(crate) fn new(
        context: Context,
        options: &AxonServerConnectorOptions,
        connector: Arc<dyn TransportConnector>,
    ) -> Self {
        let scheduler = Scheduler::new(options.clock.clone(), options.tick_frequency);
        let mailbox = Mailbox::new(format!("connection-{context}"), scheduler.clone());

        let reconnect = mailbox.actor_ref();
        let notifier = ConnectionNotifier::new(move |reason| {
            let _ = reconnect.tell(ConnectionMessage::Reconnect { reason });
        });

        let transport = Arc::new(TransportSlot::new());
        let ctx = ChannelContext {
            context: context.clone(),
            identity: options.identity.clone(),
            ids: options.ids.clone(),
            clock: options.clock.clone(),
            scheduler: scheduler.clone(),
            transport: transport.clone(),
            backoff: options.reconnect_backoff,
            notifier,
        };
        let channels = Arc::new(Channels {
            control: ControlChannel::new(
                ctx.clone(),
                options.heartbeat,
                options.event_processor_update_frequency,
            ),
            command: OnceLock::new(),
            query: OnceLock::new(),
            event: OnceLock::new(),
            admin: OnceLock::new(),
            command_permits: options.command_permits,
            query_permits: options.query_permits,
            ctx,
        });
        watch_channel("control", channels.control.watch(), mailbox.actor_ref());

        let routing = Arc::new(RoutingChannelFactory::new(
            options.identity.clone(),
            options.routing_servers.clone(),
            connector,
            options.connect_timeout,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = ConnectionActorState {
            context: context.clone(),
            routing,
            transport,
            channels: channels.clone(),
            backoff: BackoffPolicy::new(options.reconnect_backoff),
            state: ConnectionState::Disconnected,
            ready: false,
            creating: false,
            events: events.clone(),
        };

        Self {
            context,
            identity: options.identity.clone(),
            actor: AxonActor::start(mailbox, state),
            channels,
            events,
            scheduler,
            disposed: AtomicBool::new(false),
        }
    }

    /// Start connecting. Does nothing while already connecting or connected.
    pub fn connect(&self) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        self.actor.tell(ConnectionMessage::Connect)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn client_identity(&self) -> &ClientIdentity {
        &self.identity
    }

    fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnectorError::Disposed("connection"));
        }
        Ok(())
    }

    pub fn control_channel(&self) -> Result<&ControlChannel, ConnectorError> {
        self.ensure_open()?;
        Ok(&self.channels.control)
    }

    pub fn command_channel(&self) -> Result<&CommandChannel, ConnectorError> {
        self.ensure_open()?;
        let mut created = false;
        let channel = self.channels.command.get_or_init(|| {
            created = true;
            let permits = self.channels.command_permits;
            CommandChannel::new(self.channels.ctx.clone(), permits, refill_batch(permits))
        });
        if created {
            watch_channel("command", channel.watch(), self.actor.actor_ref());
            self.actor.tell(ConnectionMessage::ChannelCreated)?;
        }
        Ok(channel)
    }

    pub fn query_channel(&self) -> Result<&QueryChannel, ConnectorError> {
        self.ensure_open()?;
        let mut created = false;
        let channel = self.channels.query.get_or_init(|| {
            created = true;
            let permits = self.channels.query_permits;
            QueryChannel::new(self.channels.ctx.clone(), permits, refill_batch(permits))
        });
        if created {
            watch_channel("query", channel.watch(), self.actor.actor_ref());
            self.actor.tell(ConnectionMessage::ChannelCreated)?;
        }
        Ok(channel)
    }

    pub fn event_channel(&self) -> Result<&EventChannel, ConnectorError> {
        self.ensure_open()?;
        Ok(self
            .channels
            .event
            .get_or_init(|| EventChannel::new(self.channels.ctx.clone())))
    }

    pub fn admin_channel(&self) -> Result<&AdminChannel, ConnectorError> {
        self.ensure_open()?;
        Ok(self
            .channels
            .admin
            .get_or_init(|| AdminChannel::new(self.channels.ctx.clone())))
    }

    pub fn status(&self) -> ConnectionStatus {
        self.actor.state()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && self.status().is_connected()
    }

    /// Connected, with every stream-backed channel in use connected as well.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.channels.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.actor.watch()
    }

    async fn wait_for(&self, condition: impl Fn(&ConnectionStatus) -> bool) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        let mut status = self.actor.watch();
        let closed = status
            .wait_for(|status| status.is_closed() || condition(status))
            .await
            .map_err(|_| ConnectorError::Disposed("connection"))?
            .is_closed();
        if closed {
            return Err(ConnectorError::Disposed("connection"));
        }
        Ok(())
    }

    pub async fn wait_until_connected(&self) -> Result<(), ConnectorError> {
        self.wait_for(ConnectionStatus::is_connected).await
    }

    pub async fn wait_until_ready(&self) -> Result<(), ConnectorError> {
        self.wait_for(|status| status.is_connected() && status.ready).await
    }

    /// Close every channel stream and drop the transport. `connect` starts over.
    pub fn disconnect(&self) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        self.actor.tell(ConnectionMessage::Disconnect)
    }

    /// Drop the current transport and connect again.
    pub fn reconnect(&self) -> Result<(), ConnectorError> {
        self.ensure_open()?;
        self.actor.tell(ConnectionMessage::Reconnect {
            reason: "requested by the application".to_string(),
        })
    }

    /// Tear down every channel and stop. Later channel access fails with `Disposed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(context = %self.context, "disposing connection");
        self.channels.dispose().await;
        self.actor.dispose().await;
        self.scheduler.dispose().await;
    }
}
