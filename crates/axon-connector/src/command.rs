// ABOUTME: Command channel: subscribes command handlers, runs routed commands and dispatches commands.
// ABOUTME: The provider stream is owned by an actor; handlers run on their own tasks.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_proto::command::{
    command_provider_inbound, command_provider_outbound, Command, CommandProviderInbound,
    CommandProviderOutbound, CommandResponse, CommandSubscription,
};
use axon_proto::{ErrorMessage, FlowControl, InstructionAck, ProcessingInstruction, ProcessingKey};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::actor::{ActorRef, AxonActor, Mailbox, Receive};
use crate::channel::{ChannelContext, ChannelStatus};
use crate::clock::millis;
use crate::command_registrations::CommandRegistrations;
use crate::duplex::{ChannelStream, StreamEvent};
use crate::error::{ConnectorError, ErrorCategory};
use crate::handlers::CommandHandler;
use crate::ids::{CommandName, IdGenerator, InstructionId, LoadFactor, RegistrationId, SubscriptionId, TokenSequence};
use crate::permits::{FlowController, PermitCount};
use crate::sync::{Completion, CountdownCompletionSource};
use crate::task_cache::TaskCache;

const PURGE_INTERVAL: Duration = Duration::from_secs(15);
const MAX_HANDLER_AGE: Duration = Duration::from_secs(300);

pub(crate) enum CommandMessage {
    Connect,
    Disconnect,
    Reopen { generation: u64 },
    Stream(u64, StreamEvent<CommandProviderInbound>),
    Register {
        handler_id: RegistrationId,
        load_factor: LoadFactor,
        handler: Arc<dyn CommandHandler>,
        commands: Vec<(SubscriptionId, CommandName)>,
        completion: CountdownCompletionSource,
    },
    Unregister {
        handler_id: RegistrationId,
        commands: Vec<(SubscriptionId, CommandName)>,
        completion: CountdownCompletionSource,
    },
    HandlerCompleted { token: u64, response: CommandResponse },
    Purge,
}

impl fmt::Debug for CommandMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandMessage::Connect => f.write_str("Connect"),
            CommandMessage::Disconnect => f.write_str("Disconnect"),
            CommandMessage::Reopen { generation } => {
                f.debug_struct("Reopen").field("generation", generation).finish()
            }
            CommandMessage::Stream(generation, event) => {
                f.debug_tuple("Stream").field(generation).field(event).finish()
            }
            CommandMessage::Register {
                handler_id, commands, ..
            } => f
                .debug_struct("Register")
                .field("handler_id", handler_id)
                .field("commands", commands)
                .finish_non_exhaustive(),
            CommandMessage::Unregister {
                handler_id, commands, ..
            } => f
                .debug_struct("Unregister")
                .field("handler_id", handler_id)
                .field("commands", commands)
                .finish_non_exhaustive(),
            CommandMessage::HandlerCompleted { token, .. } => f
                .debug_struct("HandlerCompleted")
                .field("token", token)
                .finish_non_exhaustive(),
            CommandMessage::Purge => f.write_str("Purge"),
        }
    }
}

#[derive(Debug, Clone)]
struct InFlightCommand {
    cancel: CancellationToken,
    task: Arc<JoinHandle<()>>,
}

impl InFlightCommand {
    fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

#[derive(Clone)]
struct CommandState {
    ctx: ChannelContext,
    stream: ChannelStream<CommandProviderOutbound>,
    registrations: CommandRegistrations,
    permits: PermitCount,
    flow: FlowController,
    in_flight: TaskCache<InFlightCommand>,
    tokens: TokenSequence,
    purge_scheduled: bool,
    connected: bool,
}

fn outbound(request: command_provider_outbound::Request, instruction_id: String) -> CommandProviderOutbound {
    CommandProviderOutbound {
        request: Some(request),
        instruction_id,
    }
}

impl CommandState {
    fn subscription(&self, instruction_id: &InstructionId, command: &CommandName, load_factor: i32) -> CommandSubscription {
        CommandSubscription {
            message_id: instruction_id.to_string(),
            command: command.to_string(),
            component_name: self.ctx.component_name().to_string(),
            client_id: self.ctx.client_id().to_string(),
            load_factor,
        }
    }

    fn flow_control(&self, permits: PermitCount) -> CommandProviderOutbound {
        CommandProviderOutbound::flow_control(FlowControl {
            client_id: self.ctx.client_id().to_string(),
            permits: permits.value(),
        })
    }

    async fn open(&mut self, actor: &ActorRef<CommandMessage>) -> Result<(), ConnectorError> {
        let transport = self.ctx.transport.require()?;
        self.connected = false;
        if !self.purge_scheduled {
            self.purge_scheduled = schedule_purge(actor);
        }

        let generation = self.stream.open(
            actor,
            move |outbound| async move { transport.open_command_stream(outbound).await },
            CommandMessage::Stream,
        );
        tracing::debug!(generation, "opening command stream");

        // Write failures surface as a closed stream of this generation.
        self.flow.reset();
        self.write(self.flow_control(self.permits)).await;
        for resubscription in self.registrations.rebase() {
            let subscription = self.subscription(
                &resubscription.instruction_id,
                &resubscription.command_name,
                resubscription.load_factor.value(),
            );
            self.write(outbound(
                command_provider_outbound::Request::Subscribe(subscription),
                resubscription.instruction_id.to_string(),
            ))
            .await;
        }
        Ok(())
    }

    async fn on_stream(&mut self, event: StreamEvent<CommandProviderInbound>, actor: &ActorRef<CommandMessage>) {
        match event {
            StreamEvent::Opened => {
                self.stream.opened();
                self.connected = true;
                tracing::info!(client = %self.ctx.client_id(), "command channel connected");
            }
            StreamEvent::Received(message) => {
                let instruction_id = message.instruction_id;
                match message.request {
                    Some(command_provider_inbound::Request::Ack(ack)) => {
                        self.registrations.acknowledge(&ack);
                    }
                    Some(command_provider_inbound::Request::Command(command)) => {
                        self.on_command(command, &instruction_id, actor).await;
                        if self.flow.increment() {
                            let refill = self.flow_control(self.flow.threshold());
                            self.write(refill).await;
                        }
                    }
                    None => {
                        tracing::debug!(instruction_id = %instruction_id, "ignoring empty command instruction");
                    }
                }
            }
            StreamEvent::Closed(error) => {
                self.connected = false;
                let due = self.stream.failed();
                match &error {
                    Some(error) => tracing::warn!(
                        error = %error,
                        due_ms = millis(due),
                        "command stream failed, reopening"
                    ),
                    None => tracing::info!(due_ms = millis(due), "command stream completed, reopening"),
                }
                let reopen = CommandMessage::Reopen {
                    generation: self.stream.generation(),
                };
                if let Err(err) = actor.schedule(reopen, due) {
                    tracing::debug!(error = %err, "command stream will not be reopened");
                }
            }
        }
    }

    async fn on_command(&mut self, command: Command, instruction_id: &str, actor: &ActorRef<CommandMessage>) {
        let handler = CommandName::new(command.name.clone())
            .ok()
            .and_then(|name| self.registrations.handler_for(&name));

        let Some(handler) = handler else {
            let error = ErrorMessage {
                message: format!("No Handler for command: {}", command.name),
                location: self.ctx.client_id().to_string(),
                details: Vec::new(),
                error_code: ErrorCategory::NoHandlerForCommand.code().to_string(),
            };
            tracing::warn!(command = %command.name, "no handler for command");
            self.acknowledge(instruction_id, Some(error.clone())).await;
            let response = CommandResponse {
                message_identifier: self.ctx.ids.next_id(),
                request_identifier: command.message_identifier,
                error_code: error.error_code.clone(),
                error_message: Some(error),
                ..Default::default()
            };
            self.write(outbound(
                command_provider_outbound::Request::CommandResponse(response),
                String::new(),
            ))
            .await;
            return;
        };

        self.acknowledge(instruction_id, None).await;

        let token = self.tokens.next();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_handler(
            handler,
            command,
            cancel.clone(),
            self.ctx.ids.clone(),
            token,
            actor.clone(),
        ));
        let in_flight = InFlightCommand {
            cancel,
            task: Arc::new(task),
        };
        if let Err(err) = self.in_flight.add(token, in_flight.clone()) {
            tracing::error!(error = %err, "could not track command handler, aborting it");
            in_flight.abort();
        }
    }

    async fn acknowledge(&self, instruction_id: &str, error: Option<ErrorMessage>) {
        if instruction_id.is_empty() {
            return;
        }
        let ack = InstructionAck {
            instruction_id: instruction_id.to_string(),
            success: error.is_none(),
            error,
        };
        self.write(CommandProviderOutbound::ack(ack)).await;
    }

    async fn write(&self, message: CommandProviderOutbound) {
        if let Err(err) = self.stream.send(message).await {
            tracing::debug!(error = %err, "could not write to command stream");
        }
    }

    async fn register(
        &mut self,
        handler_id: RegistrationId,
        load_factor: LoadFactor,
        handler: Arc<dyn CommandHandler>,
        commands: Vec<(SubscriptionId, CommandName)>,
        completion: CountdownCompletionSource,
    ) {
        self.registrations
            .register_command_handler(handler_id.clone(), completion, load_factor, handler);
        for (subscription_id, command_name) in commands {
            let instruction_id =
                self.registrations
                    .subscribe_to_command(handler_id.clone(), subscription_id, command_name.clone());
            // Without a stream, the next open re-sends every pending subscription.
            if self.stream.is_open() {
                let subscription = self.subscription(&instruction_id, &command_name, load_factor.value());
                self.write(outbound(
                    command_provider_outbound::Request::Subscribe(subscription),
                    instruction_id.to_string(),
                ))
                .await;
            }
        }
    }

    async fn unregister(
        &mut self,
        handler_id: RegistrationId,
        commands: Vec<(SubscriptionId, CommandName)>,
        completion: CountdownCompletionSource,
    ) {
        if !self.registrations.is_handler_registered(&handler_id) {
            while !completion.is_completed() {
                completion.try_signal_success();
            }
            return;
        }

        let mut unsubscribes = Vec::new();
        for (subscription_id, command_name) in commands {
            match self.registrations.unsubscribe_from_command(&subscription_id) {
                Some(instruction_id) => unsubscribes.push((instruction_id, command_name)),
                // Superseded or already gone: nothing to tell the server.
                None => {
                    completion.try_signal_success();
                }
            }
        }
        self.registrations
            .unregister_command_handler(&handler_id, completion);

        if self.stream.is_open() {
            for (instruction_id, command_name) in unsubscribes {
                let subscription = self.subscription(&instruction_id, &command_name, 0);
                self.write(outbound(
                    command_provider_outbound::Request::Unsubscribe(subscription),
                    instruction_id.to_string(),
                ))
                .await;
            }
        }
    }

    fn purge(&mut self, actor: &ActorRef<CommandMessage>) {
        let expired = self.in_flight.purge(MAX_HANDLER_AGE);
        if !expired.is_empty() {
            tracing::warn!(count = expired.len(), "aborting command handlers that ran too long");
        }
        for command in expired {
            command.abort();
        }
        self.purge_scheduled = schedule_purge(actor);
    }
}

fn schedule_purge(actor: &ActorRef<CommandMessage>) -> bool {
    match actor.schedule(CommandMessage::Purge, PURGE_INTERVAL) {
        Ok(_) => true,
        Err(err) => {
            tracing::debug!(error = %err, "could not schedule command purge");
            false
        }
    }
}

async fn run_handler(
    handler: Arc<dyn CommandHandler>,
    command: Command,
    cancel: CancellationToken,
    ids: IdGenerator,
    token: u64,
    actor: ActorRef<CommandMessage>,
) {
    let request_identifier = command.message_identifier.clone();
    let name = command.name.clone();
    let outcome = AssertUnwindSafe(handler.handle(command, cancel))
        .catch_unwind()
        .await;

    let mut response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            tracing::warn!(command = %name, error = %error, "command handler failed");
            execution_error(&error)
        }
        Err(_) => {
            tracing::error!(command = %name, "command handler panicked");
            execution_error(&ConnectorError::axon_server(
                "",
                ErrorCategory::CommandExecutionError,
                format!("handler of command {name} panicked"),
            ))
        }
    };
    response.request_identifier = request_identifier;
    if response.message_identifier.is_empty() {
        response.message_identifier = ids.next_id();
    }
    let _ = actor.tell(CommandMessage::HandlerCompleted { token, response });
}

fn execution_error(error: &ConnectorError) -> CommandResponse {
    let error_message = error.to_error_message(ErrorCategory::CommandExecutionError, "Client");
    CommandResponse {
        error_code: error_message.error_code.clone(),
        error_message: Some(error_message),
        ..Default::default()
    }
}

#[async_trait]
impl Receive<CommandMessage> for CommandState {
    type Snapshot = ChannelStatus;

    async fn receive(
        &mut self,
        message: CommandMessage,
        actor: &ActorRef<CommandMessage>,
    ) -> Result<(), ConnectorError> {
        match message {
            CommandMessage::Connect => {
                if !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            CommandMessage::Reopen { generation } => {
                if self.stream.generation() == generation && !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            CommandMessage::Disconnect => {
                self.stream.close();
                self.connected = false;
            }
            CommandMessage::Stream(generation, event) => {
                if !self.stream.is_current(generation) {
                    tracing::debug!(generation, "ignoring event of a retired command stream");
                    return Ok(());
                }
                self.on_stream(event, actor).await;
            }
            CommandMessage::Register {
                handler_id,
                load_factor,
                handler,
                commands,
                completion,
            } => {
                self.register(handler_id, load_factor, handler, commands, completion)
                    .await
            }
            CommandMessage::Unregister {
                handler_id,
                commands,
                completion,
            } => self.unregister(handler_id, commands, completion).await,
            CommandMessage::HandlerCompleted { token, response } => {
                if self.in_flight.try_remove(token).is_none() {
                    tracing::debug!(token, "dropping response of a purged command");
                    return Ok(());
                }
                self.write(outbound(
                    command_provider_outbound::Request::CommandResponse(response),
                    String::new(),
                ))
                .await;
            }
            CommandMessage::Purge => self.purge(actor),
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
        for command in self.in_flight.drain() {
            command.abort();
        }
    }
}

/// A command handler subscribed through [`CommandChannel::register_command_handler`].
#[derive(Debug)]
pub struct CommandHandlerRegistration {
    handler_id: RegistrationId,
    commands: Vec<(SubscriptionId, CommandName)>,
    completion: Completion,
    actor: ActorRef<CommandMessage>,
}

impl CommandHandlerRegistration {
    pub fn id(&self) -> &RegistrationId {
        &self.handler_id
    }

    /// Resolves once the server acknowledged every subscription.
    pub async fn wait_until_completed(&self) -> Result<(), ConnectorError> {
        self.completion.wait().await
    }

    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Unsubscribe every command of this handler and wait for the server to confirm.
    pub async fn dispose(self) -> Result<(), ConnectorError> {
        let source = CountdownCompletionSource::new(self.commands.len())?;
        let done = source.completion();
        self.actor.tell(CommandMessage::Unregister {
            handler_id: self.handler_id,
            commands: self.commands,
            completion: source,
        })?;
        done.wait().await
    }
}

/// Command channel handle. Owned by its connection.
pub struct CommandChannel {
    actor: AxonActor<CommandMessage, CommandState>,
    ctx: ChannelContext,
}

impl fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandChannel")
            .field("status", &self.actor.state())
            .finish()
    }
}

impl CommandChannel {
    pub(crate) fn new(ctx: ChannelContext, permits: PermitCount, permits_batch: PermitCount) -> Self {
        let mailbox = Mailbox::new("command", ctx.scheduler.clone());
        let state = CommandState {
            stream: ChannelStream::new(ctx.backoff),
            registrations: CommandRegistrations::new(ctx.identity.client_instance_id.clone(), ctx.ids.clone()),
            permits,
            flow: FlowController::new(permits, permits_batch),
            in_flight: TaskCache::new(ctx.clock.clone()),
            tokens: TokenSequence::new(),
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
        self.actor.tell(CommandMessage::Connect)
    }

    pub(crate) fn disconnect(&self) -> Result<(), ConnectorError> {
        self.actor.tell(CommandMessage::Disconnect)
    }

    /// Subscribe `handler` to `command_names`. A later registration for the
    /// same name takes over from earlier ones.
    pub fn register_command_handler(
        &self,
        handler: Arc<dyn CommandHandler>,
        load_factor: LoadFactor,
        command_names: impl IntoIterator<Item = CommandName>,
    ) -> Result<CommandHandlerRegistration, ConnectorError> {
        let commands: Vec<(SubscriptionId, CommandName)> = command_names
            .into_iter()
            .map(|name| (self.ctx.ids.subscription_id(), name))
            .collect();
        if commands.is_empty() {
            return Err(ConnectorError::InvalidArgument(
                "at least one command name is required".into(),
            ));
        }

        let handler_id = self.ctx.ids.registration_id();
        let source = CountdownCompletionSource::new(commands.len())?;
        let completion = source.completion();
        self.actor.tell(CommandMessage::Register {
            handler_id: handler_id.clone(),
            load_factor,
            handler,
            commands: commands.clone(),
            completion: source,
        })?;
        Ok(CommandHandlerRegistration {
            handler_id,
            commands,
            completion,
            actor: self.actor.actor_ref(),
        })
    }

    /// Dispatch a command to whichever client handles it.
    pub async fn send_command(
        &self,
        mut command: Command,
        cancellation: &CancellationToken,
    ) -> Result<CommandResponse, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        command.client_id = self.ctx.client_id().to_string();
        command.component_name = self.ctx.component_name().to_string();
        if command.message_identifier.is_empty() {
            command.message_identifier = self.ctx.ids.next_id();
        }
        let routed = command
            .processing_instructions
            .iter()
            .any(|instruction| instruction.key == ProcessingKey::RoutingKey as i32);
        if !routed {
            command
                .processing_instructions
                .push(ProcessingInstruction::routing_key(command.message_identifier.clone()));
        }

        let name = command.name.clone();
        tokio::select! {
            _ = cancellation.cancelled() => Err(ConnectorError::Cancelled),
            result = transport.dispatch_command(command) => result.map_err(|status| {
                tracing::warn!(command = %name, status = %status, "command dispatch failed");
                ConnectorError::AxonServer {
                    client: self.ctx.client_id().to_string(),
                    category: ErrorCategory::CommandDispatchError,
                    message: "An error occurred while attempting to dispatch a command".to_string(),
                    location: String::new(),
                    details: vec![status.message().to_string()],
                }
            }),
        }
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
