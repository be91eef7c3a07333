// ABOUTME: The platform control channel of a connection.
// ABOUTME: Announces the client, answers server instructions, reports event processors
// ABOUTME: and carries the heartbeat protocol.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_proto::control::{
    platform_inbound_instruction, platform_outbound_instruction, Heartbeat, InstructionResult,
    PlatformInboundInstruction, PlatformOutboundInstruction,
};
use axon_proto::{ErrorMessage, InstructionAck};
use futures::FutureExt;
use tokio::sync::watch;

use crate::actor::{ActorRef, AxonActor, Mailbox, Receive};
use crate::channel::{ChannelContext, ChannelStatus};
use crate::clock::millis;
use crate::duplex::{ChannelStream, StreamEvent};
use crate::error::{ConnectorError, ErrorCategory};
use crate::event_processors::EventProcessorCollection;
use crate::handlers::{EventProcessorInfoSupplier, EventProcessorInstructionHandler};
use crate::heartbeat::{HeartbeatChannel, HeartbeatState};
use crate::ids::{EventProcessorName, IdGenerator, RegistrationId, SegmentId};
use crate::sync::{Completion, CountdownCompletionSource};

pub(crate) enum ControlMessage {
    Connect,
    Disconnect,
    Reopen { generation: u64 },
    Stream(u64, StreamEvent<PlatformOutboundInstruction>),
    Send(PlatformInboundInstruction),
    EnableHeartbeat { interval: Duration, timeout: Duration },
    DisableHeartbeat,
    RegisterEventProcessor {
        name: EventProcessorName,
        registration: RegistrationId,
        supplier: Arc<dyn EventProcessorInfoSupplier>,
        handler: Arc<dyn EventProcessorInstructionHandler>,
        completion: CountdownCompletionSource,
    },
    UnregisterEventProcessor {
        name: EventProcessorName,
        registration: RegistrationId,
        completion: CountdownCompletionSource,
    },
    SendAllEventProcessorInfo,
}

impl fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::Connect => f.write_str("Connect"),
            ControlMessage::Disconnect => f.write_str("Disconnect"),
            ControlMessage::Reopen { generation } => {
                f.debug_struct("Reopen").field("generation", generation).finish()
            }
            ControlMessage::Stream(generation, event) => {
                f.debug_tuple("Stream").field(generation).field(event).finish()
            }
            ControlMessage::Send(instruction) => f.debug_tuple("Send").field(instruction).finish(),
            ControlMessage::EnableHeartbeat { interval, timeout } => f
                .debug_struct("EnableHeartbeat")
                .field("interval", interval)
                .field("timeout", timeout)
                .finish(),
            ControlMessage::DisableHeartbeat => f.write_str("DisableHeartbeat"),
            ControlMessage::RegisterEventProcessor {
                name, registration, ..
            } => f
                .debug_struct("RegisterEventProcessor")
                .field("name", name)
                .field("registration", registration)
                .finish_non_exhaustive(),
            ControlMessage::UnregisterEventProcessor {
                name, registration, ..
            } => f
                .debug_struct("UnregisterEventProcessor")
                .field("name", name)
                .field("registration", registration)
                .finish_non_exhaustive(),
            ControlMessage::SendAllEventProcessorInfo => f.write_str("SendAllEventProcessorInfo"),
        }
    }
}

/// A server instruction aimed at one event processor.
#[derive(Debug, Clone, Copy)]
enum ProcessorInstruction {
    Pause,
    Start,
    Release(SegmentId),
    Split(SegmentId),
    Merge(SegmentId),
}

impl ProcessorInstruction {
    fn label(self) -> &'static str {
        match self {
            ProcessorInstruction::Pause => "pause",
            ProcessorInstruction::Start => "start",
            ProcessorInstruction::Release(_) => "release segment",
            ProcessorInstruction::Split(_) => "split segment",
            ProcessorInstruction::Merge(_) => "merge segment",
        }
    }

    async fn run(self, handler: &dyn EventProcessorInstructionHandler) -> Result<bool, ConnectorError> {
        match self {
            ProcessorInstruction::Pause => handler.pause().await.map(|()| true),
            ProcessorInstruction::Start => handler.start().await.map(|()| true),
            ProcessorInstruction::Release(segment) => handler.release_segment(segment).await,
            ProcessorInstruction::Split(segment) => handler.split_segment(segment).await,
            ProcessorInstruction::Merge(segment) => handler.merge_segment(segment).await,
        }
    }
}

#[derive(Clone)]
struct ControlState {
    ctx: ChannelContext,
    stream: ChannelStream<PlatformInboundInstruction>,
    heartbeat: Arc<HeartbeatChannel>,
    heartbeat_settings: Option<(Duration, Duration)>,
    processors: EventProcessorCollection,
    processor_update_frequency: Duration,
    info_scheduled: bool,
    connected: bool,
}

impl ControlState {
    async fn open(&mut self, actor: &ActorRef<ControlMessage>) -> Result<(), ConnectorError> {
        let transport = self.ctx.transport.require()?;
        self.connected = false;
        heartbeat_outcome(self.heartbeat.pause(), "pause");

        let generation = self.stream.open(
            actor,
            move |outbound| async move { transport.open_control_stream(outbound).await },
            ControlMessage::Stream,
        );
        tracing::debug!(generation, "opening control stream");

        let register = PlatformInboundInstruction {
            request: Some(platform_inbound_instruction::Request::Register(
                self.ctx.identity.to_identification(),
            )),
            instruction_id: self.ctx.ids.next_id(),
        };
        // A failed write surfaces as a closed stream of this generation.
        self.write(register).await;
        Ok(())
    }

    async fn on_stream(&mut self, event: StreamEvent<PlatformOutboundInstruction>, actor: &ActorRef<ControlMessage>) {
        match event {
            StreamEvent::Opened => {
                self.stream.opened();
                self.connected = true;
                if let Some((interval, timeout)) = self.heartbeat_settings {
                    heartbeat_outcome(self.heartbeat.enable(interval, timeout), "enable");
                }
                tracing::info!(client = %self.ctx.client_id(), "control channel connected");
                self.report_all(actor);
            }
            StreamEvent::Received(instruction) => self.handle(instruction, actor).await,
            StreamEvent::Closed(error) => {
                self.connected = false;
                heartbeat_outcome(self.heartbeat.pause(), "pause");
                match error {
                    Some(error) if !error.is_connectivity() => {
                        let due = self.stream.failed();
                        tracing::error!(
                            error = %error,
                            due_ms = millis(due),
                            "control stream failed, reopening"
                        );
                        self.schedule_reopen(due, actor);
                    }
                    error => {
                        self.stream.close();
                        match &error {
                            Some(error) => tracing::warn!(error = %error, "control stream lost"),
                            None => tracing::info!("control stream completed by the server"),
                        }
                        self.ctx.notifier.reconnect("control stream closed");
                    }
                }
            }
        }
    }

    fn schedule_reopen(&self, due: Duration, actor: &ActorRef<ControlMessage>) {
        let reopen = ControlMessage::Reopen {
            generation: self.stream.generation(),
        };
        if let Err(err) = actor.schedule(reopen, due) {
            tracing::debug!(error = %err, "control stream will not be reopened");
        }
    }

    fn schedule_info(&mut self, actor: &ActorRef<ControlMessage>) {
        if self.info_scheduled || self.processors.is_empty() {
            return;
        }
        match actor.schedule(ControlMessage::SendAllEventProcessorInfo, self.processor_update_frequency) {
            Ok(_) => self.info_scheduled = true,
            Err(err) => tracing::debug!(error = %err, "could not schedule event processor info"),
        }
    }

    fn report_all(&self, actor: &ActorRef<ControlMessage>) {
        for (name, supplier) in self.processors.suppliers() {
            report(name, supplier, actor.clone());
        }
    }

    fn report_one(&self, processor: &str, actor: &ActorRef<ControlMessage>) {
        let supplier = EventProcessorName::new(processor)
            .ok()
            .and_then(|name| self.processors.supplier(&name).map(|supplier| (name, supplier)));
        match supplier {
            Some((name, supplier)) => report(name, supplier, actor.clone()),
            None => tracing::debug!(processor, "info requested for an unknown event processor"),
        }
    }

    fn execute(
        &self,
        instruction_id: String,
        processor: String,
        instruction: ProcessorInstruction,
        actor: &ActorRef<ControlMessage>,
    ) {
        let handler = EventProcessorName::new(processor.as_str())
            .ok()
            .and_then(|name| self.processors.handler(&name));
        let client = self.ctx.client_id().to_string();
        let actor = actor.clone();
        tokio::spawn(async move {
            let error = match handler {
                Some(handler) => {
                    let outcome = AssertUnwindSafe(instruction.run(handler.as_ref()))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(true)) => None,
                        Ok(Ok(false)) => Some(execution_error(
                            format!("Unable to {} of {processor}", instruction.label()),
                            &client,
                        )),
                        Ok(Err(err)) => {
                            Some(err.to_error_message(ErrorCategory::InstructionExecutionError, &client))
                        }
                        Err(_) => {
                            tracing::error!(processor = %processor, "event processor instruction panicked");
                            Some(execution_error(
                                format!("{} of {processor} panicked", instruction.label()),
                                &client,
                            ))
                        }
                    }
                }
                None => Some(execution_error("Unknown processor".to_string(), &client)),
            };
            if let Some(error) = &error {
                tracing::warn!(
                    processor = %processor,
                    instruction = instruction.label(),
                    error = %error.message,
                    "event processor instruction failed"
                );
            }
            let result = InstructionResult {
                instruction_id,
                success: error.is_none(),
                error,
            };
            if let Err(err) = actor.tell(ControlMessage::Send(PlatformInboundInstruction::result(result))) {
                tracing::debug!(error = %err, "dropping event processor instruction result");
            }
        });
    }

    async fn handle(&mut self, instruction: PlatformOutboundInstruction, actor: &ActorRef<ControlMessage>) {
        use platform_outbound_instruction::Request;

        let instruction_id = instruction.instruction_id;
        match instruction.request {
            Some(Request::Heartbeat(_)) => {
                heartbeat_outcome(self.heartbeat.receive_server_heartbeat(), "record server heartbeat");
                self.write(PlatformInboundInstruction {
                    request: Some(platform_inbound_instruction::Request::Heartbeat(Heartbeat {})),
                    instruction_id: String::new(),
                })
                .await;
                self.acknowledge(&instruction_id, None).await;
            }
            Some(Request::Ack(ack)) => {
                heartbeat_outcome(self.heartbeat.receive_acknowledgement(ack), "record acknowledgement");
            }
            Some(Request::RequestReconnect(_)) => {
                self.acknowledge(&instruction_id, None).await;
                tracing::info!("server requested a reconnect");
                self.ctx.notifier.reconnect("server requested a reconnect");
            }
            Some(Request::NodeNotification(node)) => {
                tracing::info!(node = %node.node_name, host = %node.host_name, "node notification");
                self.acknowledge(&instruction_id, None).await;
            }
            Some(Request::PauseEventProcessor(reference)) => {
                self.execute(instruction_id, reference.processor_name, ProcessorInstruction::Pause, actor);
            }
            Some(Request::StartEventProcessor(reference)) => {
                self.execute(instruction_id, reference.processor_name, ProcessorInstruction::Start, actor);
            }
            Some(Request::ReleaseSegment(reference)) => {
                let segment = SegmentId::new(reference.segment_identifier);
                self.execute(instruction_id, reference.processor_name, ProcessorInstruction::Release(segment), actor);
            }
            Some(Request::SplitEventProcessorSegment(reference)) => {
                let segment = SegmentId::new(reference.segment_identifier);
                self.execute(instruction_id, reference.processor_name, ProcessorInstruction::Split(segment), actor);
            }
            Some(Request::MergeEventProcessorSegment(reference)) => {
                let segment = SegmentId::new(reference.segment_identifier);
                self.execute(instruction_id, reference.processor_name, ProcessorInstruction::Merge(segment), actor);
            }
            Some(Request::RequestEventProcessorInfo(reference)) => {
                self.report_one(&reference.processor_name, actor);
            }
            None => {
                let error = ErrorMessage {
                    message: "Unsupported instruction".to_string(),
                    location: self.ctx.client_id().to_string(),
                    details: Vec::new(),
                    error_code: ErrorCategory::UnsupportedInstruction.code().to_string(),
                };
                self.acknowledge(&instruction_id, Some(error)).await;
            }
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
        self.write(PlatformInboundInstruction::ack(ack)).await;
    }

    async fn write(&self, instruction: PlatformInboundInstruction) {
        if let Err(err) = self.stream.send(instruction).await {
            tracing::debug!(error = %err, "could not write to control stream");
        }
    }

    async fn send(&mut self, instruction: PlatformInboundInstruction, actor: &ActorRef<ControlMessage>) {
        if !self.stream.is_open() {
            tracing::debug!("dropping instruction, control stream is not open");
            return;
        }
        if let Err(err) = self.stream.send(instruction).await {
            self.connected = false;
            let due = self.stream.failed();
            tracing::warn!(
                error = %err,
                due_ms = millis(due),
                "unable to send instruction, reopening control stream"
            );
            self.schedule_reopen(due, actor);
        }
    }
}

fn execution_error(message: String, location: &str) -> ErrorMessage {
    ErrorMessage {
        message,
        location: location.to_string(),
        details: Vec::new(),
        error_code: ErrorCategory::InstructionExecutionError.code().to_string(),
    }
}

fn report(name: EventProcessorName, supplier: Arc<dyn EventProcessorInfoSupplier>, actor: ActorRef<ControlMessage>) {
    tokio::spawn(async move {
        match supplier.info().await {
            Ok(Some(info)) => {
                let instruction = PlatformInboundInstruction::event_processor_info(info);
                if let Err(err) = actor.tell(ControlMessage::Send(instruction)) {
                    tracing::debug!(processor = %name, error = %err, "dropping event processor info");
                }
            }
            Ok(None) => tracing::warn!(processor = %name, "not sending processor info, none available"),
            Err(err) => tracing::error!(processor = %name, error = %err, "unable to obtain processor info"),
        }
    });
}

fn heartbeat_outcome(outcome: Result<(), ConnectorError>, action: &str) {
    if let Err(err) = outcome {
        tracing::debug!(error = %err, action, "heartbeat monitor unavailable");
    }
}

#[async_trait]
impl Receive<ControlMessage> for ControlState {
    type Snapshot = ChannelStatus;

    async fn receive(
        &mut self,
        message: ControlMessage,
        actor: &ActorRef<ControlMessage>,
    ) -> Result<(), ConnectorError> {
        match message {
            ControlMessage::Connect => {
                if !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            ControlMessage::Reopen { generation } => {
                if self.stream.generation() == generation && !self.stream.is_open() {
                    self.open(actor).await?;
                }
            }
            ControlMessage::Disconnect => {
                self.stream.close();
                self.connected = false;
                heartbeat_outcome(self.heartbeat.pause(), "pause");
            }
            ControlMessage::Stream(generation, event) => {
                if !self.stream.is_current(generation) {
                    tracing::debug!(generation, "ignoring event of a retired control stream");
                    return Ok(());
                }
                self.on_stream(event, actor).await;
            }
            ControlMessage::Send(instruction) => self.send(instruction, actor).await,
            ControlMessage::EnableHeartbeat { interval, timeout } => {
                self.heartbeat_settings = Some((interval, timeout));
                if self.connected {
                    heartbeat_outcome(self.heartbeat.enable(interval, timeout), "enable");
                }
            }
            ControlMessage::DisableHeartbeat => {
                self.heartbeat_settings = None;
                heartbeat_outcome(self.heartbeat.disable(), "disable");
            }
            ControlMessage::RegisterEventProcessor {
                name,
                registration,
                supplier,
                handler,
                completion,
            } => {
                if let Some(previous) =
                    self.processors
                        .register(name.clone(), registration, supplier.clone(), handler)
                {
                    tracing::debug!(processor = %name, previous = %previous, "event processor replaced");
                }
                if self.connected {
                    report(name, supplier, actor.clone());
                }
                self.schedule_info(actor);
                completion.try_signal_success();
            }
            ControlMessage::UnregisterEventProcessor {
                name,
                registration,
                completion,
            } => {
                if !self.processors.unregister(&name, &registration) {
                    tracing::debug!(processor = %name, "event processor was already replaced or removed");
                }
                completion.try_signal_success();
            }
            ControlMessage::SendAllEventProcessorInfo => {
                self.info_scheduled = false;
                if self.connected {
                    self.report_all(actor);
                }
                self.schedule_info(actor);
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
        self.heartbeat.dispose().await;
    }
}

/// A local event processor known to the control channel.
pub struct EventProcessorRegistration {
    name: EventProcessorName,
    registration: RegistrationId,
    completion: Completion,
    actor: ActorRef<ControlMessage>,
}

impl fmt::Debug for EventProcessorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventProcessorRegistration")
            .field("name", &self.name)
            .field("registration", &self.registration)
            .finish()
    }
}

impl EventProcessorRegistration {
    pub fn name(&self) -> &EventProcessorName {
        &self.name
    }

    /// Resolves once the control channel knows the processor.
    pub async fn wait_until_completed(&self) -> Result<(), ConnectorError> {
        self.completion.wait().await
    }

    /// Stop reporting this processor and stop routing instructions to it.
    pub async fn dispose(self) -> Result<(), ConnectorError> {
        let source = CountdownCompletionSource::new(1)?;
        let done = source.completion();
        self.actor.tell(ControlMessage::UnregisterEventProcessor {
            name: self.name,
            registration: self.registration,
            completion: source,
        })?;
        done.wait().await
    }
}

/// Control channel handle. Owned by its connection.
pub struct ControlChannel {
    actor: AxonActor<ControlMessage, ControlState>,
    heartbeat: Arc<HeartbeatChannel>,
    ids: IdGenerator,
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("status", &self.actor.state())
            .field("heartbeat", &self.heartbeat.state())
            .finish()
    }
}

impl ControlChannel {
    pub(crate) fn new(
        ctx: ChannelContext,
        heartbeat: Option<(Duration, Duration)>,
        processor_update_frequency: Duration,
    ) -> Self {
        let mailbox = Mailbox::new("control", ctx.scheduler.clone());
        let control = mailbox.actor_ref();
        let notifier = ctx.notifier.clone();
        let heartbeat_channel = Arc::new(HeartbeatChannel::new(
            ctx.scheduler.clone(),
            ctx.ids.clone(),
            Arc::new(move |instruction: PlatformInboundInstruction| {
                control.tell(ControlMessage::Send(instruction))
            }),
            Arc::new(move || notifier.reconnect("heartbeat missed")),
        ));

        let ids = ctx.ids.clone();
        let state = ControlState {
            stream: ChannelStream::new(ctx.backoff),
            heartbeat: heartbeat_channel.clone(),
            heartbeat_settings: heartbeat,
            processors: EventProcessorCollection::new(),
            processor_update_frequency,
            info_scheduled: false,
            connected: false,
            ctx,
        };
        Self {
            ids,
            actor: AxonActor::start(mailbox, state),
            heartbeat: heartbeat_channel,
        }
    }

    pub(crate) fn connect(&self) -> Result<(), ConnectorError> {
        self.actor.tell(ControlMessage::Connect)
    }

    pub(crate) fn disconnect(&self) -> Result<(), ConnectorError> {
        self.actor.tell(ControlMessage::Disconnect)
    }

    /// Write an instruction to the server. Dropped while the stream is down.
    pub fn send_instruction(&self, instruction: PlatformInboundInstruction) -> Result<(), ConnectorError> {
        self.actor.tell(ControlMessage::Send(instruction))
    }

    /// Start heartbeats now if connected, and after every reconnect.
    pub fn enable_heartbeat(&self, interval: Duration, timeout: Duration) -> Result<(), ConnectorError> {
        self.actor
            .tell(ControlMessage::EnableHeartbeat { interval, timeout })
    }

    /// Announce a local event processor. Its status is reported right away when
    /// connected, then periodically, and the server may send it instructions.
    pub fn register_event_processor(
        &self,
        name: EventProcessorName,
        supplier: Arc<dyn EventProcessorInfoSupplier>,
        handler: Arc<dyn EventProcessorInstructionHandler>,
    ) -> Result<EventProcessorRegistration, ConnectorError> {
        let registration = self.ids.registration_id();
        let source = CountdownCompletionSource::new(1)?;
        let completion = source.completion();
        self.actor.tell(ControlMessage::RegisterEventProcessor {
            name: name.clone(),
            registration: registration.clone(),
            supplier,
            handler,
            completion: source,
        })?;
        Ok(EventProcessorRegistration {
            name,
            registration,
            completion,
            actor: self.actor.actor_ref(),
        })
    }

    pub fn disable_heartbeat(&self) -> Result<(), ConnectorError> {
        self.actor.tell(ControlMessage::DisableHeartbeat)
    }

    pub fn pause_heartbeat(&self) -> Result<(), ConnectorError> {
        self.heartbeat.pause()
    }

    pub fn resume_heartbeat(&self) -> Result<(), ConnectorError> {
        self.heartbeat.resume()
    }

    pub fn heartbeat_state(&self) -> HeartbeatState {
        self.heartbeat.state()
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
