// ABOUTME: Heartbeat liveness protocol over the control stream.
// ABOUTME: Sends heartbeat instructions on an interval and reports unacknowledged ones as missed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axon_proto::control::{platform_inbound_instruction, Heartbeat, PlatformInboundInstruction};
use axon_proto::InstructionAck;
use tokio::time::Instant;

use crate::actor::{ActorRef, AxonActor, Receive};
use crate::clock::millis;
use crate::error::{ConnectorError, ErrorCategory};
use crate::ids::{IdGenerator, InstructionId};
use crate::scheduler::Scheduler;

/// Writes a heartbeat instruction to the control stream.
pub type HeartbeatSink =
    Arc<dyn Fn(PlatformInboundInstruction) -> Result<(), ConnectorError> + Send + Sync>;

/// Invoked when a heartbeat was not acknowledged in time.
pub type OnHeartbeatMissed = Arc<dyn Fn() + Send + Sync>;

/// Published view of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Disabled,
    Enabled { interval: Duration, timeout: Duration },
    Paused { interval: Duration, timeout: Duration },
}

#[derive(Debug)]
pub enum HeartbeatMessage {
    Enable { interval: Duration, timeout: Duration },
    Disable,
    Pause,
    Resume,
    Beat { generation: u64 },
    Deadline { generation: u64, instruction_id: InstructionId },
    Ack(InstructionAck),
    ServerHeartbeat,
}

#[derive(Clone)]
enum Mode {
    Disabled,
    Enabled {
        interval: Duration,
        timeout: Duration,
        outstanding: HashMap<InstructionId, Instant>,
    },
    Paused {
        interval: Duration,
        timeout: Duration,
    },
}

#[derive(Clone)]
pub struct HeartbeatMonitor {
    mode: Mode,
    // Bumped on every state change, so timers of an older generation are ignored.
    generation: u64,
    ids: IdGenerator,
    sink: HeartbeatSink,
    on_missed: OnHeartbeatMissed,
}

impl HeartbeatMonitor {
    pub fn new(ids: IdGenerator, sink: HeartbeatSink, on_missed: OnHeartbeatMissed) -> Self {
        Self {
            mode: Mode::Disabled,
            generation: 0,
            ids,
            sink,
            on_missed,
        }
    }

    fn enable(
        &mut self,
        interval: Duration,
        timeout: Duration,
        actor: &ActorRef<HeartbeatMessage>,
    ) -> Result<(), ConnectorError> {
        self.generation += 1;
        self.mode = Mode::Enabled {
            interval,
            timeout,
            outstanding: HashMap::new(),
        };
        self.beat(self.generation, actor)
    }

    fn beat(
        &mut self,
        generation: u64,
        actor: &ActorRef<HeartbeatMessage>,
    ) -> Result<(), ConnectorError> {
        if generation != self.generation {
            return Ok(());
        }
        let Mode::Enabled {
            interval,
            timeout,
            outstanding,
        } = &mut self.mode
        else {
            return Ok(());
        };

        let instruction_id = self.ids.instruction_id();
        actor.schedule(HeartbeatMessage::Beat { generation }, *interval)?;
        actor.schedule(
            HeartbeatMessage::Deadline {
                generation,
                instruction_id: instruction_id.clone(),
            },
            *timeout,
        )?;
        outstanding.insert(instruction_id.clone(), actor.now());

        let instruction = PlatformInboundInstruction {
            request: Some(platform_inbound_instruction::Request::Heartbeat(Heartbeat {})),
            instruction_id: instruction_id.to_string(),
        };
        if let Err(err) = (self.sink)(instruction) {
            // The deadline still applies, an unsent heartbeat is never acknowledged.
            tracing::debug!(error = %err, "could not send heartbeat");
        }
        Ok(())
    }

    fn deadline(&mut self, generation: u64, instruction_id: &InstructionId) {
        if generation != self.generation {
            return;
        }
        if let Mode::Enabled {
            timeout,
            outstanding,
            ..
        } = &mut self.mode
        {
            if outstanding.remove(instruction_id).is_some() {
                tracing::warn!(
                    timeout_ms = millis(*timeout),
                    %instruction_id,
                    "did not receive heartbeat acknowledgement in time"
                );
                (self.on_missed)();
            }
        }
    }

    fn acknowledge(&mut self, ack: InstructionAck, now: Instant) {
        let Mode::Enabled {
            timeout,
            outstanding,
            ..
        } = &mut self.mode
        else {
            tracing::debug!("heartbeat acknowledgement received while not enabled");
            return;
        };
        let Ok(instruction_id) = InstructionId::new(ack.instruction_id) else {
            return;
        };

        let alive = ack.success
            || ack.error.as_ref().is_some_and(|error| {
                ErrorCategory::parse(&error.error_code) == ErrorCategory::UnsupportedInstruction
            });
        if !alive {
            if let Some(error) = &ack.error {
                tracing::error!(
                    error_code = %error.error_code,
                    message = %error.message,
                    location = %error.location,
                    "heartbeat acknowledgement reported a server error"
                );
            }
            return;
        }

        let Some(sent_at) = outstanding.remove(&instruction_id) else {
            tracing::debug!(%instruction_id, "ignoring late heartbeat acknowledgement");
            return;
        };
        if now.saturating_duration_since(sent_at) >= *timeout {
            tracing::warn!(%instruction_id, "heartbeat acknowledgement arrived too late");
            (self.on_missed)();
        }
    }
}

#[async_trait]
impl Receive<HeartbeatMessage> for HeartbeatMonitor {
    type Snapshot = HeartbeatState;

    async fn receive(
        &mut self,
        message: HeartbeatMessage,
        actor: &ActorRef<HeartbeatMessage>,
    ) -> Result<(), ConnectorError> {
        match message {
            HeartbeatMessage::Enable { interval, timeout } => {
                self.enable(interval, timeout, actor)?;
            }
            HeartbeatMessage::Disable => {
                self.generation += 1;
                self.mode = Mode::Disabled;
            }
            HeartbeatMessage::Pause => {
                if let Mode::Enabled {
                    interval, timeout, ..
                } = self.mode
                {
                    self.generation += 1;
                    self.mode = Mode::Paused { interval, timeout };
                }
            }
            HeartbeatMessage::Resume => {
                if let Mode::Paused { interval, timeout } = self.mode {
                    self.enable(interval, timeout, actor)?;
                }
            }
            HeartbeatMessage::Beat { generation } => self.beat(generation, actor)?,
            HeartbeatMessage::Deadline {
                generation,
                instruction_id,
            } => self.deadline(generation, &instruction_id),
            HeartbeatMessage::Ack(ack) => self.acknowledge(ack, actor.now()),
            HeartbeatMessage::ServerHeartbeat => {
                // The server reached us, so everything sent so far made it through.
                if let Mode::Enabled { outstanding, .. } = &mut self.mode {
                    outstanding.clear();
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> HeartbeatState {
        match self.mode {
            Mode::Disabled => HeartbeatState::Disabled,
            Mode::Enabled {
                interval, timeout, ..
            } => HeartbeatState::Enabled { interval, timeout },
            Mode::Paused { interval, timeout } => HeartbeatState::Paused { interval, timeout },
        }
    }
}

/// Heartbeat controls for the control channel.
pub struct HeartbeatChannel {
    actor: AxonActor<HeartbeatMessage, HeartbeatMonitor>,
}

impl fmt::Debug for HeartbeatChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeartbeatChannel")
            .field("state", &self.actor.state())
            .finish()
    }
}

impl HeartbeatChannel {
    pub fn new(
        scheduler: Scheduler,
        ids: IdGenerator,
        sink: HeartbeatSink,
        on_missed: OnHeartbeatMissed,
    ) -> Self {
        let monitor = HeartbeatMonitor::new(ids, sink, on_missed);
        Self {
            actor: AxonActor::spawn("heartbeat", monitor, scheduler),
        }
    }

    /// Start, or restart with new values. Sends one heartbeat immediately.
    pub fn enable(&self, interval: Duration, timeout: Duration) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::Enable { interval, timeout })
    }

    pub fn disable(&self) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::Disable)
    }

    pub fn pause(&self) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::Pause)
    }

    pub fn resume(&self) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::Resume)
    }

    pub fn receive_acknowledgement(&self, ack: InstructionAck) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::Ack(ack))
    }

    pub fn receive_server_heartbeat(&self) -> Result<(), ConnectorError> {
        self.actor.tell(HeartbeatMessage::ServerHeartbeat)
    }

    pub fn state(&self) -> HeartbeatState {
        self.actor.state()
    }

    pub async fn dispose(&self) {
        self.actor.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use axon_proto::ErrorMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Harness {
        channel: HeartbeatChannel,
        sent: mpsc::UnboundedReceiver<String>,
        missed: Arc<AtomicUsize>,
    }

    fn harness() -> Harness {
        let scheduler = Scheduler::new(Clock::system(), Duration::from_millis(10));
        let (tx, sent) = mpsc::unbounded_channel();
        let missed = Arc::new(AtomicUsize::new(0));
        let counter = missed.clone();
        let channel = HeartbeatChannel::new(
            scheduler,
            IdGenerator::sequential("hb"),
            Arc::new(move |instruction: PlatformInboundInstruction| {
                tx.send(instruction.instruction_id)
                    .map_err(|_| ConnectorError::NotConnected("closed".into()))
            }),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        Harness {
            channel,
            sent,
            missed,
        }
    }

    fn ack(instruction_id: &str) -> InstructionAck {
        InstructionAck {
            instruction_id: instruction_id.to_string(),
            success: true,
            error: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_disabled_and_sends_nothing() {
        let mut harness = harness();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(harness.channel.state(), HeartbeatState::Disabled);
        assert!(harness.sent.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_heartbeat_is_missed_after_timeout() {
        let harness = harness();
        let start = Instant::now();
        harness
            .channel
            .enable(Duration::from_millis(250), Duration::from_millis(500))
            .unwrap();

        while harness.missed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed <= Duration::from_millis(750));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_heartbeats_are_never_missed() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_millis(250), Duration::from_millis(500))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            tokio::select! {
                Some(id) = harness.sent.recv() => harness.channel.receive_acknowledgement(ack(&id)).unwrap(),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
        assert_eq!(harness.missed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_sends_immediately() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_secs(15))
            .unwrap();
        let first = tokio::time::timeout(Duration::from_millis(50), harness.sent.recv())
            .await
            .unwrap();
        assert_eq!(first.as_deref(), Some("hb-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_suppresses_sends_until_resume() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_millis(100), Duration::from_secs(60))
            .unwrap();
        harness.sent.recv().await.unwrap();
        harness.channel.pause().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        while harness.sent.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(harness.sent.try_recv().is_err());
        assert!(matches!(harness.channel.state(), HeartbeatState::Paused { .. }));

        harness.channel.resume().unwrap();
        tokio::time::timeout(Duration::from_millis(50), harness.sent.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(harness.channel.state(), HeartbeatState::Enabled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_and_resume_are_no_ops_when_not_applicable() {
        let harness = harness();
        harness.channel.pause().unwrap();
        harness.channel.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.channel.state(), HeartbeatState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_suppresses_missed_detection() {
        let harness = harness();
        harness
            .channel
            .enable(Duration::from_millis(100), Duration::from_millis(200))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.channel.disable().unwrap();
        harness.channel.disable().unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 0);
        assert_eq!(harness.channel.state(), HeartbeatState::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_acknowledgement_does_not_retrigger() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_millis(200))
            .unwrap();
        let id = harness.sent.recv().await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 1);

        harness.channel.receive_acknowledgement(ack(&id)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_instruction_counts_as_alive() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_millis(200))
            .unwrap();
        let id = harness.sent.recv().await.unwrap();
        harness
            .channel
            .receive_acknowledgement(InstructionAck {
                instruction_id: id,
                success: false,
                error: Some(ErrorMessage {
                    error_code: ErrorCategory::UnsupportedInstruction.code().to_string(),
                    ..Default::default()
                }),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_heartbeat_counts_as_alive() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_millis(200))
            .unwrap();
        harness.sent.recv().await.unwrap();
        harness.channel.receive_server_heartbeat().unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_re_enable_restarts_cleanly() {
        let mut harness = harness();
        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_millis(200))
            .unwrap();
        harness.sent.recv().await.unwrap();

        harness
            .channel
            .enable(Duration::from_secs(10), Duration::from_secs(5))
            .unwrap();
        let restarted = harness.sent.recv().await.unwrap();
        assert_eq!(restarted, "hb-2");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(harness.missed.load(Ordering::SeqCst), 0);
        assert_eq!(
            harness.channel.state(),
            HeartbeatState::Enabled {
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5)
            }
        );
    }
}
