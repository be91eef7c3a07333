// ABOUTME: Event channel: appends events and snapshots, reads and queries the event store, schedules events.
// ABOUTME: Open event streams and live queries end with `Cancelled` when the connection reconnects.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axon_grpc::{EventStoreCall, EventStoreReply, InboundStream, OutboundStream, StreamSender, DEFAULT_CHANNEL_BUFFER};
use axon_proto::event::{
    query_events_response, query_value, CancelScheduledEventRequest, Confirmation, Event,
    EventWithToken, GetAggregateEventsRequest, GetAggregateSnapshotsRequest, GetEventsRequest,
    GetTokenAtRequest, QueryEventsRequest, QueryEventsResponse, QueryValue,
    ReadHighestSequenceNrRequest, RescheduleEventRequest, RowResponse, ScheduleEventRequest,
};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tonic::Status;

use crate::cancellation::CooperativeCancellation;
use crate::channel::ChannelContext;
use crate::error::ConnectorError;
use crate::ids::{AggregateId, ScheduledEventToken};
use crate::permits::{FlowController, PermitCount};

const QUERY_INITIAL_PERMITS: i64 = 100;
const QUERY_REFILL_PERMITS: i64 = 25;

/// Position in the event store: the token of the last event consumed.
///
/// A stream opened at a token starts with the event after it, so tokens
/// returned by the token lookups can be handed straight to
/// [`EventChannel::open_stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventStreamToken(i64);

impl EventStreamToken {
    /// Before the first event of the store.
    pub const NONE: EventStreamToken = EventStreamToken(-1);

    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    // The server reports the position the next read starts at.
    fn from_server(token: i64) -> Self {
        Self(token.max(0) - 1)
    }

    fn next(self) -> i64 {
        self.0.saturating_add(1)
    }
}

/// One value of an ad-hoc event query row.
#[derive(Debug, Clone, PartialEq)]
pub enum EventQueryValue {
    Text(String),
    Number(i64),
    Boolean(bool),
    Double(f64),
}

impl EventQueryValue {
    fn from_wire(value: &QueryValue) -> Option<Self> {
        match value.data.as_ref()? {
            query_value::Data::TextValue(text) => Some(EventQueryValue::Text(text.clone())),
            query_value::Data::NumberValue(number) => Some(EventQueryValue::Number(*number)),
            query_value::Data::BooleanValue(flag) => Some(EventQueryValue::Boolean(*flag)),
            query_value::Data::DoubleValue(double) => Some(EventQueryValue::Double(*double)),
        }
    }
}

/// A row of an ad-hoc event query, read against the columns the server announced last.
#[derive(Debug, Clone, PartialEq)]
pub struct EventQueryResultEntry {
    columns: Arc<[String]>,
    row: RowResponse,
}

impl EventQueryResultEntry {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn identifiers(&self) -> Vec<Option<EventQueryValue>> {
        self.row.id_values.iter().map(EventQueryValue::from_wire).collect()
    }

    pub fn sort_values(&self) -> Vec<Option<EventQueryValue>> {
        self.row.sort_values.iter().map(EventQueryValue::from_wire).collect()
    }

    /// Value of `column`, `None` when the row has no value for it.
    pub fn value(&self, column: &str) -> Option<EventQueryValue> {
        self.row.values.get(column).and_then(EventQueryValue::from_wire)
    }
}

struct EventReader {
    inbound: InboundStream<EventWithToken>,
    sender: StreamSender<GetEventsRequest>,
    request: GetEventsRequest,
    flow: FlowController,
}

impl EventReader {
    async fn next(mut self) -> Option<(Result<EventWithToken, ConnectorError>, Option<Self>)> {
        match self.inbound.next().await? {
            Ok(event) => {
                if self.flow.increment() {
                    let refill = GetEventsRequest {
                        number_of_permits: self.flow.threshold().value(),
                        ..self.request.clone()
                    };
                    if let Err(err) = self.sender.send(refill).await {
                        tracing::debug!(error = %err, "could not request more events");
                    }
                }
                Some((Ok(event), Some(self)))
            }
            Err(status) => {
                tracing::warn!(status = %status, "event stream failed");
                Some((Err(ConnectorError::from(status)), None))
            }
        }
    }
}

struct EventQueryReader {
    inbound: InboundStream<QueryEventsResponse>,
    sender: StreamSender<QueryEventsRequest>,
    flow: FlowController,
    columns: Arc<[String]>,
}

impl EventQueryReader {
    async fn next(mut self) -> Option<(Result<EventQueryResultEntry, ConnectorError>, Option<Self>)> {
        loop {
            let response = match self.inbound.next().await? {
                Ok(response) => response,
                Err(status) => {
                    tracing::warn!(status = %status, "event query failed");
                    return Some((Err(ConnectorError::from(status)), None));
                }
            };
            // Every message the server sends uses up a permit, rows or not.
            if self.flow.increment() {
                let refill = QueryEventsRequest {
                    number_of_permits: self.flow.threshold().value(),
                    ..Default::default()
                };
                if let Err(err) = self.sender.send(refill).await {
                    tracing::debug!(error = %err, "could not request more query results");
                }
            }
            match response.data {
                Some(query_events_response::Data::Columns(columns)) => {
                    self.columns = columns.column.into();
                }
                Some(query_events_response::Data::Row(row)) => {
                    let entry = EventQueryResultEntry {
                        columns: self.columns.clone(),
                        row,
                    };
                    return Some((Ok(entry), Some(self)));
                }
                Some(query_events_response::Data::FilesCompleted(_)) | None => {}
            }
        }
    }
}

fn epoch_millis(at: SystemTime) -> Result<i64, ConnectorError> {
    let since_epoch = at.duration_since(UNIX_EPOCH).map_err(|_| {
        ConnectorError::InvalidArgument("schedule time lies before the Unix epoch".to_string())
    })?;
    i64::try_from(since_epoch.as_millis())
        .map_err(|_| ConnectorError::InvalidArgument("schedule time is out of range".to_string()))
}

fn after(delay: Duration) -> Result<SystemTime, ConnectorError> {
    SystemTime::now()
        .checked_add(delay)
        .ok_or_else(|| ConnectorError::InvalidArgument("schedule delay is out of range".to_string()))
}

fn unexpected(name: &str, reply: &EventStoreReply) -> ConnectorError {
    ConnectorError::Status(Status::internal(format!(
        "unexpected reply to {name}: {reply:?}"
    )))
}

/// Event store access for one connection.
#[derive(Debug)]
pub struct EventChannel {
    ctx: ChannelContext,
    cancellation: CooperativeCancellation,
}

impl EventChannel {
    pub(crate) fn new(ctx: ChannelContext) -> Self {
        Self {
            ctx,
            cancellation: CooperativeCancellation::new(),
        }
    }

    fn with_identifier(&self, mut event: Event) -> Event {
        if event.message_identifier.is_empty() {
            event.message_identifier = self.ctx.ids.next_id();
        }
        event
    }

    async fn call(&self, call: EventStoreCall) -> Result<EventStoreReply, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let name = call.name();
        transport.event_store(call).await.map_err(|status| {
            tracing::debug!(call = name, status = %status, "event store call rejected");
            ConnectorError::Status(status)
        })
    }

    async fn token(&self, call: EventStoreCall) -> Result<EventStreamToken, ConnectorError> {
        let name = call.name();
        match self.call(call).await? {
            EventStoreReply::Token(token) => Ok(EventStreamToken::from_server(token.token)),
            other => Err(unexpected(name, &other)),
        }
    }

    async fn scheduled(&self, call: EventStoreCall) -> Result<ScheduledEventToken, ConnectorError> {
        let name = call.name();
        match self.call(call).await? {
            EventStoreReply::Scheduled(token) => ScheduledEventToken::new(token.token),
            other => Err(unexpected(name, &other)),
        }
    }

    pub async fn append_events(
        &self,
        events: impl IntoIterator<Item = Event>,
    ) -> Result<Confirmation, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let events: Vec<Event> = events
            .into_iter()
            .map(|event| self.with_identifier(event))
            .collect();
        let count = events.len();
        let confirmation = transport.append_events(events).await?;
        tracing::debug!(count, success = confirmation.success, "appended events");
        Ok(confirmation)
    }

    /// Store a snapshot of an aggregate. The event is marked as a snapshot.
    pub async fn append_snapshot(&self, snapshot: Event) -> Result<Confirmation, ConnectorError> {
        let snapshot = Event {
            snapshot: true,
            ..self.with_identifier(snapshot)
        };
        let aggregate = snapshot.aggregate_identifier.clone();
        match self.call(EventStoreCall::AppendSnapshot(snapshot)).await? {
            EventStoreReply::Confirmation(confirmation) => {
                tracing::debug!(aggregate = %aggregate, success = confirmation.success, "appended snapshot");
                Ok(confirmation)
            }
            other => Err(unexpected("AppendSnapshot", &other)),
        }
    }

    /// Read events after `token`.
    ///
    /// The server is granted `buffer_size` events up front and `refill` more
    /// each time that many were consumed.
    pub async fn open_stream(
        &self,
        token: EventStreamToken,
        buffer_size: PermitCount,
        refill: PermitCount,
    ) -> Result<BoxStream<'static, Result<EventWithToken, ConnectorError>>, ConnectorError> {
        // Fail before dialing when the channel is already disposed.
        self.cancellation.token()?;
        let transport = self.ctx.transport.require()?;
        let request = GetEventsRequest {
            tracking_token: token.next(),
            number_of_permits: buffer_size.value(),
            client_id: self.ctx.client_id().to_string(),
            component_name: self.ctx.component_name().to_string(),
            processor: String::new(),
        };

        let OutboundStream { sender, stream } = OutboundStream::new(DEFAULT_CHANNEL_BUFFER);
        sender.send(request.clone()).await?;
        let inbound = transport.list_events(stream).await?;
        tracing::debug!(token = token.value(), permits = buffer_size.value(), "opened event stream");

        let reader = EventReader {
            inbound,
            sender,
            request,
            flow: FlowController::new(buffer_size, refill),
        };
        let events = stream::unfold(Some(reader), |reader| async move { reader?.next().await });
        self.cancellation.open_stream(events)
    }

    /// Events of one aggregate, in sequence order.
    pub async fn load_aggregate_events(
        &self,
        aggregate_id: &AggregateId,
        allow_snapshots: bool,
    ) -> Result<BoxStream<'static, Result<Event, ConnectorError>>, ConnectorError> {
        self.aggregate_events(GetAggregateEventsRequest {
            aggregate_id: aggregate_id.to_string(),
            allow_snapshots,
            ..Default::default()
        })
        .await
    }

    /// Events of one aggregate from sequence `from` on, up to and including `to` when given.
    pub async fn load_aggregate_events_between(
        &self,
        aggregate_id: &AggregateId,
        from: i64,
        to: Option<i64>,
    ) -> Result<BoxStream<'static, Result<Event, ConnectorError>>, ConnectorError> {
        self.aggregate_events(GetAggregateEventsRequest {
            aggregate_id: aggregate_id.to_string(),
            initial_sequence: from,
            allow_snapshots: false,
            max_sequence: to.unwrap_or(0),
        })
        .await
    }

    async fn aggregate_events(
        &self,
        request: GetAggregateEventsRequest,
    ) -> Result<BoxStream<'static, Result<Event, ConnectorError>>, ConnectorError> {
        let transport = self.ctx.transport.require()?;
        let events = transport.list_aggregate_events(request).await?;
        Ok(events.map(|event| event.map_err(ConnectorError::from)).boxed())
    }

    /// The newest snapshots of one aggregate, at most `max_results` of them.
    pub async fn load_snapshots(
        &self,
        aggregate_id: &AggregateId,
        from: i64,
        to: Option<i64>,
        max_results: i32,
    ) -> Result<BoxStream<'static, Result<Event, ConnectorError>>, ConnectorError> {
        if max_results < 1 {
            return Err(ConnectorError::InvalidArgument(
                "max_results must be at least 1".to_string(),
            ));
        }
        let transport = self.ctx.transport.require()?;
        let request = GetAggregateSnapshotsRequest {
            aggregate_id: aggregate_id.to_string(),
            initial_sequence: from,
            max_sequence: to.unwrap_or(0),
            max_results,
        };
        let snapshots = transport.list_aggregate_snapshots(request).await?;
        Ok(snapshots.map(|snapshot| snapshot.map_err(ConnectorError::from)).boxed())
    }

    /// Highest sequence number stored for an aggregate, `-1` when it has no events.
    pub async fn find_highest_sequence(&self, aggregate_id: &AggregateId) -> Result<i64, ConnectorError> {
        let request = ReadHighestSequenceNrRequest {
            aggregate_id: aggregate_id.to_string(),
            from_sequence: 0,
        };
        match self.call(EventStoreCall::ReadHighestSequenceNr(request)).await? {
            EventStoreReply::HighestSequence(response) => Ok(response.to_sequence_nr),
            other => Err(unexpected("ReadHighestSequenceNr", &other)),
        }
    }

    pub async fn get_first_token(&self) -> Result<EventStreamToken, ConnectorError> {
        self.token(EventStoreCall::GetFirstToken).await
    }

    pub async fn get_last_token(&self) -> Result<EventStreamToken, ConnectorError> {
        self.token(EventStoreCall::GetLastToken).await
    }

    /// Token of the first event stored at or after `instant`.
    pub async fn get_token_at(&self, instant: SystemTime) -> Result<EventStreamToken, ConnectorError> {
        let request = GetTokenAtRequest {
            instant: epoch_millis(instant)?,
        };
        self.token(EventStoreCall::GetTokenAt(request)).await
    }

    /// Have the server publish `event` at `at`.
    pub async fn schedule_event(&self, at: SystemTime, event: Event) -> Result<ScheduledEventToken, ConnectorError> {
        let request = ScheduleEventRequest {
            instant: epoch_millis(at)?,
            event: Some(self.with_identifier(event)),
        };
        self.scheduled(EventStoreCall::ScheduleEvent(request)).await
    }

    pub async fn schedule_event_after(
        &self,
        delay: Duration,
        event: Event,
    ) -> Result<ScheduledEventToken, ConnectorError> {
        self.schedule_event(after(delay)?, event).await
    }

    /// Replace a scheduled event. The server hands out a new token.
    pub async fn reschedule(
        &self,
        token: &ScheduledEventToken,
        at: SystemTime,
        event: Event,
    ) -> Result<ScheduledEventToken, ConnectorError> {
        let request = RescheduleEventRequest {
            token: token.to_string(),
            instant: epoch_millis(at)?,
            event: Some(self.with_identifier(event)),
        };
        self.scheduled(EventStoreCall::RescheduleEvent(request)).await
    }

    pub async fn reschedule_after(
        &self,
        token: &ScheduledEventToken,
        delay: Duration,
        event: Event,
    ) -> Result<ScheduledEventToken, ConnectorError> {
        self.reschedule(token, after(delay)?, event).await
    }

    /// Cancel a scheduled event. A negative acknowledgement becomes an error.
    pub async fn cancel_schedule(&self, token: &ScheduledEventToken) -> Result<(), ConnectorError> {
        let request = CancelScheduledEventRequest {
            token: token.to_string(),
        };
        match self.call(EventStoreCall::CancelScheduledEvent(request)).await? {
            EventStoreReply::Ack(ack) if ack.success => Ok(()),
            EventStoreReply::Ack(ack) => Err(ConnectorError::from_ack(&ack, self.ctx.client_id())),
            other => Err(unexpected("CancelScheduledEvent", &other)),
        }
    }

    /// Run an ad-hoc query over the events. A live query keeps streaming new matches.
    pub async fn query_events(
        &self,
        query: impl Into<String>,
        live: bool,
    ) -> Result<BoxStream<'static, Result<EventQueryResultEntry, ConnectorError>>, ConnectorError> {
        self.open_query(query.into(), live, false).await
    }

    /// Like [`query_events`](Self::query_events), over the stored snapshots.
    pub async fn query_snapshot_events(
        &self,
        query: impl Into<String>,
        live: bool,
    ) -> Result<BoxStream<'static, Result<EventQueryResultEntry, ConnectorError>>, ConnectorError> {
        self.open_query(query.into(), live, true).await
    }

    async fn open_query(
        &self,
        query: String,
        live_events: bool,
        query_snapshots: bool,
    ) -> Result<BoxStream<'static, Result<EventQueryResultEntry, ConnectorError>>, ConnectorError> {
        self.cancellation.token()?;
        let transport = self.ctx.transport.require()?;
        let initial = PermitCount::new(QUERY_INITIAL_PERMITS)?;
        let refill = PermitCount::new(QUERY_REFILL_PERMITS)?;
        let request = QueryEventsRequest {
            query,
            number_of_permits: initial.value(),
            live_events,
            force_read_from_leader: false,
            query_snapshots,
            context_name: self.ctx.context.to_string(),
        };

        let OutboundStream { sender, stream } = OutboundStream::new(DEFAULT_CHANNEL_BUFFER);
        sender.send(request).await?;
        let inbound = transport.query_events(stream).await?;
        tracing::debug!(live_events, query_snapshots, "opened event query");

        let reader = EventQueryReader {
            inbound,
            sender,
            flow: FlowController::new(initial, refill),
            columns: Arc::from(Vec::new()),
        };
        let entries = stream::unfold(Some(reader), |reader| async move { reader?.next().await });
        self.cancellation.open_stream(entries)
    }

    /// End every open stream. Streams opened afterwards use the new connection.
    pub(crate) fn reconnect(&self) {
        if let Err(err) = self.cancellation.reconnect() {
            tracing::debug!(error = %err, "event channel already disposed");
        }
    }

    pub(crate) fn dispose(&self) {
        self.cancellation.dispose();
    }
}
