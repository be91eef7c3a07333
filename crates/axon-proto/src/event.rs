// ABOUTME: Event store and event scheduler messages.
// ABOUTME: Covers tracking-token streams, aggregate histories, snapshots, ad-hoc queries and scheduling.

use std::collections::HashMap;

use crate::common::{MetaDataValue, SerializedObject};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    #[prost(string, tag = "2")]
    pub aggregate_identifier: String,
    #[prost(int64, tag = "3")]
    pub aggregate_sequence_number: i64,
    #[prost(string, tag = "4")]
    pub aggregate_type: String,
    #[prost(int64, tag = "5")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "6")]
    pub payload: Option<SerializedObject>,
    #[prost(map = "string, message", tag = "7")]
    pub meta_data: HashMap<String, MetaDataValue>,
    #[prost(bool, tag = "8")]
    pub snapshot: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventWithToken {
    #[prost(int64, tag = "1")]
    pub token: i64,
    #[prost(message, optional, tag = "2")]
    pub event: Option<Event>,
}

/// Opens an event stream or grants it more permits.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetEventsRequest {
    #[prost(int64, tag = "1")]
    pub tracking_token: i64,
    #[prost(int64, tag = "2")]
    pub number_of_permits: i64,
    #[prost(string, tag = "3")]
    pub client_id: String,
    #[prost(string, tag = "4")]
    pub component_name: String,
    #[prost(string, tag = "5")]
    pub processor: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAggregateEventsRequest {
    #[prost(string, tag = "1")]
    pub aggregate_id: String,
    #[prost(int64, tag = "2")]
    pub initial_sequence: i64,
    #[prost(bool, tag = "3")]
    pub allow_snapshots: bool,
    #[prost(int64, tag = "4")]
    pub max_sequence: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Confirmation {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAggregateSnapshotsRequest {
    #[prost(string, tag = "1")]
    pub aggregate_id: String,
    #[prost(int64, tag = "2")]
    pub initial_sequence: i64,
    #[prost(int64, tag = "3")]
    pub max_sequence: i64,
    #[prost(int32, tag = "4")]
    pub max_results: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadHighestSequenceNrRequest {
    #[prost(string, tag = "1")]
    pub aggregate_id: String,
    #[prost(int64, tag = "3")]
    pub from_sequence: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReadHighestSequenceNrResponse {
    /// `-1` when the aggregate has no events.
    #[prost(int64, tag = "1")]
    pub to_sequence_nr: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetFirstTokenRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetLastTokenRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetTokenAtRequest {
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub instant: i64,
}

/// Position in the event store, as the server reports it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrackingToken {
    #[prost(int64, tag = "1")]
    pub token: i64,
}

/// Opens an ad-hoc event query or grants it more permits.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryEventsRequest {
    #[prost(string, tag = "1")]
    pub query: String,
    #[prost(int64, tag = "2")]
    pub number_of_permits: i64,
    #[prost(bool, tag = "3")]
    pub live_events: bool,
    #[prost(bool, tag = "4")]
    pub force_read_from_leader: bool,
    #[prost(bool, tag = "5")]
    pub query_snapshots: bool,
    #[prost(string, tag = "6")]
    pub context_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryEventsResponse {
    #[prost(oneof = "query_events_response::Data", tags = "1, 2, 3")]
    pub data: Option<query_events_response::Data>,
}

pub mod query_events_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(message, tag = "1")]
        Columns(super::ColumnsResponse),
        #[prost(message, tag = "2")]
        Row(super::RowResponse),
        #[prost(message, tag = "3")]
        FilesCompleted(super::Confirmation),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnsResponse {
    #[prost(string, repeated, tag = "1")]
    pub column: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowResponse {
    #[prost(message, repeated, tag = "1")]
    pub id_values: Vec<QueryValue>,
    #[prost(message, repeated, tag = "2")]
    pub sort_values: Vec<QueryValue>,
    #[prost(map = "string, message", tag = "3")]
    pub values: HashMap<String, QueryValue>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryValue {
    #[prost(oneof = "query_value::Data", tags = "1, 2, 3, 4")]
    pub data: Option<query_value::Data>,
}

pub mod query_value {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Data {
        #[prost(string, tag = "1")]
        TextValue(String),
        #[prost(sint64, tag = "2")]
        NumberValue(i64),
        #[prost(bool, tag = "3")]
        BooleanValue(bool),
        #[prost(double, tag = "4")]
        DoubleValue(f64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleEventRequest {
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub instant: i64,
    #[prost(message, optional, tag = "2")]
    pub event: Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RescheduleEventRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(int64, tag = "2")]
    pub instant: i64,
    #[prost(message, optional, tag = "3")]
    pub event: Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelScheduledEventRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

/// Handle for a scheduled event, used to cancel or reschedule it.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScheduleToken {
    #[prost(string, tag = "1")]
    pub token: String,
}
