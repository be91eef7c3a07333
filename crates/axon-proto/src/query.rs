// ABOUTME: Query service messages for point-to-point, streaming and subscription queries.
// ABOUTME: Includes the provider stream envelopes, flow control and cancellation.

use std::collections::HashMap;

use crate::common::{
    ErrorMessage, FlowControl, InstructionAck, MetaDataValue, ProcessingInstruction,
    SerializedObject,
};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryRequest {
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    #[prost(string, tag = "2")]
    pub query: String,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<SerializedObject>,
    #[prost(map = "string, message", tag = "5")]
    pub meta_data: HashMap<String, MetaDataValue>,
    #[prost(message, optional, tag = "6")]
    pub response_type: Option<SerializedObject>,
    #[prost(message, repeated, tag = "7")]
    pub processing_instructions: Vec<ProcessingInstruction>,
    #[prost(string, tag = "8")]
    pub client_id: String,
    #[prost(string, tag = "9")]
    pub component_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryResponse {
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    #[prost(string, tag = "2")]
    pub error_code: String,
    #[prost(message, optional, tag = "3")]
    pub error_message: Option<ErrorMessage>,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<SerializedObject>,
    #[prost(map = "string, message", tag = "5")]
    pub meta_data: HashMap<String, MetaDataValue>,
    #[prost(message, repeated, tag = "6")]
    pub processing_instructions: Vec<ProcessingInstruction>,
    #[prost(string, tag = "7")]
    pub request_identifier: String,
}

/// Marks the end of the responses to a query.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryComplete {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub request_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QuerySubscription {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub query: String,
    #[prost(string, tag = "3")]
    pub result_name: String,
    #[prost(string, tag = "4")]
    pub component_name: String,
    #[prost(string, tag = "5")]
    pub client_id: String,
    #[prost(int32, tag = "6")]
    pub nr_of_handlers: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryReference {
    #[prost(string, tag = "1")]
    pub request_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryFlowControl {
    #[prost(message, optional, tag = "1")]
    pub query_reference: Option<QueryReference>,
    #[prost(int64, tag = "2")]
    pub permits: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionQuery {
    #[prost(string, tag = "1")]
    pub subscription_identifier: String,
    #[prost(int64, tag = "2")]
    pub number_of_permits: i64,
    #[prost(message, optional, tag = "3")]
    pub query_request: Option<QueryRequest>,
    #[prost(message, optional, tag = "4")]
    pub update_response_type: Option<SerializedObject>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionQueryRequest {
    #[prost(oneof = "subscription_query_request::Request", tags = "1, 2, 3, 4")]
    pub request: Option<subscription_query_request::Request>,
}

pub mod subscription_query_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Subscribe(super::SubscriptionQuery),
        #[prost(message, tag = "2")]
        Unsubscribe(super::SubscriptionQuery),
        #[prost(message, tag = "3")]
        GetInitialResult(super::SubscriptionQuery),
        #[prost(message, tag = "4")]
        FlowControl(super::SubscriptionQuery),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryUpdate {
    #[prost(string, tag = "2")]
    pub message_identifier: String,
    #[prost(message, optional, tag = "3")]
    pub payload: Option<SerializedObject>,
    #[prost(map = "string, message", tag = "4")]
    pub meta_data: HashMap<String, MetaDataValue>,
    #[prost(string, tag = "5")]
    pub client_id: String,
    #[prost(string, tag = "6")]
    pub component_name: String,
    #[prost(string, tag = "7")]
    pub error_code: String,
    #[prost(message, optional, tag = "8")]
    pub error_message: Option<ErrorMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryUpdateComplete {
    #[prost(string, tag = "2")]
    pub client_id: String,
    #[prost(string, tag = "3")]
    pub component_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryUpdateCompleteExceptionally {
    #[prost(string, tag = "2")]
    pub client_id: String,
    #[prost(string, tag = "3")]
    pub component_name: String,
    #[prost(string, tag = "5")]
    pub error_code: String,
    #[prost(message, optional, tag = "6")]
    pub error_message: Option<ErrorMessage>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionQueryResponse {
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    #[prost(string, tag = "2")]
    pub subscription_identifier: String,
    #[prost(oneof = "subscription_query_response::Response", tags = "3, 4, 5, 6")]
    pub response: Option<subscription_query_response::Response>,
}

pub mod subscription_query_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "3")]
        InitialResult(super::QueryResponse),
        #[prost(message, tag = "4")]
        Update(super::QueryUpdate),
        #[prost(message, tag = "5")]
        Complete(super::QueryUpdateComplete),
        #[prost(message, tag = "6")]
        CompleteExceptionally(super::QueryUpdateCompleteExceptionally),
    }
}

/// Client to server message on the query provider stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryProviderOutbound {
    #[prost(oneof = "query_provider_outbound::Request", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub request: Option<query_provider_outbound::Request>,
    #[prost(string, tag = "8")]
    pub instruction_id: String,
}

pub mod query_provider_outbound {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Subscribe(super::QuerySubscription),
        #[prost(message, tag = "2")]
        Unsubscribe(super::QuerySubscription),
        #[prost(message, tag = "3")]
        FlowControl(super::FlowControl),
        #[prost(message, tag = "4")]
        QueryResponse(super::QueryResponse),
        #[prost(message, tag = "5")]
        QueryComplete(super::QueryComplete),
        #[prost(message, tag = "6")]
        SubscriptionQueryResponse(super::SubscriptionQueryResponse),
        #[prost(message, tag = "7")]
        Ack(super::InstructionAck),
    }
}

/// Server to client message on the query provider stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryProviderInbound {
    #[prost(oneof = "query_provider_inbound::Request", tags = "1, 2, 3, 4, 5")]
    pub request: Option<query_provider_inbound::Request>,
    #[prost(string, tag = "6")]
    pub instruction_id: String,
}

pub mod query_provider_inbound {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Ack(super::InstructionAck),
        #[prost(message, tag = "2")]
        Query(super::QueryRequest),
        #[prost(message, tag = "3")]
        SubscriptionQueryRequest(super::SubscriptionQueryRequest),
        #[prost(message, tag = "4")]
        QueryCancel(super::QueryReference),
        #[prost(message, tag = "5")]
        QueryFlowControl(super::QueryFlowControl),
    }
}

impl QueryProviderOutbound {
    pub fn flow_control(control: FlowControl) -> Self {
        Self {
            request: Some(query_provider_outbound::Request::FlowControl(control)),
            instruction_id: String::new(),
        }
    }

    pub fn ack(ack: InstructionAck) -> Self {
        Self {
            request: Some(query_provider_outbound::Request::Ack(ack)),
            instruction_id: String::new(),
        }
    }
}
