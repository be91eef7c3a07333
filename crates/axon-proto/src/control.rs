// ABOUTME: Platform service messages: client identification, routing and the control stream.
// ABOUTME: Carries heartbeats, acknowledgements, reconnect requests and event processor instructions.

use std::collections::HashMap;

use crate::common::{ErrorMessage, InstructionAck};

/// Identifies a client to the server on every handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientIdentification {
    #[prost(string, tag = "1")]
    pub client_id: String,
    #[prost(string, tag = "2")]
    pub component_name: String,
    #[prost(map = "string, string", tag = "3")]
    pub tags: HashMap<String, String>,
    #[prost(string, tag = "4")]
    pub version: String,
}

/// Node a client should connect to for its context.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlatformInfo {
    #[prost(message, optional, tag = "1")]
    pub primary: Option<NodeInfo>,
    #[prost(bool, tag = "2")]
    pub same_connection: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NodeInfo {
    #[prost(string, tag = "1")]
    pub host_name: String,
    #[prost(int32, tag = "2")]
    pub grpc_port: i32,
    #[prost(int32, tag = "3")]
    pub http_port: i32,
    #[prost(int32, tag = "4")]
    pub version: i32,
    #[prost(string, tag = "5")]
    pub node_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Heartbeat {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestReconnect {}

/// Client to server control instruction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlatformInboundInstruction {
    #[prost(oneof = "platform_inbound_instruction::Request", tags = "1, 2, 5, 6, 7")]
    pub request: Option<platform_inbound_instruction::Request>,
    #[prost(string, tag = "8")]
    pub instruction_id: String,
}

pub mod platform_inbound_instruction {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Register(super::ClientIdentification),
        #[prost(message, tag = "2")]
        EventProcessorInfo(super::EventProcessorInfo),
        #[prost(message, tag = "5")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "6")]
        Ack(super::InstructionAck),
        #[prost(message, tag = "7")]
        Result(super::InstructionResult),
    }
}

/// Server to client control instruction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PlatformOutboundInstruction {
    #[prost(oneof = "platform_outbound_instruction::Request", tags = "1, 3, 4, 5, 6, 7, 8, 9, 10, 11")]
    pub request: Option<platform_outbound_instruction::Request>,
    #[prost(string, tag = "12")]
    pub instruction_id: String,
}

pub mod platform_outbound_instruction {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        NodeNotification(super::NodeInfo),
        #[prost(message, tag = "3")]
        RequestReconnect(super::RequestReconnect),
        #[prost(message, tag = "4")]
        PauseEventProcessor(super::EventProcessorReference),
        #[prost(message, tag = "5")]
        StartEventProcessor(super::EventProcessorReference),
        #[prost(message, tag = "6")]
        ReleaseSegment(super::EventProcessorSegmentReference),
        #[prost(message, tag = "7")]
        RequestEventProcessorInfo(super::EventProcessorReference),
        #[prost(message, tag = "8")]
        SplitEventProcessorSegment(super::EventProcessorSegmentReference),
        #[prost(message, tag = "9")]
        MergeEventProcessorSegment(super::EventProcessorSegmentReference),
        #[prost(message, tag = "10")]
        Heartbeat(super::Heartbeat),
        #[prost(message, tag = "11")]
        Ack(super::InstructionAck),
    }
}

/// Status of one event processor running in this client.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorInfo {
    #[prost(string, tag = "1")]
    pub processor_name: String,
    #[prost(string, tag = "2")]
    pub mode: String,
    #[prost(int32, tag = "3")]
    pub active_threads: i32,
    #[prost(bool, tag = "4")]
    pub running: bool,
    #[prost(bool, tag = "5")]
    pub error: bool,
    #[prost(message, repeated, tag = "6")]
    pub segment_status: Vec<SegmentStatus>,
    #[prost(int32, tag = "7")]
    pub available_threads: i32,
    #[prost(string, tag = "8")]
    pub token_store_identifier: String,
    #[prost(bool, tag = "9")]
    pub is_streaming_processor: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SegmentStatus {
    #[prost(int32, tag = "1")]
    pub segment_id: i32,
    #[prost(bool, tag = "2")]
    pub caught_up: bool,
    #[prost(bool, tag = "3")]
    pub replaying: bool,
    #[prost(int32, tag = "4")]
    pub one_part_of: i32,
    #[prost(int64, tag = "5")]
    pub token_position: i64,
    #[prost(string, tag = "6")]
    pub error_state: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorReference {
    #[prost(string, tag = "1")]
    pub processor_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EventProcessorSegmentReference {
    #[prost(string, tag = "1")]
    pub processor_name: String,
    #[prost(int32, tag = "2")]
    pub segment_identifier: i32,
}

/// Outcome of a server instruction that the client executed.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstructionResult {
    #[prost(string, tag = "1")]
    pub instruction_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ErrorMessage>,
}

impl PlatformInboundInstruction {
    /// Acknowledge a server instruction.
    pub fn ack(ack: InstructionAck) -> Self {
        Self {
            request: Some(platform_inbound_instruction::Request::Ack(ack)),
            instruction_id: String::new(),
        }
    }

    /// Report how an executed instruction ended.
    pub fn result(result: InstructionResult) -> Self {
        Self {
            request: Some(platform_inbound_instruction::Request::Result(result)),
            instruction_id: String::new(),
        }
    }

    pub fn event_processor_info(info: EventProcessorInfo) -> Self {
        Self {
            request: Some(platform_inbound_instruction::Request::EventProcessorInfo(info)),
            instruction_id: String::new(),
        }
    }
}
