// ABOUTME: Command service messages for dispatching and handling commands.
// ABOUTME: Includes the provider stream envelopes for subscriptions and responses.

use std::collections::HashMap;

use crate::common::{
    ErrorMessage, FlowControl, InstructionAck, MetaDataValue, ProcessingInstruction,
    SerializedObject,
};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub message_identifier: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "4")]
    pub payload: Option<SerializedObject>,
    #[prost(map = "string, message", tag = "5")]
    pub meta_data: HashMap<String, MetaDataValue>,
    #[prost(message, repeated, tag = "6")]
    pub processing_instructions: Vec<ProcessingInstruction>,
    #[prost(string, tag = "7")]
    pub client_id: String,
    #[prost(string, tag = "8")]
    pub component_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandResponse {
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

/// Subscribes or unsubscribes this client as a handler of a command.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandSubscription {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(string, tag = "2")]
    pub command: String,
    #[prost(string, tag = "3")]
    pub component_name: String,
    #[prost(string, tag = "4")]
    pub client_id: String,
    #[prost(int32, tag = "5")]
    pub load_factor: i32,
}

/// Client to server message on the command provider stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandProviderOutbound {
    #[prost(oneof = "command_provider_outbound::Request", tags = "1, 2, 3, 4, 5")]
    pub request: Option<command_provider_outbound::Request>,
    #[prost(string, tag = "6")]
    pub instruction_id: String,
}

pub mod command_provider_outbound {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Subscribe(super::CommandSubscription),
        #[prost(message, tag = "2")]
        Unsubscribe(super::CommandSubscription),
        #[prost(message, tag = "3")]
        FlowControl(super::FlowControl),
        #[prost(message, tag = "4")]
        CommandResponse(super::CommandResponse),
        #[prost(message, tag = "5")]
        Ack(super::InstructionAck),
    }
}

/// Server to client message on the command provider stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CommandProviderInbound {
    #[prost(oneof = "command_provider_inbound::Request", tags = "1, 2")]
    pub request: Option<command_provider_inbound::Request>,
    #[prost(string, tag = "3")]
    pub instruction_id: String,
}

pub mod command_provider_inbound {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Ack(super::InstructionAck),
        #[prost(message, tag = "2")]
        Command(super::Command),
    }
}

impl CommandProviderOutbound {
    pub fn flow_control(control: FlowControl) -> Self {
        Self {
            request: Some(command_provider_outbound::Request::FlowControl(control)),
            instruction_id: String::new(),
        }
    }

    pub fn ack(ack: InstructionAck) -> Self {
        Self {
            request: Some(command_provider_outbound::Request::Ack(ack)),
            instruction_id: String::new(),
        }
    }
}
