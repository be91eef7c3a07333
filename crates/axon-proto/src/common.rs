// ABOUTME: Message types shared by every AxonServer service.
// ABOUTME: Payloads, acknowledgements, flow control and processing instructions.

/// A serialized payload with its type name and revision.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SerializedObject {
    #[prost(string, tag = "1")]
    pub r#type: String,
    #[prost(string, tag = "2")]
    pub revision: String,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

/// Error details reported by the server or by a client handler.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorMessage {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub location: String,
    #[prost(string, repeated, tag = "3")]
    pub details: Vec<String>,
    #[prost(string, tag = "4")]
    pub error_code: String,
}

/// Acknowledgement of an instruction, correlated by instruction id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstructionAck {
    #[prost(string, tag = "1")]
    pub instruction_id: String,
    #[prost(bool, tag = "2")]
    pub success: bool,
    #[prost(message, optional, tag = "3")]
    pub error: Option<ErrorMessage>,
}

/// Grants the server permission to send more messages on a stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FlowControl {
    #[prost(string, tag = "2")]
    pub client_id: String,
    #[prost(int64, tag = "3")]
    pub permits: i64,
}

/// A typed meta-data value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetaDataValue {
    #[prost(oneof = "meta_data_value::Data", tags = "1, 2, 3, 4, 5")]
    pub data: Option<meta_data_value::Data>,
}

pub mod meta_data_value {
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
        #[prost(message, tag = "5")]
        BytesValue(super::SerializedObject),
    }
}

/// Keys for processing instructions attached to commands and queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ProcessingKey {
    RoutingKey = 0,
    Priority = 1,
    Timeout = 2,
    NrOfResults = 3,
    ClientSupportsStreaming = 8,
    ServerSupportsStreaming = 9,
}

/// A key/value hint the server uses for routing and dispatch.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProcessingInstruction {
    #[prost(enumeration = "ProcessingKey", tag = "1")]
    pub key: i32,
    #[prost(message, optional, tag = "2")]
    pub value: Option<MetaDataValue>,
}

impl ProcessingInstruction {
    /// Routing key instruction carrying a text value.
    pub fn routing_key(value: impl Into<String>) -> Self {
        Self {
            key: ProcessingKey::RoutingKey as i32,
            value: Some(MetaDataValue {
                data: Some(meta_data_value::Data::TextValue(value.into())),
            }),
        }
    }

    /// Whether this instruction is the given key with a `true` boolean value.
    pub fn is_enabled(&self, key: ProcessingKey) -> bool {
        self.key == key as i32
            && matches!(
                self.value.as_ref().and_then(|value| value.data.as_ref()),
                Some(meta_data_value::Data::BooleanValue(true))
            )
    }
}
