// ABOUTME: Error types for the connector core.
// ABOUTME: Maps server error codes onto categories and carries statuses verbatim.

use std::fmt;

use axon_grpc::GrpcClientError;
use axon_proto::{ErrorMessage, InstructionAck};
use thiserror::Error;

/// Error categories AxonServer reports as `AXONIQ-xxxx` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    AuthenticationTokenMissing,
    AuthenticationInvalidToken,
    UnsupportedInstruction,
    InstructionAckError,
    InstructionExecutionError,
    InvalidEventSequence,
    EventPayloadTooLarge,
    NoEventStoreMasterAvailable,
    ConnectionFailed,
    GrpcMessageTooLarge,
    NoHandlerForCommand,
    CommandExecutionError,
    CommandDispatchError,
    ConcurrencyException,
    NoHandlerForQuery,
    QueryExecutionError,
    QueryDispatchError,
    DatafileReadError,
    IndexReadError,
    DatafileWriteError,
    IndexWriteError,
    DirectoryCreationFailed,
    ValidationFailed,
    TransactionRolledBack,
    Other,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 25] = [
        ErrorCategory::AuthenticationTokenMissing,
        ErrorCategory::AuthenticationInvalidToken,
        ErrorCategory::UnsupportedInstruction,
        ErrorCategory::InstructionAckError,
        ErrorCategory::InstructionExecutionError,
        ErrorCategory::InvalidEventSequence,
        ErrorCategory::EventPayloadTooLarge,
        ErrorCategory::NoEventStoreMasterAvailable,
        ErrorCategory::ConnectionFailed,
        ErrorCategory::GrpcMessageTooLarge,
        ErrorCategory::NoHandlerForCommand,
        ErrorCategory::CommandExecutionError,
        ErrorCategory::CommandDispatchError,
        ErrorCategory::ConcurrencyException,
        ErrorCategory::NoHandlerForQuery,
        ErrorCategory::QueryExecutionError,
        ErrorCategory::QueryDispatchError,
        ErrorCategory::DatafileReadError,
        ErrorCategory::IndexReadError,
        ErrorCategory::DatafileWriteError,
        ErrorCategory::IndexWriteError,
        ErrorCategory::DirectoryCreationFailed,
        ErrorCategory::ValidationFailed,
        ErrorCategory::TransactionRolledBack,
        ErrorCategory::Other,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            ErrorCategory::AuthenticationTokenMissing => "AXONIQ-1000",
            ErrorCategory::AuthenticationInvalidToken => "AXONIQ-1001",
            ErrorCategory::UnsupportedInstruction => "AXONIQ-1002",
            ErrorCategory::InstructionAckError => "AXONIQ-1003",
            ErrorCategory::InstructionExecutionError => "AXONIQ-1004",
            ErrorCategory::InvalidEventSequence => "AXONIQ-2000",
            ErrorCategory::EventPayloadTooLarge => "AXONIQ-2001",
            ErrorCategory::NoEventStoreMasterAvailable => "AXONIQ-2100",
            ErrorCategory::ConnectionFailed => "AXONIQ-3001",
            ErrorCategory::GrpcMessageTooLarge => "AXONIQ-3002",
            ErrorCategory::NoHandlerForCommand => "AXONIQ-4000",
            ErrorCategory::CommandExecutionError => "AXONIQ-4002",
            ErrorCategory::CommandDispatchError => "AXONIQ-4003",
            ErrorCategory::ConcurrencyException => "AXONIQ-4004",
            ErrorCategory::NoHandlerForQuery => "AXONIQ-5000",
            ErrorCategory::QueryExecutionError => "AXONIQ-5001",
            ErrorCategory::QueryDispatchError => "AXONIQ-5002",
            ErrorCategory::DatafileReadError => "AXONIQ-9000",
            ErrorCategory::IndexReadError => "AXONIQ-9001",
            ErrorCategory::DatafileWriteError => "AXONIQ-9100",
            ErrorCategory::IndexWriteError => "AXONIQ-9101",
            ErrorCategory::DirectoryCreationFailed => "AXONIQ-9102",
            ErrorCategory::ValidationFailed => "AXONIQ-9200",
            ErrorCategory::TransactionRolledBack => "AXONIQ-9900",
            ErrorCategory::Other => "AXONIQ-0001",
        }
    }

    /// Category for an error code, `Other` when the code is unknown.
    pub fn parse(code: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|category| category.code() == code)
            .unwrap_or(ErrorCategory::Other)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors surfaced by the connector.
#[derive(Error, Debug, Clone)]
pub enum ConnectorError {
    /// The server, or a handler on another client, reported an error.
    #[error("[{category}] {message}")]
    AxonServer {
        client: String,
        category: ErrorCategory,
        message: String,
        location: String,
        details: Vec<String>,
    },

    /// The server rejected an RPC with a status. Never retried.
    #[error("{:?}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),

    /// No usable connection to AxonServer.
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("{0} has been disposed")]
    Disposed(&'static str),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Several fanned-out operations failed.
    #[error("{} operation(s) failed: {}", .0.len(), join(.0))]
    Aggregate(Vec<ConnectorError>),

    #[error("configuration error: {0}")]
    Config(String),
}

fn join(errors: &[ConnectorError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConnectorError {
    pub fn axon_server(
        client: impl Into<String>,
        category: ErrorCategory,
        message: impl Into<String>,
    ) -> Self {
        ConnectorError::AxonServer {
            client: client.into(),
            category,
            message: message.into(),
            location: String::new(),
            details: Vec::new(),
        }
    }

    /// Convert an error carried by an acknowledgement or response.
    pub fn from_error_message(client: impl Into<String>, error: Option<&ErrorMessage>) -> Self {
        match error {
            Some(error) => ConnectorError::AxonServer {
                client: client.into(),
                category: ErrorCategory::parse(&error.error_code),
                message: error.message.clone(),
                location: error.location.clone(),
                details: error.details.clone(),
            },
            None => ConnectorError::axon_server(
                client,
                ErrorCategory::Other,
                "the server reported a failure without details",
            ),
        }
    }

    /// Convert a negative acknowledgement.
    pub fn from_ack(ack: &InstructionAck, client: impl Into<String>) -> Self {
        Self::from_error_message(client, ack.error.as_ref())
    }

    /// Describe this error as a wire error message originating at `location`.
    pub fn to_error_message(&self, category: ErrorCategory, location: &str) -> ErrorMessage {
        match self {
            ConnectorError::AxonServer {
                message,
                location: origin,
                details,
                ..
            } => ErrorMessage {
                message: message.clone(),
                location: if origin.is_empty() {
                    location.to_string()
                } else {
                    origin.clone()
                },
                details: details.clone(),
                error_code: category.code().to_string(),
            },
            other => ErrorMessage {
                message: other.to_string(),
                location: location.to_string(),
                details: Vec::new(),
                error_code: category.code().to_string(),
            },
        }
    }

    pub fn category(&self) -> Option<ErrorCategory> {
        match self {
            ConnectorError::AxonServer { category, .. } => Some(*category),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<tonic::Code> {
        match self {
            ConnectorError::Status(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Whether this is a connectivity failure rather than a rejection.
    pub fn is_connectivity(&self) -> bool {
        match self {
            ConnectorError::NotConnected(_) => true,
            ConnectorError::Status(status) => status.code() == tonic::Code::Unavailable,
            _ => false,
        }
    }
}

impl From<GrpcClientError> for ConnectorError {
    fn from(err: GrpcClientError) -> Self {
        ConnectorError::NotConnected(err.to_string())
    }
}
