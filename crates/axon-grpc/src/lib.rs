// ABOUTME: gRPC transport for the AxonServer connector.
// ABOUTME: Provides channel creation, credentials, stream wrappers and the transport traits.

pub mod auth;
pub mod channel;
pub mod client;
pub mod error;
pub mod stream;
pub mod transport;

// Channel creation
pub use channel::{
    create_channel, ChannelConfig, KeepAliveConfig, ServerEndpoint, DEFAULT_GRPC_PORT,
};

// Credentials
pub use auth::{Authentication, ACCESS_TOKEN_HEADER, CONTEXT_HEADER};

// Error types
pub use error::GrpcClientError;

// Stream management
pub use stream::{
    BidirectionalStream, InboundStream, OutboundStream, StreamReceiver, StreamSender,
    DEFAULT_CHANNEL_BUFFER,
};

// Transport seam and its tonic implementation
pub use client::{GrpcConnector, GrpcTransport};
pub use transport::{
    AdminCall, AdminReply, AxonServerTransport, EventStoreCall, EventStoreReply, TransportConnector,
};

// Re-export proto types for convenience
pub use axon_proto;
