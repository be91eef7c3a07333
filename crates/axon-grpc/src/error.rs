// ABOUTME: Error types for the axon-grpc crate.
// ABOUTME: Provides structured errors for channel, credential, and stream operations.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the gRPC transport.
#[derive(Error, Debug)]
pub enum GrpcClientError {
    /// Invalid server address format.
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    /// Failed to connect to the server.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connecting did not finish within the configured timeout.
    #[error("connecting to {address} timed out after {}ms", .timeout.as_millis())]
    ConnectTimeout { address: String, timeout: Duration },

    /// A credential or context could not be encoded as gRPC metadata.
    #[error("invalid metadata value for '{header}'")]
    InvalidMetadata { header: &'static str },

    /// Stream was closed unexpectedly.
    #[error("stream closed unexpectedly")]
    StreamClosed,

    /// Error on the gRPC stream.
    #[error("stream error: {0}")]
    StreamError(String),

    /// Authentication failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
}

impl From<tonic::Status> for GrpcClientError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unauthenticated | tonic::Code::PermissionDenied => {
                GrpcClientError::AuthenticationFailed(status.message().to_string())
            }
            _ => GrpcClientError::StreamError(status.to_string()),
        }
    }
}

impl From<tonic::transport::Error> for GrpcClientError {
    fn from(err: tonic::transport::Error) -> Self {
        GrpcClientError::ConnectionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GrpcClientError::InvalidAddress("not a url".to_string());
        assert_eq!(err.to_string(), "invalid server address: not a url");

        let err = GrpcClientError::ConnectTimeout {
            address: "http://localhost:8124".to_string(),
            timeout: Duration::from_millis(250),
        };
        assert_eq!(
            err.to_string(),
            "connecting to http://localhost:8124 timed out after 250ms"
        );

        let err = GrpcClientError::InvalidMetadata {
            header: "axoniq-access-token",
        };
        assert_eq!(
            err.to_string(),
            "invalid metadata value for 'axoniq-access-token'"
        );
    }

    #[test]
    fn test_from_tonic_status() {
        let status = tonic::Status::internal("test error");
        let err: GrpcClientError = status.into();
        assert!(matches!(err, GrpcClientError::StreamError(_)));
    }

    #[test]
    fn test_from_tonic_status_authentication_codes() {
        let unauthenticated = tonic::Status::unauthenticated("token missing");
        let err: GrpcClientError = unauthenticated.into();
        assert!(
            matches!(err, GrpcClientError::AuthenticationFailed(msg) if msg == "token missing")
        );

        let denied = tonic::Status::permission_denied("access denied");
        let err: GrpcClientError = denied.into();
        assert!(matches!(err, GrpcClientError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_from_tonic_status_various_codes() {
        let not_found = tonic::Status::not_found("resource not found");
        let err: GrpcClientError = not_found.into();
        assert!(matches!(err, GrpcClientError::StreamError(msg) if msg.contains("resource not found")));
    }

    #[test]
    fn test_error_debug() {
        let err = GrpcClientError::StreamClosed;
        let debug_str = format!("{:?}", err);
        assert!(debug_str.contains("StreamClosed"));
    }

    #[tokio::test]
    async fn test_from_tonic_transport_error() {
        use tonic::transport::Endpoint;

        let endpoint = Endpoint::from_static("http://[::1]:1");
        let result = endpoint.connect().await;

        if let Err(transport_err) = result {
            let grpc_err: GrpcClientError = transport_err.into();
            assert!(matches!(grpc_err, GrpcClientError::ConnectionFailed(_)));
        }
    }
}
