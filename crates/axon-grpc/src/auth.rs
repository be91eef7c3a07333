// ABOUTME: Credential writers that attach authentication to outgoing gRPC calls.
// ABOUTME: A closed set of variants: no authentication, or an access token header.

use std::fmt;

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

use crate::error::GrpcClientError;

/// Metadata header carrying the access token.
pub const ACCESS_TOKEN_HEADER: &str = "axoniq-access-token";

/// Metadata header naming the context a call targets.
pub const CONTEXT_HEADER: &str = "axoniq-context";

/// How a client authenticates with AxonServer.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum Authentication {
    #[default]
    None,
    Token(String),
}

impl Authentication {
    pub fn token(token: impl Into<String>) -> Self {
        Authentication::Token(token.into())
    }

    /// Encode the credential as metadata headers, validating it once.
    pub fn headers(&self) -> Result<Vec<(&'static str, AsciiMetadataValue)>, GrpcClientError> {
        match self {
            Authentication::None => Ok(Vec::new()),
            Authentication::Token(token) => {
                let value = AsciiMetadataValue::try_from(token.as_str()).map_err(|_| {
                    GrpcClientError::InvalidMetadata {
                        header: ACCESS_TOKEN_HEADER,
                    }
                })?;
                Ok(vec![(ACCESS_TOKEN_HEADER, value)])
            }
        }
    }

    /// Write the credential into an outgoing request's metadata.
    pub fn write_to(&self, metadata: &mut MetadataMap) -> Result<(), GrpcClientError> {
        for (header, value) in self.headers()? {
            metadata.insert(header, value);
        }
        Ok(())
    }
}

impl fmt::Debug for Authentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authentication::None => write!(f, "None"),
            Authentication::Token(_) => write!(f, "Token(<redacted>)"),
        }
    }
}
