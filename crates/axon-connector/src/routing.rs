// ABOUTME: Locates the AxonServer node serving a context.
// ABOUTME: Asks each routing server in turn and follows redirects to the primary node.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use axon_grpc::{AxonServerTransport, ServerEndpoint, TransportConnector};

use crate::clock::millis;
use crate::error::ConnectorError;
use crate::ids::{ClientIdentity, Context};

/// Produces the transport a connection uses, or `None` when no node answers.
pub struct RoutingChannelFactory {
    identity: ClientIdentity,
    routing_servers: Vec<ServerEndpoint>,
    connector: Arc<dyn TransportConnector>,
    connect_timeout: Duration,
}

impl fmt::Debug for RoutingChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingChannelFactory")
            .field("routing_servers", &self.routing_servers)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl RoutingChannelFactory {
    pub fn new(
        identity: ClientIdentity,
        routing_servers: Vec<ServerEndpoint>,
        connector: Arc<dyn TransportConnector>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            routing_servers,
            connector,
            connect_timeout,
        }
    }

    pub fn routing_servers(&self) -> &[ServerEndpoint] {
        &self.routing_servers
    }

    /// Try every routing server in order and stop at the first that answers.
    pub async fn create(&self, context: &Context) -> Option<Arc<dyn AxonServerTransport>> {
        for server in &self.routing_servers {
            tracing::info!(%server, %context, "requesting connection details");
            match tokio::time::timeout(self.connect_timeout, self.try_server(server, context)).await {
                Ok(Ok(transport)) => return Some(transport),
                Ok(Err(err)) => {
                    tracing::warn!(%server, error = %err, "connecting to AxonServer node failed");
                }
                Err(_) => {
                    tracing::warn!(
                        %server,
                        timeout_ms = millis(self.connect_timeout),
                        "connecting to AxonServer node timed out"
                    );
                }
            }
        }
        None
    }

    async fn try_server(
        &self,
        server: &ServerEndpoint,
        context: &Context,
    ) -> Result<Arc<dyn AxonServerTransport>, ConnectorError> {
        let candidate = self.connector.connect(server, context.as_str()).await?;
        let info = candidate
            .get_platform_server(self.identity.to_identification())
            .await?;

        let primary = match info.primary {
            Some(primary) if !info.same_connection => primary,
            _ => return Ok(candidate),
        };
        let port = u16::try_from(primary.grpc_port).map_err(|_| {
            ConnectorError::NotConnected(format!(
                "node {} reported invalid port {}",
                primary.node_name, primary.grpc_port
            ))
        })?;
        let target = ServerEndpoint::new(primary.host_name.clone(), port);
        if target == *server {
            tracing::debug!(%server, "reusing routing connection");
            return Ok(candidate);
        }

        tracing::info!(node = %primary.node_name, %target, "connecting to primary node");
        Ok(self.connector.connect(&target, context.as_str()).await?)
    }
}

/// The transport shared by every channel of one connection.
///
/// Readers see either the previous or the next transport, never a partial one.
#[derive(Debug, Default)]
pub struct TransportSlot {
    current: ArcSwapOption<Arc<dyn AxonServerTransport>>,
}

impl TransportSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<dyn AxonServerTransport>> {
        self.current.load_full().map(|transport| (*transport).clone())
    }

    /// The current transport, or `NotConnected`.
    pub fn require(&self) -> Result<Arc<dyn AxonServerTransport>, ConnectorError> {
        self.current()
            .ok_or_else(|| ConnectorError::NotConnected("no connection to AxonServer".to_string()))
    }

    /// Publish a new transport and return the previous one.
    pub fn replace(
        &self,
        transport: Option<Arc<dyn AxonServerTransport>>,
    ) -> Option<Arc<dyn AxonServerTransport>> {
        self.current
            .swap(transport.map(Arc::new))
            .map(|previous| (*previous).clone())
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_none()
    }
}
