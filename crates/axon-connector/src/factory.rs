// ABOUTME: Creates and caches one AxonServerConnection per context.
// ABOUTME: Concurrent connects to the same context share a single connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use axon_grpc::{GrpcConnector, TransportConnector};
use tokio_util::sync::CancellationToken;

use crate::config::AxonServerConnectorOptions;
use crate::connection::AxonServerConnection;
use crate::error::ConnectorError;
use crate::ids::Context;
use crate::sync::AsyncLock;

#[derive(Debug)]
pub struct AxonServerConnectionFactory {
    options: AxonServerConnectorOptions,
    connector: Arc<dyn TransportConnector>,
    lock: AsyncLock,
    connections: Mutex<HashMap<Context, Arc<AxonServerConnection>>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl AxonServerConnectionFactory {
    /// A factory that dials AxonServer over gRPC with the given options.
    pub fn new(options: AxonServerConnectorOptions) -> Self {
        let mut connector = GrpcConnector::new(options.authentication.clone())
            .with_connect_timeout(options.connect_timeout);
        if options.use_tls {
            connector = connector.with_tls();
        }
        Self::with_connector(options, Arc::new(connector))
    }

    pub fn with_connector(options: AxonServerConnectorOptions, connector: Arc<dyn TransportConnector>) -> Self {
        Self {
            options,
            connector,
            lock: AsyncLock::new(),
            connections: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &AxonServerConnectorOptions {
        &self.options
    }

    /// The connection for `context`, created and started on first request.
    ///
    /// Returns as soon as connecting has started; use
    /// [`AxonServerConnection::wait_until_connected`] to wait for the server.
    pub async fn connect(&self, context: Context) -> Result<Arc<AxonServerConnection>, ConnectorError> {
        self.ensure_open()?;
        let _guard = self.lock.acquire(&self.shutdown).await.map_err(|err| match err {
            ConnectorError::Cancelled => ConnectorError::Disposed("connection factory"),
            other => other,
        })?;
        self.ensure_open()?;

        if let Some(existing) = self.connections().get(&context) {
            return Ok(existing.clone());
        }

        tracing::info!(%context, client = %self.options.identity.client_instance_id, "creating connection");
        let connection = Arc::new(AxonServerConnection::new(
            context.clone(),
            &self.options,
            self.connector.clone(),
        ));
        connection.connect()?;
        self.connections().insert(context, connection.clone());
        Ok(connection)
    }

    /// Contexts with a live connection.
    pub fn contexts(&self) -> Vec<Context> {
        self.connections().keys().cloned().collect()
    }

    fn connections(&self) -> std::sync::MutexGuard<'_, HashMap<Context, Arc<AxonServerConnection>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_open(&self) -> Result<(), ConnectorError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(ConnectorError::Disposed("connection factory"));
        }
        Ok(())
    }

    /// Dispose every connection. Later connects fail with `Disposed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.lock.dispose();
        let connections: Vec<_> = self.connections().drain().map(|(_, c)| c).collect();
        futures::future::join_all(connections.iter().map(|connection| connection.dispose())).await;
        tracing::info!(count = connections.len(), "connection factory disposed");
    }
}
