// ABOUTME: gRPC channel creation with keep-alive, TLS, and connect timeout configuration.
// ABOUTME: Also defines ServerEndpoint, the host/port pair routing servers are dialed by.

use std::fmt;
use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::GrpcClientError;

/// Port AxonServer listens on for gRPC when none is given.
pub const DEFAULT_GRPC_PORT: u16 = 8124;

/// A host and port of an AxonServer node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host` or `host:port`. The port defaults to 8124.
    pub fn parse(value: &str) -> Result<Self, GrpcClientError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(GrpcClientError::InvalidAddress(
                "server endpoint can not be empty".to_string(),
            ));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port.parse::<u16>().map_err(|_| {
                    GrpcClientError::InvalidAddress(format!("invalid port in '{value}'"))
                })?;
                Ok(Self::new(host, port))
            }
            Some(_) => Err(GrpcClientError::InvalidAddress(format!(
                "missing host in '{value}'"
            ))),
            None => Ok(Self::new(value, DEFAULT_GRPC_PORT)),
        }
    }

    /// The URI tonic should dial for this endpoint.
    pub fn to_uri(&self, use_tls: bool) -> String {
        let scheme = if use_tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_GRPC_PORT)
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for gRPC channel keep-alive behavior.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between keep-alive pings when the connection is idle.
    pub interval: Duration,
    /// Timeout waiting for keep-alive response before considering connection dead.
    pub timeout: Duration,
    /// Whether to send keep-alive pings even when no streams are active.
    pub while_idle: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            while_idle: true,
        }
    }
}

/// Configuration for creating a gRPC channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server address to connect to (e.g., "http://localhost:8124").
    pub address: String,
    /// Keep-alive configuration. If None, keep-alive is disabled.
    pub keep_alive: Option<KeepAliveConfig>,
    /// Connection timeout.
    pub connect_timeout: Option<Duration>,
    /// Enable TLS for the connection.
    pub use_tls: bool,
}

impl ChannelConfig {
    /// Create a channel config with default settings.
    /// Auto-detects TLS from URL scheme (https:// enables TLS).
    pub fn new(address: impl Into<String>) -> Self {
        let addr = address.into().trim().to_string();
        let use_tls = Self::detect_tls(&addr);
        Self {
            address: addr,
            keep_alive: Some(KeepAliveConfig::default()),
            connect_timeout: Some(Duration::from_secs(10)),
            use_tls,
        }
    }

    /// Channel config for an endpoint, with the scheme chosen by `use_tls`.
    pub fn for_endpoint(endpoint: &ServerEndpoint, use_tls: bool) -> Self {
        Self::new(endpoint.to_uri(use_tls))
    }

    /// Detect TLS from URL scheme (case-insensitive).
    fn detect_tls(addr: &str) -> bool {
        addr.to_lowercase().starts_with("https://")
    }

    /// Normalize scheme to match TLS setting.
    fn normalize_scheme(addr: &str, use_tls: bool) -> String {
        let lower = addr.to_lowercase();
        if use_tls && lower.starts_with("http://") {
            format!("https://{}", &addr[7..])
        } else if !use_tls && lower.starts_with("https://") {
            format!("http://{}", &addr[8..])
        } else {
            addr.to_string()
        }
    }

    /// Disable keep-alive.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = None;
        self
    }

    /// Set custom keep-alive configuration.
    pub fn with_keep_alive(mut self, config: KeepAliveConfig) -> Self {
        self.keep_alive = Some(config);
        self
    }

    /// Set connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Enable TLS for the connection.
    /// Also normalizes the address scheme to https:// if it was http://.
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self.address = Self::normalize_scheme(&self.address, true);
        self
    }

    /// Disable TLS for the connection.
    pub fn without_tls(mut self) -> Self {
        self.use_tls = false;
        self.address = Self::normalize_scheme(&self.address, false);
        self
    }
}

/// Create a gRPC channel with the specified configuration.
///
/// Keep-alive pings let a control stream notice a dead node even while no
/// heartbeat is due. The connect timeout bounds how long an unreachable
/// routing server can stall failover.
pub async fn create_channel(config: &ChannelConfig) -> Result<Channel, GrpcClientError> {
    let mut endpoint = Endpoint::from_shared(config.address.clone())
        .map_err(|e| GrpcClientError::InvalidAddress(e.to_string()))?;

    if config.use_tls {
        endpoint = endpoint
            .tls_config(ClientTlsConfig::new())
            .map_err(|e| GrpcClientError::ConnectionFailed(format!("TLS config error: {}", e)))?;
    }

    if let Some(ka) = &config.keep_alive {
        endpoint = endpoint
            .http2_keep_alive_interval(ka.interval)
            .keep_alive_timeout(ka.timeout)
            .keep_alive_while_idle(ka.while_idle);
    }

    if let Some(timeout) = config.connect_timeout {
        endpoint = endpoint.connect_timeout(timeout);
    }

    let channel = endpoint
        .connect()
        .await
        .map_err(|e| GrpcClientError::ConnectionFailed(e.to_string()))?;

    tracing::debug!(
        address = %config.address,
        keep_alive = config.keep_alive.is_some(),
        use_tls = config.use_tls,
        "gRPC channel connected"
    );

    Ok(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Install crypto provider for TLS tests (idempotent)
    fn ensure_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    #[test]
    fn test_parse_endpoint_with_port() {
        let endpoint = ServerEndpoint::parse("axonserver-1:8125").unwrap();
        assert_eq!(endpoint, ServerEndpoint::new("axonserver-1", 8125));
    }

    #[test]
    fn test_parse_endpoint_defaults_port() {
        let endpoint = ServerEndpoint::parse(" axonserver ").unwrap();
        assert_eq!(endpoint.host, "axonserver");
        assert_eq!(endpoint.port, DEFAULT_GRPC_PORT);
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert!(matches!(
            ServerEndpoint::parse(""),
            Err(GrpcClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            ServerEndpoint::parse("host:port"),
            Err(GrpcClientError::InvalidAddress(_))
        ));
        assert!(matches!(
            ServerEndpoint::parse(":8124"),
            Err(GrpcClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_endpoint_display_and_uri() {
        let endpoint = ServerEndpoint::default();
        assert_eq!(endpoint.to_string(), "localhost:8124");
        assert_eq!(endpoint.to_uri(false), "http://localhost:8124");
        assert_eq!(endpoint.to_uri(true), "https://localhost:8124");
    }

    #[test]
    fn test_channel_config_for_endpoint() {
        let config = ChannelConfig::for_endpoint(&ServerEndpoint::new("node", 9000), true);
        assert_eq!(config.address, "https://node:9000");
        assert!(config.use_tls);
    }

    #[test]
    fn test_channel_config_builder() {
        let config = ChannelConfig::new("http://localhost:8124")
            .with_connect_timeout(Duration::from_secs(3))
            .with_keep_alive(KeepAliveConfig {
                interval: Duration::from_secs(5),
                timeout: Duration::from_secs(10),
                while_idle: false,
            });

        assert_eq!(config.address, "http://localhost:8124");
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(3)));
        let ka = config.keep_alive.unwrap();
        assert_eq!(ka.interval, Duration::from_secs(5));
        assert!(!ka.while_idle);
    }

    #[test]
    fn test_channel_config_default_values() {
        let config = ChannelConfig::new("http://localhost:8124");
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        let ka = config.keep_alive.unwrap();
        assert_eq!(ka.interval, Duration::from_secs(1));
        assert_eq!(ka.timeout, Duration::from_secs(5));
        assert!(ka.while_idle);
    }

    #[test]
    fn test_tls_normalization() {
        let config = ChannelConfig::new("HTTP://localhost:8124").with_tls();
        assert!(config.use_tls);
        assert_eq!(config.address, "https://localhost:8124");

        let config = ChannelConfig::new("  https://localhost:8124  ").without_tls();
        assert!(!config.use_tls);
        assert_eq!(config.address, "http://localhost:8124");
    }

    #[tokio::test]
    async fn test_create_channel_invalid_address() {
        let config = ChannelConfig::new("");
        let err = create_channel(&config).await.unwrap_err();
        assert!(
            matches!(
                err,
                GrpcClientError::InvalidAddress(_) | GrpcClientError::ConnectionFailed(_)
            ),
            "expected InvalidAddress or ConnectionFailed, got {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_create_channel_connection_refused() {
        let config = ChannelConfig::new("http://127.0.0.1:1")
            .without_keep_alive()
            .with_connect_timeout(Duration::from_millis(100));
        let result = create_channel(&config).await;
        assert!(matches!(
            result.unwrap_err(),
            GrpcClientError::ConnectionFailed(_)
        ));
    }

    /// A plaintext TCP server that accepts connections and sends garbage.
    /// Used to test TLS handshake failures (TLS client connects to plaintext server).
    struct PlaintextServer {
        port: u16,
        shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
    }

    impl PlaintextServer {
        fn start() -> Self {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            listener.set_nonblocking(true).unwrap();

            let shutdown = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();

            let handle = std::thread::spawn(move || {
                while !shutdown_clone.load(std::sync::atomic::Ordering::Relaxed) {
                    if let Ok((mut stream, _)) = listener.accept() {
                        let _ = std::io::Write::write_all(&mut stream, b"NOT TLS\r\n");
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
            });

            PlaintextServer {
                port,
                shutdown,
                handle: Some(handle),
            }
        }
    }

    impl Drop for PlaintextServer {
        fn drop(&mut self) {
            self.shutdown
                .store(true, std::sync::atomic::Ordering::Relaxed);
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }

    #[tokio::test]
    async fn test_create_channel_tls_against_plaintext_server() {
        ensure_crypto_provider();
        let server = PlaintextServer::start();
        let endpoint = ServerEndpoint::new("127.0.0.1", server.port);

        let config = ChannelConfig::for_endpoint(&endpoint, true)
            .with_connect_timeout(Duration::from_millis(100));
        assert!(config.address.starts_with("https://"));

        let result = create_channel(&config).await;
        assert!(
            matches!(result.unwrap_err(), GrpcClientError::ConnectionFailed(_)),
            "TLS channel should fail with ConnectionFailed, not InvalidAddress"
        );

        drop(server);
    }
}
