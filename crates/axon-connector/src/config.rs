// ABOUTME: Connector options and the TOML file they can be loaded from.
// ABOUTME: Options are built fluently in code; the file model converts into them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result};
use axon_grpc::{Authentication, ServerEndpoint};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicyOptions;
use crate::clock::Clock;
use crate::error::ConnectorError;
use crate::ids::{ClientIdentity, ClientInstanceId, ComponentName, IdGenerator};
use crate::permits::PermitCount;

const DEFAULT_PERMITS: i64 = 5000;
const MINIMUM_PERMITS: i64 = 16;

/// Everything a connection factory needs to know.
#[derive(Debug, Clone)]
pub struct AxonServerConnectorOptions {
    pub(crate) identity: ClientIdentity,
    pub(crate) routing_servers: Vec<ServerEndpoint>,
    pub(crate) authentication: Authentication,
    pub(crate) use_tls: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) command_permits: PermitCount,
    pub(crate) query_permits: PermitCount,
    pub(crate) heartbeat: Option<(Duration, Duration)>,
    pub(crate) reconnect_backoff: BackoffPolicyOptions,
    pub(crate) tick_frequency: Duration,
    pub(crate) event_processor_update_frequency: Duration,
    pub(crate) clock: Clock,
    pub(crate) ids: IdGenerator,
}

fn permits(value: i64) -> PermitCount {
    PermitCount::new(value).unwrap_or(PermitCount::MIN)
}

impl AxonServerConnectorOptions {
    pub fn for_client(component_name: ComponentName, client_instance_id: ClientInstanceId) -> Self {
        Self {
            identity: ClientIdentity::new(component_name, client_instance_id),
            routing_servers: vec![ServerEndpoint::default()],
            authentication: Authentication::None,
            use_tls: false,
            connect_timeout: Duration::from_secs(10),
            command_permits: permits(DEFAULT_PERMITS),
            query_permits: permits(DEFAULT_PERMITS),
            heartbeat: Some((Duration::from_secs(10), Duration::from_secs(15))),
            reconnect_backoff: BackoffPolicyOptions::default(),
            tick_frequency: Duration::from_millis(100),
            event_processor_update_frequency: Duration::from_secs(2),
            clock: Clock::system(),
            ids: IdGenerator::random(),
        }
    }

    /// Options for a component whose instance id is generated.
    pub fn for_component(component_name: ComponentName) -> Self {
        let client_instance_id = IdGenerator::random().client_instance_id();
        Self::for_client(component_name, client_instance_id)
    }

    pub fn with_routing_servers(mut self, servers: impl IntoIterator<Item = ServerEndpoint>) -> Self {
        let servers: Vec<ServerEndpoint> = servers.into_iter().collect();
        if !servers.is_empty() {
            self.routing_servers = servers;
        }
        self
    }

    pub fn with_client_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.identity = self.identity.with_tags(tags);
        self
    }

    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = authentication;
        self
    }

    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Commands the server may route here before waiting for more permits. At least 16.
    pub fn with_command_permits(mut self, permits: PermitCount) -> Self {
        self.command_permits = PermitCount::max(permits, self::permits(MINIMUM_PERMITS));
        self
    }

    /// Queries the server may route here before waiting for more permits. At least 16.
    pub fn with_query_permits(mut self, permits: PermitCount) -> Self {
        self.query_permits = PermitCount::max(permits, self::permits(MINIMUM_PERMITS));
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat = Some((interval, timeout));
        self
    }

    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = None;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: BackoffPolicyOptions) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_tick_frequency(mut self, tick_frequency: Duration) -> Self {
        self.tick_frequency = tick_frequency;
        self
    }

    /// How often registered event processors report their status. Zero is ignored.
    pub fn with_event_processor_update_frequency(mut self, frequency: Duration) -> Self {
        if !frequency.is_zero() {
            self.event_processor_update_frequency = frequency;
        }
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = ids;
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn routing_servers(&self) -> &[ServerEndpoint] {
        &self.routing_servers
    }

    pub fn command_permits(&self) -> PermitCount {
        self.command_permits
    }

    pub fn query_permits(&self) -> PermitCount {
        self.query_permits
    }

    pub fn heartbeat(&self) -> Option<(Duration, Duration)> {
        self.heartbeat
    }

    pub fn event_processor_update_frequency(&self) -> Duration {
        self.event_processor_update_frequency
    }
}

/// Batch size permits are refilled in: a quarter of the initial grant.
pub(crate) fn refill_batch(permits: PermitCount) -> PermitCount {
    PermitCount::new(permits.value() / 4).unwrap_or(PermitCount::MIN)
}

/// On-disk connector configuration (`~/.config/axon/connector.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    pub component_name: String,
    /// Generated per process when absent.
    pub client_instance_id: Option<String>,
    pub context: String,
    pub servers: Vec<String>,
    pub token: Option<String>,
    pub tls: bool,
    pub tags: HashMap<String, String>,
    pub connect_timeout_ms: u64,
    pub command_permits: i64,
    pub query_permits: i64,
    pub heartbeat_enabled: bool,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_maximum_backoff_ms: u64,
    pub reconnect_backoff_multiplier: f64,
    pub tick_frequency_ms: u64,
    pub event_processor_update_frequency_ms: u64,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            component_name: "axon-client".to_string(),
            client_instance_id: None,
            context: "default".to_string(),
            servers: vec![ServerEndpoint::default().to_string()],
            token: None,
            tls: false,
            tags: HashMap::new(),
            connect_timeout_ms: 10_000,
            command_permits: DEFAULT_PERMITS,
            query_permits: DEFAULT_PERMITS,
            heartbeat_enabled: true,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 15_000,
            reconnect_initial_backoff_ms: 500,
            reconnect_maximum_backoff_ms: 30_000,
            reconnect_backoff_multiplier: 2.0,
            tick_frequency_ms: 100,
            event_processor_update_frequency_ms: 2_000,
        }
    }
}

impl ConnectorConfig {
    /// Returns the config directory path (~/.config/axon)
    pub fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config").join("axon"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("connector.toml"))
    }

    /// Loads the config from the default path, or defaults when there is none.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// A commented template holding the defaults.
    pub fn default_toml() -> String {
        let defaults = Self::default();
        format!(
            r#"# AxonServer connector configuration

# Name this application registers under, and this process's instance id.
component_name = "{component}"
# client_instance_id = "orders-1"

context = "{context}"

# Routing servers, tried in order. The port defaults to 8124.
servers = ["{server}"]

# token = "..."
tls = false

connect_timeout_ms = {connect_timeout}

# Messages the server may route here before waiting for more permits (at least 16).
command_permits = {permits}
query_permits = {permits}

heartbeat_enabled = true
heartbeat_interval_ms = {interval}
heartbeat_timeout_ms = {timeout}

reconnect_initial_backoff_ms = {initial}
reconnect_maximum_backoff_ms = {maximum}
reconnect_backoff_multiplier = {multiplier:.1}

tick_frequency_ms = {tick}

# How often registered event processors report their status.
event_processor_update_frequency_ms = {processors}

[tags]
"#,
            component = defaults.component_name,
            context = defaults.context,
            server = defaults.servers.join("\", \""),
            connect_timeout = defaults.connect_timeout_ms,
            permits = defaults.command_permits,
            interval = defaults.heartbeat_interval_ms,
            timeout = defaults.heartbeat_timeout_ms,
            initial = defaults.reconnect_initial_backoff_ms,
            maximum = defaults.reconnect_maximum_backoff_ms,
            multiplier = defaults.reconnect_backoff_multiplier,
            tick = defaults.tick_frequency_ms,
            processors = defaults.event_processor_update_frequency_ms,
        )
    }

    pub fn into_options(self) -> Result<AxonServerConnectorOptions, ConnectorError> {
        let component = ComponentName::new(self.component_name)?;
        let mut options = match self.client_instance_id {
            Some(id) => AxonServerConnectorOptions::for_client(component, ClientInstanceId::new(id)?),
            None => AxonServerConnectorOptions::for_component(component),
        };

        let servers = self
            .servers
            .iter()
            .map(|server| ServerEndpoint::parse(server))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| ConnectorError::Config(err.to_string()))?;
        options = options
            .with_routing_servers(servers)
            .with_client_tags(self.tags)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_command_permits(PermitCount::new(self.command_permits)?)
            .with_query_permits(PermitCount::new(self.query_permits)?)
            .with_reconnect_backoff(BackoffPolicyOptions::new(
                Duration::from_millis(self.reconnect_initial_backoff_ms),
                Duration::from_millis(self.reconnect_maximum_backoff_ms),
                self.reconnect_backoff_multiplier,
            )?)
            .with_tick_frequency(Duration::from_millis(self.tick_frequency_ms))
            .with_event_processor_update_frequency(Duration::from_millis(
                self.event_processor_update_frequency_ms,
            ));

        if let Some(token) = self.token {
            options = options.with_authentication(Authentication::token(token));
        }
        if self.tls {
            options = options.with_tls();
        }
        options = if self.heartbeat_enabled {
            options.with_heartbeat(
                Duration::from_millis(self.heartbeat_interval_ms),
                Duration::from_millis(self.heartbeat_timeout_ms),
            )
        } else {
            options.without_heartbeat()
        };
        Ok(options)
    }
}
