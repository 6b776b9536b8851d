/// Configuration management for piped

use crate::remote::address::BackendAddress;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main piped configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend topology: ordered redundancy groups of backend addresses
    pub servers: Topology,
    /// Optional overflow sink, used when a group has no healthy backend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflow: Option<String>,
    /// Local listener configuration
    pub listen: ListenConfig,
    /// Admin interface configuration
    pub admin: AdminConfig,
    /// Remote pool timing
    pub pool: PoolConfig,
    /// Dispatch and transport tuning
    pub relay: RelayConfig,
    /// External stats collector
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statsd: Option<StatsdConfig>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Ordered list of groups, each an ordered list of backend addresses.
///
/// A flat list in the file (`["a", "b"]`) is a single group and is
/// normalized to `[["a", "b"]]` on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ServersValue", into = "Vec<Vec<String>>")]
pub struct Topology(Vec<Vec<String>>);

#[derive(Deserialize)]
#[serde(untagged)]
enum ServersValue {
    Nested(Vec<Vec<String>>),
    Flat(Vec<String>),
}

impl From<ServersValue> for Topology {
    fn from(value: ServersValue) -> Self {
        match value {
            ServersValue::Nested(groups) => Topology(groups),
            ServersValue::Flat(group) if group.is_empty() => Topology(Vec::new()),
            ServersValue::Flat(group) => Topology(vec![group]),
        }
    }
}

impl From<Topology> for Vec<Vec<String>> {
    fn from(topology: Topology) -> Self {
        topology.0
    }
}

impl Topology {
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        Topology(groups)
    }

    /// Groups in configured order
    pub fn groups(&self) -> &[Vec<String>] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Every `(group index, backend address)` pair, in topology order
    pub fn backends(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0
            .iter()
            .enumerate()
            .flat_map(|(i, group)| group.iter().map(move |name| (i, name.as_str())))
    }
}

/// Local listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// TCP port to accept stream connections on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    /// UDP port to accept datagrams on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    /// Unix domain socket path to accept stream connections on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
    /// Relay standard input
    pub stdin: bool,
    /// Files to tail
    pub files: Vec<PathBuf>,
    /// Address the TCP/UDP listeners bind to
    pub bind_address: String,
    /// Poll interval for tailed files in milliseconds
    pub rescan_interval_ms: u64,
}

/// Admin interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// TCP port, or a unix socket path if it contains any non-digit.
    /// Empty disables the admin interface.
    pub port: String,
    /// Address the admin TCP listener binds to
    pub bind_address: String,
}

/// Remote pool timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Interval between reconnect scans in milliseconds
    pub reconnect_interval_ms: u64,
    /// Interval between live set recomputations in milliseconds
    pub monitor_interval_ms: u64,
    /// Delay after the initial connects before monitors are installed
    pub monitor_delay_ms: u64,
    /// Interval between stats flushes in milliseconds
    pub statsd_interval_ms: u64,
}

/// Dispatch and transport tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Never deliver to the same backend twice within one dispatch
    pub no_duplicates: bool,
    /// Outbound buffered bytes above which a stream backend is slow
    pub max_buffer_size: usize,
    /// Largest UDP datagram payload; bigger payloads are split
    pub udp_max_size: usize,
    /// Text encoding used by the admin interface (ascii, utf8)
    pub encoding: String,
}

/// External stats collector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsdConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
    /// Enable debug output
    pub debug: bool,
    /// Enable trace output, including reconnect chatter
    pub trace: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            tcp_port: None,
            udp_port: None,
            unix_socket: None,
            stdin: false,
            files: Vec::new(),
            bind_address: "127.0.0.1".to_string(),
            rescan_interval_ms: 50,
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: "1338".to_string(),
            bind_address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 1000,
            monitor_interval_ms: 50,
            monitor_delay_ms: 100,
            statsd_interval_ms: 10_000,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            no_duplicates: false,
            max_buffer_size: 1024 * 1024,
            udp_max_size: 512,
            encoding: "ascii".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            debug: false,
            trace: false,
        }
    }
}

impl PoolConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn monitor_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_delay_ms)
    }

    pub fn statsd_interval(&self) -> Duration {
        Duration::from_millis(self.statsd_interval_ms)
    }
}

impl ListenConfig {
    /// True if at least one local listener is configured
    pub fn has_listener(&self) -> bool {
        self.tcp_port.is_some()
            || self.udp_port.is_some()
            || self.unix_socket.is_some()
            || self.stdin
            || !self.files.is_empty()
    }
}

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub debug: bool,
    pub trace: bool,
    /// Each entry is one group, backends separated by commas
    pub servers: Vec<String>,
    pub tcp_port: Option<u16>,
    pub udp_port: Option<u16>,
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with_overrides(path, &ConfigOverrides::default())
    }

    /// Load configuration from TOML file, overlay CLI values, then validate
    pub fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Overlay command line values on top of the file values
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if overrides.debug {
            self.logging.debug = true;
        }
        if overrides.trace {
            self.logging.trace = true;
        }
        if !overrides.servers.is_empty() {
            let groups = overrides
                .servers
                .iter()
                .map(|group| {
                    group
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .collect();
            self.servers = Topology::new(groups);
        }
        if let Some(port) = overrides.tcp_port {
            self.listen.tcp_port = Some(port);
        }
        if let Some(port) = overrides.udp_port {
            self.listen.udp_port = Some(port);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // No servers means fatality; where would we connect to?
        if self.servers.is_empty() {
            return Err(ConfigError::ValidationError(
                "No server entries detected".to_string(),
            ));
        }

        for (i, group) in self.servers.groups().iter().enumerate() {
            if group.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Server group {} has no entries",
                    i
                )));
            }
        }

        for (_, name) in self.servers.backends() {
            name.parse::<BackendAddress>()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        if let Some(overflow) = &self.overflow {
            overflow
                .parse::<BackendAddress>()
                .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        }

        // No ports means fatality: where would traffic come from?
        if !self.listen.has_listener() {
            return Err(ConfigError::ValidationError(
                "No listening sockets detected".to_string(),
            ));
        }

        if self.listen.rescan_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "rescan_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.reconnect_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.monitor_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.statsd.is_some() && self.pool.statsd_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "statsd_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.relay.udp_max_size == 0 {
            return Err(ConfigError::ValidationError(
                "udp_max_size must be greater than 0".to_string(),
            ));
        }

        match self.relay.encoding.as_str() {
            "ascii" | "utf8" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid encoding: {}",
                    self.relay.encoding
                )))
            }
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Build an example configuration for the given listener mode
    pub fn example(mode: &str) -> Result<Self, ConfigError> {
        let config = match mode {
            "tcp" => Config {
                servers: Topology::new(vec![
                    vec![
                        "tcp://10.0.1.10:5140".to_string(),
                        "tcp://10.0.1.11:5140".to_string(),
                    ],
                    vec![
                        "socket:///var/run/collector.sock".to_string(),
                        "file:///var/log/piped/fallback.log".to_string(),
                    ],
                ]),
                overflow: Some("file:///var/log/piped/overflow.log".to_string()),
                listen: ListenConfig {
                    tcp_port: Some(1337),
                    ..Default::default()
                },
                ..Default::default()
            },
            "udp" => Config {
                servers: Topology::new(vec![
                    vec!["udp://10.0.1.20:8125".to_string()],
                    vec![
                        "udp://10.0.1.21:8125".to_string(),
                        "udp://10.0.1.22:8125".to_string(),
                    ],
                ]),
                listen: ListenConfig {
                    udp_port: Some(8125),
                    ..Default::default()
                },
                relay: RelayConfig {
                    no_duplicates: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'tcp' or 'udp'".to_string(),
                ))
            }
        };

        Ok(config)
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        Self::example(mode)?.save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_has_no_servers() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Validation error: No server entries detected");
    }

    #[test]
    fn test_example_configs_are_valid() {
        assert!(Config::example("tcp").unwrap().validate().is_ok());
        assert!(Config::example("udp").unwrap().validate().is_ok());
        assert!(Config::example("carrier-pigeon").is_err());
    }

    #[test]
    fn test_flat_server_list_is_normalized() {
        let config: Config = toml::from_str(
            r#"
            servers = ["tcp://localhost:10001", "udp://localhost:10002"]
            [listen]
            tcp_port = 1337
            "#,
        )
        .unwrap();

        assert_eq!(config.servers.len(), 1);
        assert_eq!(
            config.servers.groups()[0],
            vec!["tcp://localhost:10001", "udp://localhost:10002"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_server_list() {
        let config: Config = toml::from_str(
            r#"
            servers = [["tcp://a:1", "tcp://a:2"], ["stdout"]]
            [listen]
            udp_port = 1337
            "#,
        )
        .unwrap();

        assert_eq!(config.servers.len(), 2);
        let pairs: Vec<(usize, &str)> = config.servers.backends().collect();
        assert_eq!(pairs, vec![(0, "tcp://a:1"), (0, "tcp://a:2"), (1, "stdout")]);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::example("tcp").unwrap();

        config.listen.tcp_port = None;
        assert!(config.validate().is_err());

        config.listen.stdin = true;
        assert!(config.validate().is_ok());

        config.relay.udp_max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_backend_is_rejected() {
        let mut config = Config::example("tcp").unwrap();
        config.servers = Topology::new(vec![vec!["gopher://old.host".to_string()]]);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Unknown server type 'gopher'"));
    }

    #[test]
    fn test_empty_group_is_rejected() {
        let mut config = Config::example("udp").unwrap();
        config.servers = Topology::new(vec![vec!["stdout".to_string()], vec![]]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            servers = ["tcp://localhost:10001"]
            [listen]
            tcp_port = 1337
            "#
        )
        .unwrap();

        let overrides = ConfigOverrides {
            trace: true,
            servers: vec![
                "tcp://a:1, tcp://a:2".to_string(),
                "udp://b:3".to_string(),
            ],
            udp_port: Some(9000),
            ..Default::default()
        };

        let config = Config::load_with_overrides(file.path(), &overrides).unwrap();
        assert!(config.logging.trace);
        assert!(!config.logging.debug);
        assert_eq!(config.listen.tcp_port, Some(1337));
        assert_eq!(config.listen.udp_port, Some(9000));
        assert_eq!(
            config.servers.groups(),
            &[
                vec!["tcp://a:1".to_string(), "tcp://a:2".to_string()],
                vec!["udp://b:3".to_string()]
            ]
        );
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::example("tcp").unwrap();
        let temp_file = NamedTempFile::new().unwrap();

        // Test save and load
        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.servers, config.servers);
        assert_eq!(loaded_config.overflow, config.overflow);
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_file("/nonexistent/piped.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
