use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use conn_limiter::LimiterOptions;
use tracing::warn;
use upstream::{ConnectorConfig, TorProxy};
use ws_bridge::relay::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_READ_BUFFER_SIZE};
use ws_bridge::{GatewayConfig, RelayConfig};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub tor: TorConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub relay: RelaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen")]
    pub listen_addr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TorConfig {
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            proxy_host: default_proxy_host(),
            proxy_port: default_proxy_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AdmissionConfig {
    /// Empty disables the origin check.
    #[serde(default)]
    pub origin_allowlist: Vec<String>,
    #[serde(default = "default_points")]
    pub points: u32,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
    /// How often expired limiter windows are evicted.
    #[serde(default = "default_sweep_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            origin_allowlist: Vec::new(),
            points: default_points(),
            duration_secs: default_duration_secs(),
            sweep_interval_secs: default_sweep_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RelaySettings {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            max_message_size: default_max_message_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Default-value functions used by serde
// ---------------------------------------------------------------------------

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_proxy_host() -> String {
    "localhost".to_string()
}

fn default_proxy_port() -> u16 {
    9050
}

fn default_points() -> u32 {
    10
}

fn default_duration_secs() -> u64 {
    1
}

fn default_sweep_secs() -> u64 {
    60
}

fn default_read_buffer_size() -> usize {
    DEFAULT_READ_BUFFER_SIZE
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Conversions into the library configuration types
// ---------------------------------------------------------------------------

impl Config {
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let listen_addr: SocketAddr = self
            .network
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.network.listen_addr))?;

        anyhow::ensure!(
            self.relay.read_buffer_size > 0,
            "relay.read_buffer_size must be greater than zero"
        );
        anyhow::ensure!(
            self.relay.max_message_size > 0,
            "relay.max_message_size must be greater than zero"
        );
        anyhow::ensure!(
            self.relay.connect_timeout_secs > 0,
            "relay.connect_timeout_secs must be greater than zero"
        );

        Ok(GatewayConfig {
            listen_addr,
            origin_allowlist: self.admission.origin_allowlist.clone(),
            connector: ConnectorConfig {
                tor_proxy: TorProxy {
                    host: self.tor.proxy_host.clone(),
                    port: self.tor.proxy_port,
                },
                connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
            },
            relay: RelayConfig {
                read_buffer_size: self.relay.read_buffer_size,
                max_message_size: self.relay.max_message_size,
            },
        })
    }

    pub fn limiter_options(&self) -> anyhow::Result<LimiterOptions> {
        anyhow::ensure!(self.admission.points > 0, "admission.points must be greater than zero");
        anyhow::ensure!(
            self.admission.duration_secs > 0,
            "admission.duration_secs must be greater than zero"
        );

        Ok(LimiterOptions::default()
            .with_points(self.admission.points)
            .with_duration(Duration::from_secs(self.admission.duration_secs)))
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load configuration from a YAML file.
///
/// A missing file yields the default configuration and a warning, so the
/// gateway runs out of the box.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "configuration file not found; using defaults"
        );
        return Ok(Config::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let config: Config = serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load(Path::new("/nonexistent/ws-gateway/config.yaml")).unwrap();
        assert_eq!(config.network.listen_addr, "127.0.0.1:8080");
        assert_eq!(config.tor.proxy_host, "localhost");
        assert_eq!(config.tor.proxy_port, 9050);
        assert!(config.admission.origin_allowlist.is_empty());
        assert_eq!(config.admission.points, 10);
        assert_eq!(config.admission.duration_secs, 1);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_the_rest() {
        let config: Config = serde_yml::from_str(
            "tor:\n  proxy_port: 9150\nadmission:\n  origin_allowlist:\n    - https://wallet.example\n",
        )
        .unwrap();

        assert_eq!(config.tor.proxy_host, "localhost");
        assert_eq!(config.tor.proxy_port, 9150);
        assert_eq!(config.admission.origin_allowlist, vec!["https://wallet.example"]);
        assert_eq!(config.admission.points, 10);
        assert_eq!(config.relay.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn converts_into_gateway_config() {
        let config: Config = serde_yml::from_str(
            "network:\n  listen_addr: 0.0.0.0:9000\nrelay:\n  connect_timeout_secs: 3\n  max_message_size: 1024\n",
        )
        .unwrap();

        let gateway = config.gateway_config().unwrap();
        assert_eq!(gateway.listen_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(gateway.connector.tor_proxy.port, 9050);
        assert_eq!(gateway.connector.connect_timeout, Duration::from_secs(3));
        assert_eq!(gateway.relay.max_message_size, 1024);

        let options = config.limiter_options().unwrap();
        assert_eq!(options.points, 10);
        assert_eq!(options.duration, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.network.listen_addr = "not-an-addr".to_string();
        assert!(config.gateway_config().is_err());

        let mut config = Config::default();
        config.admission.points = 0;
        assert!(config.limiter_options().is_err());
    }

    #[test]
    fn zero_relay_limits_are_rejected() {
        let config: Config = serde_yml::from_str("relay:\n  connect_timeout_secs: 0\n").unwrap();
        let err = config.gateway_config().unwrap_err();
        assert!(err.to_string().contains("connect_timeout_secs"));

        let config: Config = serde_yml::from_str("relay:\n  max_message_size: 0\n").unwrap();
        let err = config.gateway_config().unwrap_err();
        assert!(err.to_string().contains("max_message_size"));
    }
}
