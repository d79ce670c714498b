//! Configuration management
//!
//! Sources, lowest precedence first: built-in defaults, an optional TOML
//! file (`SIPCORE_CONFIG`, else `config/sipcore.toml`), then environment
//! variables such as `SIPCORE__SIP__REALM=example.com`.

use crate::domain::access_control::{AccessConfig, FloodConfig};
use crate::infrastructure::protocols::sip::{
    ListenEndpoint, RegistrarConfig, RelayConfig, RouterConfig, SipServerConfig,
    TransactionConfig, TransportProtocol,
};
use crate::infrastructure::tls::TlsConfig;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "SIPCORE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "config/sipcore.toml";
const ENV_PREFIX: &str = "SIPCORE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sip: SipConfig,
    pub transaction: TransactionSettings,
    pub registrar: RegistrarSettings,
    pub auth: AuthConfig,
    pub security: SecurityConfig,
    pub tls: TlsConfig,
    pub database: DatabaseSettings,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub listen: Vec<ListenEndpoint>,
    /// Host placed in Via and Record-Route
    pub advertised_address: String,
    pub realm: String,
    pub local_domains: Vec<String>,
    pub max_forwards: u32,
    pub relay_foreign_domains: bool,
}

impl Default for SipConfig {
    fn default() -> Self {
        let any: IpAddr = [0, 0, 0, 0].into();
        Self {
            listen: vec![
                ListenEndpoint::new(TransportProtocol::Udp, SocketAddr::new(any, 5060)),
                ListenEndpoint::new(TransportProtocol::Tcp, SocketAddr::new(any, 5060)),
            ],
            advertised_address: "127.0.0.1".to_string(),
            realm: "localhost".to_string(),
            local_domains: vec!["localhost".to_string()],
            max_forwards: 70,
            relay_foreign_domains: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    pub retention_secs: u64,
    pub timeout_secs: u64,
    pub max_transactions: usize,
    pub sweep_interval_ms: u64,
}

impl Default for TransactionSettings {
    fn default() -> Self {
        Self {
            retention_secs: 32,
            timeout_secs: 32,
            max_transactions: 100_000,
            sweep_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarSettings {
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    pub reaper_interval_secs: u64,
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        let bounds = RegistrarConfig::default();
        Self {
            default_expires: bounds.default_expires,
            min_expires: bounds.min_expires,
            max_expires: bounds.max_expires,
            reaper_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Challenge REGISTER requests
    pub enabled: bool,
    pub nonce_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            nonce_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodSettings {
    pub enabled: bool,
    pub sampling_secs: i64,
    pub max_requests: usize,
    pub block_secs: i64,
    pub max_tracked: usize,
}

impl Default for FloodSettings {
    fn default() -> Self {
        let flood = FloodConfig::default();
        Self {
            enabled: flood.enabled,
            sampling_secs: flood.sampling_secs,
            max_requests: flood.max_requests,
            block_secs: flood.block_secs,
            max_tracked: flood.max_tracked,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// CIDR ranges; empty admits every source
    pub allowed_networks: Vec<String>,
    pub blocked_ips: Vec<IpAddr>,
    /// CIDR ranges exempt from flood and brute-force limits
    pub trusted_networks: Vec<String>,
    pub flood: FloodSettings,
    pub max_auth_failures: usize,
    pub auth_failure_window_secs: i64,
    pub auth_failure_block_secs: i64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        let access = AccessConfig::default();
        Self {
            allowed_networks: Vec::new(),
            blocked_ips: Vec::new(),
            trusted_networks: Vec::new(),
            flood: FloodSettings::default(),
            max_auth_failures: access.max_auth_failures,
            auth_failure_window_secs: access.auth_failure_window_secs,
            auth_failure_block_secs: access.auth_failure_block_secs,
        }
    }
}

/// Database connection; without a URL the in-memory stores are used
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 2,
            connect_timeout_secs: 5,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: SocketAddr::new([127, 0, 0, 1].into(), 8080),
        }
    }
}

impl Config {
    /// Load from the file named by `SIPCORE_CONFIG` (which must exist) or
    /// the optional default file, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => config::File::with_name(&path),
            Err(_) => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        let builder = config::Config::builder()
            .add_source(file)
            .add_source(Self::environment());
        Self::from_builder(builder)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("sip.local_domains")
            .with_list_parse_key("security.allowed_networks")
            .with_list_parse_key("security.trusted_networks")
            .with_list_parse_key("security.blocked_ips")
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sip.listen.is_empty() {
            return Err(ConfigError::Invalid("no listen endpoint".to_string()));
        }
        let has_tls = self
            .sip
            .listen
            .iter()
            .any(|e| e.protocol == TransportProtocol::Tls);
        if has_tls {
            self.tls
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("TLS endpoint: {}", e)))?;
        }
        if self.registrar.min_expires > self.registrar.max_expires {
            return Err(ConfigError::Invalid(format!(
                "min_expires {} exceeds max_expires {}",
                self.registrar.min_expires, self.registrar.max_expires
            )));
        }
        if self.sip.max_forwards == 0 {
            return Err(ConfigError::Invalid("max_forwards must be positive".to_string()));
        }
        parse_networks(&self.security.allowed_networks)?;
        parse_networks(&self.security.trusted_networks)?;
        Ok(())
    }

    /// Whether any endpoint serves TLS
    pub fn needs_tls(&self) -> bool {
        self.sip
            .listen
            .iter()
            .any(|e| e.protocol == TransportProtocol::Tls)
    }

    pub fn server_config(&self) -> SipServerConfig {
        let port_of = |protocol: TransportProtocol| {
            self.sip
                .listen
                .iter()
                .find(|e| e.protocol == protocol)
                .map(|e| e.address.port())
                .unwrap_or_else(|| protocol.default_port())
        };

        let mut local_domains = self.sip.local_domains.clone();
        if !local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&self.sip.realm))
        {
            local_domains.push(self.sip.realm.clone());
        }

        SipServerConfig {
            listen: self.sip.listen.clone(),
            relay: RelayConfig {
                advertised_host: self.sip.advertised_address.clone(),
                udp_port: port_of(TransportProtocol::Udp),
                tcp_port: port_of(TransportProtocol::Tcp),
                tls_port: port_of(TransportProtocol::Tls),
                local_domains,
            },
            router: RouterConfig {
                max_forwards: self.sip.max_forwards,
                relay_foreign_domains: self.sip.relay_foreign_domains,
            },
            registrar: RegistrarConfig {
                default_expires: self.registrar.default_expires,
                min_expires: self.registrar.min_expires,
                max_expires: self.registrar.max_expires,
            },
            transaction: TransactionConfig {
                retention: Duration::from_secs(self.transaction.retention_secs),
                client_timeout: Duration::from_secs(self.transaction.timeout_secs),
                max_transactions: self.transaction.max_transactions,
                ..TransactionConfig::default()
            },
            sweep_interval: Duration::from_millis(self.transaction.sweep_interval_ms),
            reaper_interval: Duration::from_secs(self.registrar.reaper_interval_secs),
        }
    }

    pub fn access_config(&self) -> Result<AccessConfig, ConfigError> {
        let security = &self.security;
        Ok(AccessConfig {
            allowed_networks: parse_networks(&security.allowed_networks)?,
            blocked_ips: security.blocked_ips.clone(),
            trusted_networks: parse_networks(&security.trusted_networks)?,
            flood: FloodConfig {
                enabled: security.flood.enabled,
                sampling_secs: security.flood.sampling_secs,
                max_requests: security.flood.max_requests,
                block_secs: security.flood.block_secs,
                max_tracked: security.flood.max_tracked,
            },
            max_auth_failures: security.max_auth_failures,
            auth_failure_window_secs: security.auth_failure_window_secs,
            auth_failure_block_secs: security.auth_failure_block_secs,
        })
    }

    #[cfg(feature = "postgres")]
    pub fn database_config(&self) -> Option<crate::infrastructure::persistence::DatabaseConfig> {
        let db = &self.database;
        db.url
            .as_ref()
            .map(|url| crate::infrastructure::persistence::DatabaseConfig {
                url: url.clone(),
                max_connections: db.max_connections,
                min_connections: db.min_connections,
                connect_timeout: Duration::from_secs(db.connect_timeout_secs),
                idle_timeout: Duration::from_secs(db.idle_timeout_secs),
                max_lifetime: Duration::from_secs(db.max_lifetime_secs),
            })
    }
}

fn parse_networks(networks: &[String]) -> Result<Vec<IpNetwork>, ConfigError> {
    networks
        .iter()
        .map(|n| {
            n.trim()
                .parse::<IpNetwork>()
                .map_err(|e| ConfigError::Invalid(format!("network '{}': {}", n, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};
    use std::collections::HashMap;

    fn from_toml(text: &str) -> Result<Config, ConfigError> {
        Config::from_builder(
            config::Config::builder().add_source(File::from_str(text, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sip.max_forwards, 70);
        assert_eq!(config.transaction.retention_secs, 32);
        assert_eq!(config.registrar.default_expires, 3600);
        assert!(!config.auth.enabled);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let config = from_toml(
            r#"
            [sip]
            realm = "example.com"
            advertised_address = "203.0.113.1"
            local_domains = ["example.com"]
            listen = [
                { protocol = "udp", address = "0.0.0.0:5080" },
                { protocol = "tcp", address = "0.0.0.0:5080" },
            ]

            [security]
            allowed_networks = ["10.0.0.0/8"]

            [security.flood]
            max_requests = 32
            "#,
        )
        .unwrap();

        assert_eq!(config.sip.realm, "example.com");
        assert_eq!(config.security.flood.max_requests, 32);
        assert_eq!(config.security.flood.sampling_secs, 2);
        assert_eq!(config.registrar.max_expires, 7200);

        let server = config.server_config();
        assert_eq!(server.relay.udp_port, 5080);
        assert_eq!(server.relay.tls_port, 5061);
        assert_eq!(server.relay.advertised_host, "203.0.113.1");

        let access = config.access_config().unwrap();
        assert_eq!(access.allowed_networks.len(), 1);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<String, String> = [
            ("SIPCORE__SIP__REALM", "env.example.com"),
            ("SIPCORE__AUTH__ENABLED", "true"),
            ("SIPCORE__SIP__LOCAL_DOMAINS", "a.example.com,b.example.com"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::from_builder(
            config::Config::builder().add_source(Config::environment().source(Some(env))),
        )
        .unwrap();

        assert_eq!(config.sip.realm, "env.example.com");
        assert!(config.auth.enabled);
        assert_eq!(config.sip.local_domains.len(), 2);
    }

    #[test]
    fn test_tls_endpoint_requires_certificate() {
        let err = from_toml(
            r#"
            [sip]
            listen = [{ protocol = "tls", address = "0.0.0.0:5061" }]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_bad_bounds_and_networks() {
        let bounds = from_toml(
            r#"
            [registrar]
            min_expires = 600
            max_expires = 60
            "#,
        );
        assert!(matches!(bounds, Err(ConfigError::Invalid(_))));

        let network = from_toml(
            r#"
            [security]
            allowed_networks = ["10.0.0.0/33"]
            "#,
        );
        assert!(matches!(network, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_realm_is_served_locally() {
        let config = Config {
            sip: SipConfig {
                realm: "voip.example.com".to_string(),
                ..SipConfig::default()
            },
            ..Config::default()
        };
        assert!(config
            .server_config()
            .relay
            .is_local_domain("voip.example.com"));
    }
}
