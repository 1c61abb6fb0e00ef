//! TOML configuration for the server binary.
//!
//! A missing config file is not an error: a commented default template
//! is written in its place so operators can edit it, and the defaults
//! are used for the current run.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub options: OptionsConfig,
    #[serde(default)]
    pub certs: CertsConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_true")]
    pub log_debug: bool,
}

/// XMPP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub ip: String,
    #[serde(default = "default_xmpp_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: default_bind(),
            port: default_xmpp_port(),
        }
    }
}

/// Identity settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Serving domain when the certificate does not provide one
    #[serde(default = "default_domain")]
    pub domain: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
        }
    }
}

/// Protocol behavior knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct OptionsConfig {
    /// Subdomain label for the multi-user chat service
    #[serde(default = "default_muc_name")]
    pub muc_name: String,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            muc_name: default_muc_name(),
        }
    }
}

/// Certificate material. All paths optional; the server runs degraded
/// (plaintext STARTTLS) when any piece is missing or invalid.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CertsConfig {
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca_bundle: Option<PathBuf>,
}

/// Admin HTTP API listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_bind")]
    pub ip: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            ip: default_bind(),
            port: default_admin_port(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_xmpp_port() -> u16 {
    5222
}

fn default_admin_port() -> u16 {
    9000
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_muc_name() -> String {
    "muc".to_string()
}

/// Default config template written when no file exists.
const DEFAULT_TEMPLATE: &str = r#"# Partyline server configuration

[server]
ip = "0.0.0.0"
port = 5222

[host]
# Used when no certificate supplies a domain
domain = "localhost"

[options]
muc_name = "muc"

[certs]
# Uncomment to enable real TLS for STARTTLS upgrades.
# key = "certs/private.key"
# cert = "certs/certificate.crt"
# ca_bundle = "certs/ca_bundle.crt"

[admin]
ip = "0.0.0.0"
port = 9000

log_debug = true
"#;

impl Config {
    /// Load the config from `path`, writing the default template first
    /// if no file exists there yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(path, DEFAULT_TEMPLATE)?;
            info!(path = %path.display(), "Created default config file");
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.admin.port == 0 {
            return Err(ConfigError::Invalid("admin.port must be non-zero".into()));
        }
        if self.server.ip == self.admin.ip && self.server.port == self.admin.port {
            return Err(ConfigError::Invalid(
                "server and admin listeners cannot share an address".into(),
            ));
        }
        Ok(())
    }

    /// XMPP listener address.
    pub fn xmpp_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.ip, self.server.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("server address: {}", e)))
    }

    /// Admin API listener address.
    pub fn admin_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.admin.ip, self.admin.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("admin address: {}", e)))
    }
}
