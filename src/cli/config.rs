//! Courier configuration file handling
//!
//! Configuration files are TOML. `[homeserver]` and `[appservice]` are
//! required; every other section falls back to defaults when missing.

use courier::bridge::ReconnectConfig;
use courier::matrix::{AppserviceConfig, GhostNamespace, USERID_PLACEHOLDER};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_PORT: u16 = 29330;
const DEFAULT_USERNAME_TEMPLATE: &str = "courier_{userid}";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    pub homeserver: HomeserverConfig,

    pub appservice: AppserviceSection,

    #[serde(default)]
    pub bridge: BridgeSection,

    #[serde(default)]
    pub service: ServiceSection,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeserverConfig {
    /// Client-server API base URL
    pub address: String,

    /// Server name used in user IDs
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppserviceSection {
    #[serde(default = "default_appservice_id")]
    pub id: String,

    /// Interface the transaction listener binds to
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// URL the homeserver uses to reach the listener
    #[serde(default = "default_appservice_address")]
    pub address: String,

    pub as_token: String,

    pub hs_token: String,

    #[serde(default = "default_bot_username")]
    pub bot_username: String,

    #[serde(default = "default_bot_displayname")]
    pub bot_displayname: String,

    /// sqlx connection URL
    #[serde(default = "default_database")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Localpart template for ghost users; must contain `{userid}`
    #[serde(default = "default_username_template")]
    pub username_template: String,

    /// Send a bridge info notice to every logged-in user on startup
    #[serde(default)]
    pub resend_bridge_info: bool,

    /// Connect every logged-in user once on startup
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSection {
    /// Base URL of the external login service
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

fn default_appservice_id() -> String {
    "courier".to_string()
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_appservice_address() -> String {
    format!("http://127.0.0.1:{DEFAULT_PORT}")
}

fn default_bot_username() -> String {
    "courierbot".to_string()
}

fn default_bot_displayname() -> String {
    "Courier bridge bot".to_string()
}

fn default_database() -> String {
    "sqlite:courier.db".to_string()
}

fn default_username_template() -> String {
    DEFAULT_USERNAME_TEMPLATE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            username_template: default_username_template(),
            resend_bridge_info: false,
            connect_on_startup: true,
        }
    }
}

impl Default for ServiceSection {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            file: None,
        }
    }
}

impl CourierConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;

        let config: CourierConfig = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file '{}': {}", path.display(), e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if !self.bridge.username_template.contains(USERID_PLACEHOLDER) {
            return Err(format!(
                "bridge.username_template must contain {USERID_PLACEHOLDER}"
            )
            .into());
        }
        if self.homeserver.domain.is_empty() {
            return Err("homeserver.domain must be set".into());
        }
        Ok(())
    }

    pub fn ghost_namespace(&self) -> Result<GhostNamespace, Box<dyn std::error::Error>> {
        Ok(GhostNamespace::new(
            &self.bridge.username_template,
            &self.homeserver.domain,
        )?)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        let addr = format!("{}:{}", self.appservice.hostname, self.appservice.port);
        addr.parse::<SocketAddr>()
            .map_err(|e| format!("Invalid listen address '{addr}': {e}").into())
    }

    pub fn appservice_config(&self) -> AppserviceConfig {
        AppserviceConfig {
            homeserver_url: self.homeserver.address.clone(),
            domain: self.homeserver.domain.clone(),
            as_token: self.appservice.as_token.clone(),
            hs_token: self.appservice.hs_token.clone(),
            bot_localpart: self.appservice.bot_username.clone(),
            bot_displayname: Some(self.appservice.bot_displayname.clone())
                .filter(|name| !name.is_empty()),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.request_timeout_secs)
    }

    /// Generate default configuration content as a string with comments
    pub fn generate_default_toml() -> String {
        format!(
            r#"# Courier bridge configuration

[homeserver]
# Client-server API address of your homeserver
address = "http://localhost:8008"
# Server name, the part after the colon in user IDs
domain = "example.com"

[appservice]
id = "courier"
# Where the bridge listens for homeserver transactions
hostname = "127.0.0.1"
port = {DEFAULT_PORT}
# How the homeserver reaches the bridge
address = "http://127.0.0.1:{DEFAULT_PORT}"
# Filled in by `courier generate-registration`
as_token = ""
hs_token = ""
bot_username = "courierbot"
bot_displayname = "Courier bridge bot"
database = "sqlite:courier.db"

[bridge]
# Localpart template for ghost users, must contain {{userid}}
username_template = "{DEFAULT_USERNAME_TEMPLATE}"
resend_bridge_info = false
connect_on_startup = true

[service]
# External login service
api_url = "http://localhost:8080"
request_timeout_secs = 30

[reconnect]
# Seconds between reconnect passes, 0 disables
interval = 0
# Reconnect users that are not currently connected
always = false
# Request a full resync on reconnect
resync = false

[logging]
# Log level: trace, debug, info, warn, error
level = "{DEFAULT_LOG_LEVEL}"

# Log file path (optional, logs to stderr if not specified)
# file = "/var/log/courier/courier.log"
"#
        )
    }

    /// Create and save a default configuration file
    pub fn create_default(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }

        fs::write(config_path, Self::generate_default_toml()).map_err(|e| {
            format!(
                "Failed to write config file '{}': {}",
                config_path.display(),
                e
            )
        })?;

        Ok(())
    }
}

/// Default config location: `<data dir>/courier/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("courier")
        .join("config.toml")
}
