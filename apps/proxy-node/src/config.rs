use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 10051;

/// Settings read from the optional config file and `PROXY_NODE__*` variables.
/// Command line options override whatever is found here.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSettings {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Comma separated servers: push targets of an active proxy, allowed
    /// pollers of a passive one.
    #[serde(default)]
    pub servers: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_recv_size")]
    pub max_recv_size: u64,
    #[serde(default = "default_config_frequency_secs")]
    pub config_frequency_secs: u64,
    #[serde(default = "default_one_second")]
    pub data_frequency_secs: u64,
    #[serde(default = "default_one_second")]
    pub tasks_frequency_secs: u64,
    #[serde(default = "default_one_second")]
    pub sender_frequency_secs: u64,
    #[serde(default = "default_true")]
    pub compress: bool,
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// Proxies a server knows about.
    #[serde(default)]
    pub proxies: Vec<ProxyEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyEntry {
    pub name: String,
    #[serde(default = "default_proxy_mode")]
    pub mode: String,
    #[serde(default)]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_addresses: Vec<String>,
}

impl FileSettings {
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(config::Environment::with_prefix("PROXY_NODE").separator("__"))
            .build()?
            .try_deserialize()
    }

    #[cfg(test)]
    fn from_toml(text: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}

fn default_role() -> String {
    "server".to_string()
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_PORT}")
}

fn default_timeout_secs() -> u64 {
    3
}

fn default_max_recv_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_config_frequency_secs() -> u64 {
    10
}

fn default_one_second() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_session_idle_secs() -> u64 {
    24 * 60 * 60
}

fn default_proxy_mode() -> String {
    "active".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
