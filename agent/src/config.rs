//! Agent configuration file for `portway start`.
//!
//! A TOML file describing the relay endpoint plus any number of tunnels,
//! each run concurrently with its own reconnect loop:
//!
//! ```toml
//! relay_url = "ws://relay.example.com/relay"
//! token = "secret"
//!
//! [[tunnels]]
//! name = "web"
//! protocol = "http"
//! subdomain = "app"
//! allowlist = ["10.0.0.0/8"]
//! local_url = "http://localhost:8081"
//!
//! [[tunnels]]
//! name = "ssh"
//! protocol = "tcp"
//! external_port = 25000
//! local_host = "localhost"
//! local_port = 22
//! ```

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// Top-level agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay_url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub tunnels: Vec<Tunnel>,
}

/// One configured tunnel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Tunnel {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub external_port: u16,
    #[serde(default)]
    pub local_url: String,
    #[serde(default)]
    pub local_host: String,
    #[serde(default)]
    pub local_port: u16,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_url.trim().is_empty() {
            return Err(ConfigError::Invalid("relay_url required".to_string()));
        }
        if self.tunnels.is_empty() {
            return Err(ConfigError::Invalid("at least one tunnel required".to_string()));
        }
        for (idx, tunnel) in self.tunnels.iter().enumerate() {
            match tunnel.protocol.trim().to_lowercase().as_str() {
                "http" => {
                    if tunnel.subdomain.trim().is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "tunnels[{idx}].subdomain required"
                        )));
                    }
                    if tunnel.local_url.trim().is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "tunnels[{idx}].local_url required"
                        )));
                    }
                }
                "tcp" | "udp" => {
                    if tunnel.external_port == 0 {
                        return Err(ConfigError::Invalid(format!(
                            "tunnels[{idx}].external_port required"
                        )));
                    }
                    if tunnel.local_host.trim().is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "tunnels[{idx}].local_host required"
                        )));
                    }
                    if tunnel.local_port == 0 {
                        return Err(ConfigError::Invalid(format!(
                            "tunnels[{idx}].local_port required"
                        )));
                    }
                }
                "" => {
                    return Err(ConfigError::Invalid(format!(
                        "tunnels[{idx}].protocol required"
                    )));
                }
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "tunnels[{idx}].protocol invalid"
                    )));
                }
            }
        }
        Ok(())
    }
}
