//! Relay configuration file (`.json`, `.yaml` or `.yml`).
//!
//! ```yaml
//! source:
//!   host: 192.168.56.123
//!   port: "22"
//!   user: user
//!   privateKeyFile: /home/user/.ssh/id_ed25519
//!   hostKey: { policy: pinned, fingerprints: ["SHA256:…"] }
//!   path: /home/user/file_src.txt
//! target:
//!   host: 192.168.56.124
//!   user: user
//!   password: hunter2
//!   hostKey: { policy: knownHosts, path: /home/user/.ssh/known_hosts }
//!   path: /home/user/file_tgt.txt
//! chunkSize: 1048576
//! ```

use anyhow::{anyhow, bail, Context, Result};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use sorng_relay::relay::{
    default_chunk_size, default_connect_timeout_secs, AuthMethod, ConnectionDescriptor,
    HostKeyPolicy, KeySource, RelayEndpoint, DEFAULT_SSH_PORT,
};
use std::path::{Path, PathBuf};

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Top-level file layout.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelayConfig {
    pub source: EndpointConfig,
    pub target: EndpointConfig,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Overall budget for the whole relay, unlimited when absent.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_port", deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub private_key_file: Option<PathBuf>,
    /// Key text inline; mutually exclusive with `privateKeyFile`.
    #[serde(default)]
    pub private_key: Option<SecretString>,
    #[serde(default)]
    pub passphrase: Option<SecretString>,
    #[serde(default)]
    pub password: Option<SecretString>,
    pub host_key: HostKeyPolicy,
    pub path: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u64),
    Text(String),
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = match PortValue::deserialize(deserializer)? {
        PortValue::Number(n) => n,
        PortValue::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{}'", s)))?,
    };
    match u16::try_from(raw) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(serde::de::Error::custom(format!(
            "port {} is out of range 1-65535",
            raw
        ))),
    }
}

impl EndpointConfig {
    fn validate(&self, side: &str) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("{}.host must not be empty", side);
        }
        if self.user.trim().is_empty() {
            bail!("{}.user must not be empty", side);
        }
        if self.path.trim().is_empty() {
            bail!("{}.path must not be empty", side);
        }
        let methods = [
            self.private_key_file.is_some(),
            self.private_key.is_some(),
            self.password.is_some(),
        ];
        match methods.iter().filter(|m| **m).count() {
            0 => bail!(
                "{} needs one of privateKeyFile, privateKey or password",
                side
            ),
            1 => {}
            _ => bail!(
                "{}: privateKeyFile, privateKey and password are mutually exclusive",
                side
            ),
        }
        if self.passphrase.is_some() && self.password.is_some() {
            bail!("{}.passphrase only applies to key authentication", side);
        }
        Ok(())
    }

    fn auth(&self) -> Result<AuthMethod> {
        let key = match (&self.private_key_file, &self.private_key) {
            (Some(path), None) => KeySource::File(path.clone()),
            (None, Some(text)) => KeySource::Inline(text.clone()),
            _ => {
                return self
                    .password
                    .clone()
                    .map(AuthMethod::Password)
                    .ok_or_else(|| anyhow!("no authentication method configured"))
            }
        };
        Ok(AuthMethod::PublicKey {
            key,
            passphrase: self.passphrase.clone(),
        })
    }

    pub fn to_endpoint(&self) -> Result<RelayEndpoint> {
        let descriptor = ConnectionDescriptor {
            host: self.host.trim().to_string(),
            port: self.port,
            username: self.user.clone(),
            auth: self.auth()?,
        };
        Ok(RelayEndpoint::new(descriptor, self.host_key.clone()))
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        self.source.validate("source")?;
        self.target.validate("target")?;
        if self.chunk_size == 0 {
            bail!("chunkSize must be greater than 0");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connectTimeoutSecs must be greater than 0");
        }
        Ok(())
    }
}

/// Parse config text. `ext` picks the format; anything but yaml/yml is JSON.
pub fn parse_config(text: &str, ext: &str) -> Result<RelayConfig> {
    let config: RelayConfig = match ext.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(text).context("Invalid YAML relay config")?,
        "json" => serde_json::from_str(text).context("Invalid JSON relay config")?,
        other => bail!("Unsupported config extension '{}' (use .json, .yaml or .yml)", other),
    };
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Unable to read config file '{}'", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    parse_config(&text, ext).with_context(|| format!("Config file '{}'", path.display()))
}
