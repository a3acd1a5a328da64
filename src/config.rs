//! Server configuration
//!
//! A JSON config file (optional) overlaid by command-line flags, then
//! validated into `ServerSettings`. Every failure here is fatal and
//! happens before the listener is bound.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::TextEncoding;
use crate::error::ConfigError;
use crate::schema::SchemaSet;

/// Operational port range (inclusive)
pub const PORT_RANGE: std::ops::RangeInclusive<u16> = 1024..=49151;

/// Command-line arguments
#[derive(Parser, Debug, Clone)]
#[command(name = "presence_chat")]
#[command(about = "JSON chat server with presence handshake and broadcast", long_about = None)]
pub struct Cli {
    /// Path to a JSON config file
    #[arg(short = 'c', long, env = "CONFIG_PATH")]
    pub config: Option<PathBuf>,

    /// IP address or 'localhost' to bind to
    #[arg(short = 'a', long = "addr")]
    pub addr: Option<String>,

    /// Port in range 1024-49151
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Replacement schema files; built-in schemas are used where absent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaPaths {
    pub presence: Option<PathBuf>,
    pub msg: Option<PathBuf>,
}

/// Raw configuration as read from file and flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bind address: an IP address or `localhost`
    pub address: String,
    pub port: u16,
    /// Listen backlog
    pub listen: u32,
    /// How long one accept attempt may wait while clients are connected
    pub accept_timeout_ms: u64,
    /// Upper bound of the readiness wait
    #[serde(alias = "select_wait_ms")]
    pub poll_interval_ms: u64,
    /// Window for a new connection to deliver its presence
    pub handshake_timeout_ms: u64,
    /// Maximum single-message size in bytes
    pub input_limit: usize,
    /// Wire text encoding
    pub encoding: String,
    pub schema: SchemaPaths,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 7777,
            listen: 5,
            accept_timeout_ms: 50,
            poll_interval_ms: 1000,
            handshake_timeout_ms: 500,
            input_limit: 1024,
            encoding: "utf-8".to_string(),
            schema: SchemaPaths::default(),
        }
    }
}

/// Validated settings consumed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    pub backlog: u32,
    pub accept_timeout: Duration,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub input_limit: usize,
    pub encoding: TextEncoding,
}

impl Config {
    /// Parse config JSON
    ///
    /// A document with `general` and/or `server` sections is flattened,
    /// `server` keys overriding `general` ones. A flat object is used as is.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let document: Value = serde_json::from_str(text)?;
        let sectioned = document.get("general").is_some() || document.get("server").is_some();
        if !sectioned {
            return serde_json::from_value(document);
        }

        let mut merged = serde_json::Map::new();
        for section in ["general", "server"] {
            if let Some(Value::Object(fields)) = document.get(section) {
                merged.extend(fields.clone());
            }
        }
        serde_json::from_value(Value::Object(merged))
    }

    /// Read a config file; relative schema paths resolve against its directory
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for schema in [&mut config.schema.presence, &mut config.schema.msg]
            .into_iter()
            .flatten()
        {
            if schema.is_relative() {
                *schema = base.join(&*schema);
            }
        }
        Ok(config)
    }

    /// Config file (if any) with command-line overrides applied
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(addr) = &cli.addr {
            config.address = addr.clone();
        }
        if let Some(port) = cli.port {
            config.port = port;
        }
        Ok(config)
    }

    /// Check every field and resolve it into `ServerSettings`
    pub fn validate(&self) -> Result<ServerSettings, ConfigError> {
        let ip = match self.address.as_str() {
            "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
            other => other
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidAddress(other.to_string()))?,
        };

        if !PORT_RANGE.contains(&self.port) {
            return Err(ConfigError::PortOutOfRange(self.port));
        }

        let poll_interval = Duration::from_millis(self.poll_interval_ms);
        let handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        if poll_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("poll interval"));
        }
        if handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake timeout"));
        }
        if handshake_timeout >= poll_interval {
            return Err(ConfigError::HandshakeTooLong {
                handshake: handshake_timeout,
                poll: poll_interval,
            });
        }

        if self.input_limit == 0 {
            return Err(ConfigError::ZeroInputLimit);
        }

        Ok(ServerSettings {
            bind_addr: SocketAddr::new(ip, self.port),
            backlog: self.listen.max(1),
            accept_timeout: Duration::from_millis(self.accept_timeout_ms),
            poll_interval,
            handshake_timeout,
            input_limit: self.input_limit,
            encoding: self.encoding.parse()?,
        })
    }

    /// Load the presence and chat message schemas
    pub fn load_schemas(&self) -> Result<SchemaSet, ConfigError> {
        Ok(SchemaSet::load(
            self.schema.presence.as_deref(),
            self.schema.msg.as_deref(),
        )?)
    }
}
