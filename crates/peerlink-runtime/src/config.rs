//! Runtime configuration.
//!
//! [`RuntimeConfig`] is the validated value the runtime is built from.
//! [`ConfigFile`] is the loose on-disk form (JSON or YAML) that environment
//! variables prefixed with [`ENV_PREFIX`] can override key by key:
//!
//! ```yaml
//! peer_id: peer-A
//! bind: tcp://*:5555
//! address_book:
//!   peer-B: tcp://127.0.0.1:5556
//! discovery_interval_s: 2.5
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use peerlink_transport::Endpoint;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tracing::debug;

use crate::discovery::DEFAULT_DISCOVERY_INTERVAL;
use crate::error::{PeerError, Result};
use crate::link::LinkOptions;

/// Prefix for environment overrides, e.g. `PEERLINK_PEER_ID`.
pub const ENV_PREFIX: &str = "PEERLINK_";

pub const DEFAULT_REQUEST_WORKERS: usize = 8;
pub const DEFAULT_REQUEST_QUEUE: usize = 256;
pub const DEFAULT_EVENT_QUEUE: usize = 1024;

/// How the runtime reaches other peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Listen on `bind`; dial peers from a static address book.
    PeerToPeer {
        bind: Endpoint,
        address_book: BTreeMap<String, Endpoint>,
    },
    /// Route everything through a broker.
    Brokered {
        broker: Endpoint,
        auth_token: Option<String>,
    },
    /// The transport is passed to the builder directly.
    Custom,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub peer_id: String,
    pub transport: TransportConfig,
    pub discovery_enabled: bool,
    pub discovery_interval: Duration,
    /// Announce as soon as discovery starts rather than after one interval.
    pub hello_on_start: bool,
    pub request_workers: usize,
    pub request_queue: usize,
    pub event_queue: usize,
    /// Handshake and socket tuning.
    pub link: LinkOptions,
}

impl RuntimeConfig {
    pub fn new(peer_id: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            peer_id: peer_id.into(),
            transport,
            discovery_enabled: true,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            hello_on_start: true,
            request_workers: DEFAULT_REQUEST_WORKERS,
            request_queue: DEFAULT_REQUEST_QUEUE,
            event_queue: DEFAULT_EVENT_QUEUE,
            link: LinkOptions::default(),
        }
    }

    pub fn peer_to_peer(peer_id: impl Into<String>, bind: Endpoint) -> Self {
        Self::new(
            peer_id,
            TransportConfig::PeerToPeer {
                bind,
                address_book: BTreeMap::new(),
            },
        )
    }

    pub fn brokered(peer_id: impl Into<String>, broker: Endpoint) -> Self {
        Self::new(
            peer_id,
            TransportConfig::Brokered {
                broker,
                auth_token: None,
            },
        )
    }

    /// Config for a transport supplied to the builder.
    pub fn custom(peer_id: impl Into<String>) -> Self {
        Self::new(peer_id, TransportConfig::Custom)
    }

    /// Add an address-book entry. Only meaningful for peer-to-peer.
    pub fn with_peer(mut self, peer_id: impl Into<String>, endpoint: Endpoint) -> Self {
        if let TransportConfig::PeerToPeer { address_book, .. } = &mut self.transport {
            address_book.insert(peer_id.into(), endpoint);
        }
        self
    }

    pub fn with_discovery(mut self, enabled: bool, interval: Duration) -> Self {
        self.discovery_enabled = enabled;
        self.discovery_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id.trim().is_empty() {
            return Err(PeerError::Config("peer_id is required".to_string()));
        }
        if self.peer_id.len() > peerlink_frame::MAX_ROUTE_ID_LEN {
            return Err(PeerError::Config(format!(
                "peer_id longer than {} bytes",
                peerlink_frame::MAX_ROUTE_ID_LEN
            )));
        }
        if self.request_workers == 0 || self.request_queue == 0 || self.event_queue == 0 {
            return Err(PeerError::Config(
                "request_workers, request_queue and event_queue must be positive".to_string(),
            ));
        }
        if self.discovery_enabled && self.discovery_interval.is_zero() {
            return Err(PeerError::Config(
                "discovery_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// On-disk configuration. Every field is optional until conversion.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub peer_id: Option<String>,
    /// `peer-to-peer` (alias `p2p`) or `brokered` (alias `broker`).
    /// Inferred from `broker` when absent.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub address_book: Option<AddressBook>,
    #[serde(default)]
    pub broker: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub discovery_enabled: Option<bool>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub discovery_interval_s: Option<f64>,
    #[serde(default)]
    pub hello_on_start: Option<bool>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub request_workers: Option<usize>,
    #[serde(default, deserialize_with = "lenient_count")]
    pub request_queue: Option<usize>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub handshake_timeout_s: Option<f64>,
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub connect_timeout_s: Option<f64>,
}

/// Address book as a mapping or as a list of `peer=endpoint` strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AddressBook {
    Map(BTreeMap<String, String>),
    Pairs(Vec<String>),
}

impl AddressBook {
    /// Parse into endpoints.
    pub fn entries(&self) -> Result<BTreeMap<String, Endpoint>> {
        let raw: Vec<(String, String)> = match self {
            Self::Map(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Self::Pairs(pairs) => pairs
                .iter()
                .map(|pair| parse_peer_address(pair))
                .collect::<Result<_>>()?,
        };
        raw.into_iter()
            .map(|(peer, addr)| Ok((peer, Endpoint::parse(&addr)?)))
            .collect()
    }
}

/// Split a `peer=endpoint` pair.
pub fn parse_peer_address(pair: &str) -> Result<(String, String)> {
    let (peer, addr) = pair
        .split_once('=')
        .ok_or_else(|| PeerError::Config(format!("expected peer=endpoint, got '{pair}'")))?;
    let (peer, addr) = (peer.trim(), addr.trim());
    if peer.is_empty() || addr.is_empty() {
        return Err(PeerError::Config(format!("expected peer=endpoint, got '{pair}'")));
    }
    Ok((peer.to_string(), addr.to_string()))
}

impl ConfigFile {
    /// Load a JSON or YAML file, choosing by extension. Unknown extensions
    /// try JSON, then YAML.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let document = load_document(path.as_ref())?;
        Self::from_document(document)
    }

    /// Load a file (if any) and apply `PEERLINK_*` variables from the process environment.
    pub fn load_with_env(path: Option<&Path>) -> Result<Self> {
        let document = match path {
            Some(path) => load_document(path)?,
            None => Value::Object(Map::new()),
        };
        let document = with_env_overrides(document, std::env::vars(), ENV_PREFIX);
        Self::from_document(document)
    }

    pub fn from_document(document: Value) -> Result<Self> {
        let document = match document {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        Ok(serde_json::from_value(document)?)
    }

    /// Validate and convert.
    pub fn into_runtime_config(self) -> Result<RuntimeConfig> {
        let peer_id = self
            .peer_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| PeerError::Config("peer_id is required".to_string()))?;

        let mode = match self.transport.as_deref() {
            Some(mode) => mode.to_ascii_lowercase(),
            None if self.broker.is_some() => "brokered".to_string(),
            None => "peer-to-peer".to_string(),
        };

        let transport = match mode.as_str() {
            "peer-to-peer" | "p2p" => {
                let bind = self
                    .bind
                    .ok_or_else(|| PeerError::Config("bind is required for peer-to-peer".to_string()))?;
                let address_book = match &self.address_book {
                    Some(book) => book.entries()?,
                    None => BTreeMap::new(),
                };
                TransportConfig::PeerToPeer {
                    bind: Endpoint::parse(&bind)?,
                    address_book,
                }
            }
            "brokered" | "broker" => {
                let broker = self
                    .broker
                    .ok_or_else(|| PeerError::Config("broker is required for brokered".to_string()))?;
                TransportConfig::Brokered {
                    broker: Endpoint::parse(&broker)?,
                    auth_token: self.auth_token.clone(),
                }
            }
            other => {
                return Err(PeerError::Config(format!(
                    "unknown transport '{other}' (expected peer-to-peer or brokered)"
                )))
            }
        };

        let mut config = RuntimeConfig::new(peer_id, transport);
        if let Some(enabled) = self.discovery_enabled {
            config.discovery_enabled = enabled;
        }
        if let Some(secs) = self.discovery_interval_s {
            config.discovery_interval = seconds(secs, "discovery_interval_s")?;
        }
        if let Some(hello) = self.hello_on_start {
            config.hello_on_start = hello;
        }
        if let Some(workers) = self.request_workers {
            config.request_workers = workers;
        }
        if let Some(queue) = self.request_queue {
            config.request_queue = queue;
        }
        if let Some(secs) = self.handshake_timeout_s {
            config.link.handshake.timeout = seconds(secs, "handshake_timeout_s")?;
        }
        if let Some(secs) = self.connect_timeout_s {
            config.link.connect_timeout = seconds(secs, "connect_timeout_s")?;
        }
        if let Some(token) = self.auth_token {
            config.link.handshake.auth_token = Some(token);
        }
        config.validate()?;
        Ok(config)
    }
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| PeerError::Config(format!("{field} must be a non-negative number of seconds")))
}

fn load_document(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path).map_err(|source| PeerError::ConfigIo {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    debug!(path = %path.display(), "loading config file");
    match ext.as_deref() {
        Some("json") => Ok(serde_json::from_str(&text)?),
        Some("yml" | "yaml") => Ok(serde_yaml::from_str(&text)?),
        _ => serde_json::from_str(&text).or_else(|_| {
            serde_yaml::from_str(&text).map_err(|_| {
                PeerError::Config(format!(
                    "could not parse {} as JSON or YAML",
                    path.display()
                ))
            })
        }),
    }
}

/// Overlay `PREFIX_NAME=value` variables onto a document as `name: value`.
///
/// Values are coerced: `true/1/yes/on` and `false/0/no/off` become booleans,
/// comma-separated values become lists, numeric text becomes numbers, and
/// anything else stays a string.
pub fn with_env_overrides(
    document: Value,
    vars: impl IntoIterator<Item = (String, String)>,
    prefix: &str,
) -> Value {
    let mut map = match document {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (name, raw) in vars {
        let Some(key) = name.strip_prefix(prefix) else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        let key = key.to_ascii_lowercase();
        debug!(%key, "config override from environment");
        map.insert(key, coerce(&raw));
    }
    Value::Object(map)
}

fn coerce(raw: &str) -> Value {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => return Value::Bool(true),
        "false" | "0" | "no" | "off" => return Value::Bool(false),
        _ => {}
    }
    if trimmed.contains(',') {
        return Value::Array(
            trimmed
                .split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        );
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Value::from(int);
    }
    if let Ok(float) = trimmed.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CountOrFlag {
    Count(usize),
    Flag(bool),
}

// Env coercion turns "1" and "0" into booleans; numeric fields take them back.
fn lenient_count<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<usize>, D::Error> {
    Ok(Option::<CountOrFlag>::deserialize(de)?.map(|value| match value {
        CountOrFlag::Count(n) => n,
        CountOrFlag::Flag(flag) => usize::from(flag),
    }))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SecondsOrFlag {
    Seconds(f64),
    Flag(bool),
}

fn lenient_seconds<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<f64>, D::Error> {
    Ok(Option::<SecondsOrFlag>::deserialize(de)?.map(|value| match value {
        SecondsOrFlag::Seconds(secs) => secs,
        SecondsOrFlag::Flag(flag) => f64::from(u8::from(flag)),
    }))
}
