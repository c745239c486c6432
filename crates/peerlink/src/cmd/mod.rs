use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};
use peerlink_runtime::{
    ConfigFile, PeerRuntime, PeerRuntimeBuilder, RuntimeConfig, RuntimeHandle, TransportConfig,
};
use peerlink_transport::Endpoint;
use serde_json::Value;

use crate::exit::{CliError, CliResult, Context, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod broker;
pub mod echo;
pub mod publish;
pub mod req;
pub mod show;
pub mod sub;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send one request and print the reply.
    Req(ReqArgs),
    /// Publish one event.
    #[command(name = "pub")]
    Pub(PubArgs),
    /// Print events on the given topics until interrupted.
    Sub(SubArgs),
    /// Wait for a peer's HELLO and list what it serves.
    Show(ShowArgs),
    /// Serve `echo` and `peer.info` until interrupted.
    Echo(EchoArgs),
    /// Run a message broker until interrupted.
    Broker(BrokerArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Req(args) => req::run(args, format),
        Command::Pub(args) => publish::run(args, format),
        Command::Sub(args) => sub::run(args, format),
        Command::Show(args) => show::run(args, format),
        Command::Echo(args) => echo::run(args, format),
        Command::Broker(args) => broker::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

/// How this process joins the mesh. Flags override the config file, which
/// overrides `PEERLINK_*` environment variables.
#[derive(Args, Debug, Clone, Default)]
pub struct PeerArgs {
    /// JSON or YAML config file.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Peer id of this process.
    #[arg(long = "self-id", value_name = "ID")]
    pub self_id: Option<String>,
    /// Endpoint to listen on (peer-to-peer), e.g. tcp://127.0.0.1:5555.
    #[arg(long, value_name = "ENDPOINT")]
    pub bind: Option<String>,
    /// JSON file mapping peer ids to endpoints.
    #[arg(long, value_name = "PATH")]
    pub book: Option<PathBuf>,
    /// Address book entry; repeatable.
    #[arg(long = "addr", value_name = "PEER=ENDPOINT")]
    pub addrs: Vec<String>,
    /// Broker endpoint; selects the brokered transport.
    #[arg(long, value_name = "ENDPOINT", conflicts_with = "bind")]
    pub broker: Option<String>,
    /// Token presented to the broker or required from inbound links.
    #[arg(long, value_name = "TOKEN")]
    pub auth_token: Option<String>,
    /// Period between HELLO announcements (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub hello_interval: Option<String>,
}

impl PeerArgs {
    pub fn runtime_config(&self) -> CliResult<RuntimeConfig> {
        let mut file = ConfigFile::load_with_env(self.config.as_deref()).context("config")?;
        if let Some(id) = &self.self_id {
            file.peer_id = Some(id.clone());
        }
        if let Some(bind) = &self.bind {
            file.bind = Some(bind.clone());
            file.transport = Some("peer-to-peer".to_string());
        }
        if let Some(broker) = &self.broker {
            file.broker = Some(broker.clone());
            file.transport = Some("brokered".to_string());
        }
        if let Some(token) = &self.auth_token {
            file.auth_token = Some(token.clone());
        }

        let mut config = file
            .into_runtime_config()
            .context("config")?;

        let extra = self.address_entries()?;
        match &mut config.transport {
            TransportConfig::PeerToPeer { address_book, .. } => address_book.extend(extra),
            _ if !extra.is_empty() => {
                return Err(CliError::new(
                    USAGE,
                    "--book and --addr only apply to the peer-to-peer transport",
                ))
            }
            _ => {}
        }

        if let Some(interval) = &self.hello_interval {
            config.discovery_interval = parse_duration(interval)?;
        }
        Ok(config)
    }

    fn address_entries(&self) -> CliResult<BTreeMap<String, Endpoint>> {
        let mut raw: Vec<(String, String)> = Vec::new();
        if let Some(path) = &self.book {
            let text = std::fs::read_to_string(path)
                .context(format!("failed reading {}", path.display()))?;
            let book: BTreeMap<String, String> = serde_json::from_str(&text).map_err(|err| {
                CliError::new(USAGE, format!("{} is not a JSON address book: {err}", path.display()))
            })?;
            raw.extend(book);
        }
        for pair in &self.addrs {
            raw.push(
                peerlink_runtime::config::parse_peer_address(pair).context("--addr")?,
            );
        }
        raw.into_iter()
            .map(|(peer, addr)| {
                let endpoint = Endpoint::parse(&addr).context(format!("address of {peer}"))?;
                Ok((peer, endpoint))
            })
            .collect()
    }
}

#[derive(Args, Debug)]
pub struct ReqArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
    /// Peer to call.
    pub dest: String,
    /// Service key, e.g. math.add.
    pub key: String,
    /// JSON payload.
    #[arg(long, default_value = "{}")]
    pub json: String,
    /// Time-to-live for the request (e.g. 8s, 500ms).
    #[arg(long, default_value = "8s")]
    pub ttl: String,
    /// Wait this long for the destination to announce the key first.
    #[arg(long, value_name = "DURATION")]
    pub discover: Option<String>,
}

#[derive(Args, Debug)]
pub struct PubArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
    /// Topic to publish on.
    pub topic: String,
    /// JSON payload.
    #[arg(long, default_value = "{}")]
    pub json: String,
    /// Wait this long for HELLOs before publishing.
    #[arg(long, value_name = "DURATION")]
    pub settle: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
    /// Topics to subscribe to.
    #[arg(required = true)]
    pub topics: Vec<String>,
    /// Exit after receiving N events.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
    /// Peer to inspect.
    pub target: String,
    /// How long to wait for its HELLO.
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    #[command(flatten)]
    pub peer: PeerArgs,
}

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Endpoint to listen on.
    #[arg(long = "listen", value_name = "ENDPOINT", default_value = "tcp://127.0.0.1:5555")]
    pub listen: String,
    /// Require this token from attaching peers.
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,
    /// Log attached peers at this interval.
    #[arg(long, value_name = "DURATION")]
    pub status_interval: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Build and start a runtime, registering the handlers `configure` adds.
pub(crate) fn start_runtime(
    args: &PeerArgs,
    configure: impl FnOnce(PeerRuntimeBuilder) -> PeerRuntimeBuilder,
) -> CliResult<(PeerRuntime, RuntimeHandle)> {
    let config = args.runtime_config()?;
    let runtime = configure(PeerRuntime::builder(config))
        .build()
        .context("runtime setup failed")?;
    let handle = runtime
        .start()
        .context("runtime start failed")?;
    Ok((runtime, handle))
}

/// Route Ctrl-C to [`RuntimeHandle::request_stop`].
pub(crate) fn stop_on_ctrlc(handle: &RuntimeHandle) -> CliResult<()> {
    let handle = handle.clone();
    ctrlc::set_handler(move || handle.request_stop()).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })
}

pub(crate) fn parse_json(flag: &str, raw: &str) -> CliResult<Value> {
    serde_json::from_str(raw)
        .map_err(|err| CliError::new(USAGE, format!("{flag} is not valid JSON: {err}")))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        PathBuf::from(format!(
            "/tmp/peerlink-cmd-{}-{}-{name}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn flags_build_peer_to_peer_config() {
        let args = PeerArgs {
            self_id: Some("peer-A".to_string()),
            bind: Some("tcp://127.0.0.1:5555".to_string()),
            addrs: vec!["peer-B=tcp://127.0.0.1:5556".to_string()],
            hello_interval: Some("250ms".to_string()),
            ..PeerArgs::default()
        };
        let config = args.runtime_config().expect("flags should form a config");
        assert_eq!(config.peer_id, "peer-A");
        assert_eq!(config.discovery_interval, Duration::from_millis(250));
        match config.transport {
            TransportConfig::PeerToPeer { bind, address_book } => {
                assert_eq!(bind, Endpoint::tcp("127.0.0.1:5555"));
                assert_eq!(address_book["peer-B"], Endpoint::tcp("127.0.0.1:5556"));
            }
            other => panic!("unexpected transport {other:?}"),
        }
    }

    #[test]
    fn book_file_merges_with_addr_flags() {
        let path = temp_path("book.json");
        std::fs::write(&path, r#"{"peer-C": "tcp://127.0.0.1:7000"}"#)
            .expect("book should be writable");
        let args = PeerArgs {
            self_id: Some("peer-A".to_string()),
            bind: Some("tcp://127.0.0.1:5555".to_string()),
            book: Some(path.clone()),
            addrs: vec!["peer-B=tcp://127.0.0.1:5556".to_string()],
            ..PeerArgs::default()
        };
        let config = args.runtime_config().unwrap();
        let _ = std::fs::remove_file(&path);
        let TransportConfig::PeerToPeer { address_book, .. } = config.transport else {
            panic!("expected peer-to-peer");
        };
        assert_eq!(
            address_book.keys().cloned().collect::<Vec<_>>(),
            vec!["peer-B".to_string(), "peer-C".to_string()]
        );
    }

    #[test]
    fn broker_flag_selects_brokered_transport() {
        let args = PeerArgs {
            self_id: Some("peer-A".to_string()),
            broker: Some("tcp://127.0.0.1:5555".to_string()),
            auth_token: Some("s3cret".to_string()),
            ..PeerArgs::default()
        };
        let config = args.runtime_config().unwrap();
        assert!(matches!(
            config.transport,
            TransportConfig::Brokered { auth_token: Some(ref t), .. } if t == "s3cret"
        ));
    }

    #[test]
    fn addr_with_broker_is_a_usage_error() {
        let args = PeerArgs {
            self_id: Some("peer-A".to_string()),
            broker: Some("tcp://127.0.0.1:5555".to_string()),
            addrs: vec!["peer-B=tcp://127.0.0.1:5556".to_string()],
            ..PeerArgs::default()
        };
        assert_eq!(args.runtime_config().unwrap_err().code, USAGE);
    }

    #[test]
    fn missing_peer_id_is_a_usage_error() {
        let args = PeerArgs {
            bind: Some("tcp://127.0.0.1:5555".to_string()),
            ..PeerArgs::default()
        };
        // PEERLINK_PEER_ID in the test environment would satisfy this.
        if std::env::var_os("PEERLINK_PEER_ID").is_none() {
            assert_eq!(args.runtime_config().unwrap_err().code, USAGE);
        }
    }
}
