use std::sync::mpsc;

use peerlink_runtime::{Broker, BrokerConfig};
use peerlink_transport::Endpoint;
use serde_json::json;
use tracing::info;

use crate::cmd::{parse_duration, BrokerArgs};
use crate::exit::{CliError, CliResult, Context, INTERNAL, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: BrokerArgs, format: OutputFormat) -> CliResult<i32> {
    let endpoint = Endpoint::parse(&args.listen).context("--listen")?;
    let status_interval = args.status_interval.as_deref().map(parse_duration).transpose()?;

    let mut config = BrokerConfig::new(endpoint);
    config.link.handshake.auth_token = args.token.clone();
    let mut broker = Broker::bind(config).context("broker bind failed")?;

    match format {
        OutputFormat::Json => println!("{}", json!({ "listening": broker.endpoint().to_string() })),
        _ => println!("broker listening on {}", broker.endpoint()),
    }

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))?;

    match status_interval {
        Some(interval) => loop {
            match rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    info!(peers = ?broker.peers(), "broker status");
                }
                _ => break,
            }
        },
        None => {
            let _ = rx.recv();
        }
    }

    info!("shutting down broker");
    broker.shutdown();
    Ok(SUCCESS)
}
