use std::process;

use peerlink_runtime::envelope::now_millis;
use peerlink_runtime::{HandlerResult, RequestContext};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cmd::{start_runtime, stop_on_ctrlc, EchoArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

pub const ECHO_KEY: &str = "echo";
pub const INFO_KEY: &str = "peer.info";

pub fn run(args: EchoArgs, _format: OutputFormat) -> CliResult<i32> {
    let started_at = now_millis();
    let (runtime, handle) = start_runtime(&args.peer, |builder| builder.service(ECHO_KEY, echo))?;

    let peer_id = handle.peer_id().to_string();
    let transport = handle.transport_name();
    handle.add_service(INFO_KEY, move |_: &Value, _: &RequestContext| -> HandlerResult {
        Ok(json!({
            "peer_id": peer_id,
            "transport": transport,
            "keys": [ECHO_KEY, INFO_KEY],
            "pid": process::id(),
            "started_at": started_at,
            "version": env!("CARGO_PKG_VERSION"),
        }))
    });
    stop_on_ctrlc(&handle)?;
    if let Err(err) = handle.hello() {
        debug!(error = %err, "HELLO not sent");
    }
    info!(peer_id = handle.peer_id(), keys = ?handle.services(), "echo peer ready");

    runtime.run_until_stopped();
    Ok(SUCCESS)
}

/// Replies with the request payload and who sent it.
fn echo(payload: &Value, ctx: &RequestContext) -> HandlerResult {
    info!(from = %ctx.source, key = %ctx.key, "echoing request");
    Ok(json!({
        "echo": payload,
        "from": ctx.source,
        "t1": now_millis(),
    }))
}
