use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{info, warn};

use crate::cmd::{parse_duration, parse_json, start_runtime, ReqArgs};
use crate::exit::{CliError, CliResult, Context, FAILURE, SUCCESS, USAGE};
use crate::output::{print_reply, OutputFormat};

pub fn run(args: ReqArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = parse_json("--json", &args.json)?;
    let ttl = parse_duration(&args.ttl)?;
    let ttl_ms = ttl_millis(ttl)?;
    let discover = args.discover.as_deref().map(parse_duration).transpose()?;

    let (runtime, handle) = start_runtime(&args.peer, |builder| builder)?;

    if let Some(wait) = discover {
        let found = handle
            .wait_for_key(&args.dest, &args.key, wait)
            .context("discovery interrupted")?;
        if !found {
            warn!(dest = %args.dest, key = %args.key, "key not announced; sending anyway");
        }
    }

    let started = Instant::now();
    let reply = handle
        .rpc(&args.dest, &args.key, payload, ttl_ms)
        .context("request failed")?;
    let elapsed = started.elapsed().as_millis();
    info!(dest = %args.dest, key = %args.key, elapsed_ms = elapsed as u64, "reply received");

    print_reply(&args.dest, &args.key, elapsed, &reply, format);
    runtime.stop();
    Ok(reply_code(&reply))
}

fn ttl_millis(ttl: Duration) -> CliResult<u64> {
    u64::try_from(ttl.as_millis())
        .map_err(|_| CliError::new(USAGE, format!("--ttl {ttl:?} is too large")))
}

/// `{"ok": false, ...}` replies are application errors.
fn reply_code(reply: &Value) -> i32 {
    match reply.get("ok") {
        Some(Value::Bool(false)) => FAILURE,
        _ => SUCCESS,
    }
}
