use serde_json::json;
use tracing::debug;

use crate::cmd::{parse_duration, parse_json, start_runtime, PubArgs};
use crate::exit::{CliResult, Context, SUCCESS};
use crate::output::OutputFormat;

pub fn run(args: PubArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = parse_json("--json", &args.json)?;
    let settle = args.settle.as_deref().map(parse_duration).transpose()?;

    let (runtime, handle) = start_runtime(&args.peer, |builder| builder)?;
    if let Some(settle) = settle {
        // Give peers a chance to announce their topics.
        if let Err(err) = handle.hello() {
            debug!(error = %err, "HELLO not sent");
        }
        std::thread::sleep(settle);
    }

    let delivered = handle
        .publish(&args.topic, payload)
        .context("publish failed")?;

    let out = json!({ "topic": args.topic, "subscribers_known": delivered });
    match format {
        OutputFormat::Json => println!("{out}"),
        _ => println!(
            "published {} ({})",
            args.topic,
            if delivered { "subscribers known" } else { "no known subscribers" }
        ),
    }
    runtime.stop();
    Ok(SUCCESS)
}
