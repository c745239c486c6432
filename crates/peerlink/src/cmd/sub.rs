use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::cmd::{start_runtime, stop_on_ctrlc, SubArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_event, OutputFormat};

pub fn run(args: SubArgs, format: OutputFormat) -> CliResult<i32> {
    let seen = Arc::new(AtomicUsize::new(0));
    let (runtime, handle) = start_runtime(&args.peer, |builder| builder)?;
    stop_on_ctrlc(&handle)?;

    for topic in &args.topics {
        let seen = Arc::clone(&seen);
        let limit = args.count;
        let stopper = handle.clone();
        handle.subscribe(topic, move |topic: &str, payload: &Value| {
            print_event(topic, payload, format);
            let n = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if limit.is_some_and(|limit| n >= limit) {
                stopper.request_stop();
            }
        });
    }
    // Announce the new topics right away.
    if let Err(err) = handle.hello() {
        debug!(error = %err, "HELLO not sent");
    }
    info!(peer_id = handle.peer_id(), topics = ?args.topics, "subscribed");

    runtime.run_until_stopped();
    info!(events = seen.load(Ordering::SeqCst), "subscriber stopped");
    Ok(SUCCESS)
}
