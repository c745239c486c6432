use crate::cmd::{parse_duration, start_runtime, ShowArgs};
use crate::exit::{CliResult, Context, SUCCESS, TIMEOUT};
use crate::output::{print_peer, OutputFormat, PeerSummary};

pub fn run(args: ShowArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let (runtime, handle) = start_runtime(&args.peer, |builder| builder)?;

    let seen = handle
        .wait_for_peer(&args.target, timeout)
        .context("wait interrupted")?;
    let summary = PeerSummary {
        peer: args.target.clone(),
        seen,
        keys: handle.known_keys(&args.target),
        topics: handle.known_topics(&args.target),
    };
    print_peer(&summary, format);

    runtime.stop();
    Ok(if seen { SUCCESS } else { TIMEOUT })
}
