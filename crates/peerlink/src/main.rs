mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "peerlink", version, about = "Peer RPC, discovery and pub/sub CLI")]
struct Cli {
    /// json, table or pretty. Defaults to table on a terminal, json otherwise.
    #[arg(long, value_name = "FORMAT", global = true, env = "PEERLINK_FORMAT")]
    format: Option<OutputFormat>,

    /// Diagnostics on stderr as text or json lines.
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true, env = "PEERLINK_LOG_FORMAT")]
    log_format: LogFormat,

    /// Overridden by RUST_LOG when that is set.
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true, env = "PEERLINK_LOG_LEVEL")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let Cli {
        format,
        log_format,
        log_level,
        command,
    } = Cli::parse();
    init_logging(log_format, log_level);

    let code = cmd::run(command, format.unwrap_or_else(OutputFormat::default_for_stdout))
        .unwrap_or_else(|err| {
            eprintln!("peerlink: {err}");
            err.code
        });
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_req_subcommand() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "req",
            "peer-B",
            "math.add",
            "--self-id",
            "peer-A",
            "--bind",
            "tcp://127.0.0.1:5555",
            "--addr",
            "peer-B=tcp://127.0.0.1:5556",
            "--json",
            r#"{"a":1,"b":2}"#,
            "--ttl",
            "2s",
        ])
        .expect("req args should parse");

        let Command::Req(args) = cli.command else {
            panic!("expected req");
        };
        assert_eq!(args.dest, "peer-B");
        assert_eq!(args.key, "math.add");
        assert_eq!(args.peer.addrs, vec!["peer-B=tcp://127.0.0.1:5556".to_string()]);
    }

    #[test]
    fn pub_is_spelled_pub() {
        let cli = Cli::try_parse_from(["peerlink", "pub", "alerts", "--broker", "tcp://127.0.0.1:5555"])
            .expect("pub args should parse");
        assert!(matches!(cli.command, Command::Pub(_)));
    }

    #[test]
    fn broker_and_bind_conflict() {
        let err = Cli::try_parse_from([
            "peerlink",
            "sub",
            "alerts",
            "--bind",
            "tcp://127.0.0.1:5555",
            "--broker",
            "tcp://127.0.0.1:6000",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn sub_requires_a_topic() {
        let err = Cli::try_parse_from(["peerlink", "sub", "--broker", "tcp://127.0.0.1:5555"])
            .expect_err("missing topic should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from([
            "peerlink",
            "show",
            "peer-B",
            "--timeout",
            "3s",
            "--format",
            "json",
            "--log-level",
            "debug",
        ])
        .expect("show args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.log_level, LogLevel::Debug));
    }

    #[test]
    fn broker_defaults_listen_endpoint() {
        let cli = Cli::try_parse_from(["peerlink", "broker"]).expect("broker args should parse");
        let Command::Broker(args) = cli.command else {
            panic!("expected broker");
        };
        assert_eq!(args.listen, "tcp://127.0.0.1:5555");
    }
}
