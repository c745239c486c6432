use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    os: &'static str,
    arch: &'static str,
    git_hash: &'static str,
    protocol: &'static str,
    transports: [&'static str; 3],
}

impl BuildInfo {
    fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target: option_env!("PEERLINK_BUILD_TARGET").unwrap_or("unknown"),
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
            git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
            protocol: "peerlink/1.0",
            transports: ["peer-to-peer", "brokered", "memory"],
        }
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    let info = BuildInfo::current();
    if !args.extended {
        println!("{} {}", info.name, info.version);
        return Ok(SUCCESS);
    }

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table | OutputFormat::Pretty => {
            let fields = [
                ("name", info.name),
                ("version", info.version),
                ("target", info.target),
                ("os", info.os),
                ("arch", info.arch),
                ("git_hash", info.git_hash),
                ("protocol", info.protocol),
            ];
            for (field, value) in fields {
                println!("{field}: {value}");
            }
            println!("transports: {}", info.transports.join(", "));
        }
    }
    Ok(SUCCESS)
}
