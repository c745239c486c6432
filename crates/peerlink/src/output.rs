use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use peerlink_runtime::envelope::now_millis;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct ReplyOutput<'a> {
    peer: &'a str,
    key: &'a str,
    elapsed_ms: u128,
    reply: &'a Value,
}

/// One RPC reply.
pub fn print_reply(peer: &str, key: &str, elapsed_ms: u128, reply: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = ReplyOutput {
                peer,
                key,
                elapsed_ms,
                reply,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["PEER", "KEY", "MS", "REPLY"])
                .add_row(vec![
                    peer.to_string(),
                    key.to_string(),
                    elapsed_ms.to_string(),
                    compact(reply),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("{peer} {key} ({elapsed_ms} ms)");
            println!("{}", pretty(reply));
        }
    }
}

#[derive(Serialize)]
struct EventOutput<'a> {
    topic: &'a str,
    received_at: u64,
    payload: &'a Value,
}

/// One received event. Table format prints a row per event without borders.
pub fn print_event(topic: &str, payload: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = EventOutput {
                topic,
                received_at: now_millis(),
                payload,
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => println!("{topic}\t{}", compact(payload)),
        OutputFormat::Pretty => println!("[{topic}]\n{}", pretty(payload)),
    }
}

#[derive(Serialize)]
pub struct PeerSummary {
    pub peer: String,
    pub seen: bool,
    pub keys: Vec<String>,
    pub topics: Vec<String>,
}

pub fn print_peer(summary: &PeerSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["KIND", "NAME"]);
            for key in &summary.keys {
                table.add_row(vec!["key", key.as_str()]);
            }
            for topic in &summary.topics {
                table.add_row(vec!["topic", topic.as_str()]);
            }
            println!("peer: {} (seen: {})", summary.peer, summary.seen);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!("peer {} seen={}", summary.peer, summary.seen);
            println!("  keys:   {}", summary.keys.join(", "));
            println!("  topics: {}", summary.topics.join(", "));
        }
    }
}

fn compact(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}
