//! Built-in channel IDs.
//!
//! Peerlink streams only use the channels below; any other id is rejected
//! by the link layer.

/// Link management (handshake).
pub const CONTROL: u16 = 0;

/// Envelope delivered to this peer. Payload prefix: source peer id.
pub const DELIVER: u16 = 1;

/// Envelope addressed to one peer via a broker. Payload prefix: destination peer id.
pub const DIRECT: u16 = 2;

/// Envelope for every other peer on a broker. Payload prefix: empty.
pub const BROADCAST: u16 = 3;

/// Routing failure notice from a broker (JSON payload, no prefix).
pub const ERROR: u16 = 4;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        DELIVER => "DELIVER",
        DIRECT => "DIRECT",
        BROADCAST => "BROADCAST",
        ERROR => "ERROR",
        _ => "UNKNOWN",
    }
}
