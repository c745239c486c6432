//! Length-prefixed framing with channel ids and peer routing.
//!
//! Every frame on a peerlink stream carries:
//! - A 2-byte magic number ("PL") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 2-byte little-endian channel ID
//!
//! Frames on the routed channels (DELIVER, DIRECT, BROADCAST) start their
//! payload with a peer-id prefix; see [`route`].

pub mod channel;
pub mod codec;
pub mod error;
pub mod reader;
pub mod route;
pub mod writer;

pub use channel::{channel_name, BROADCAST, CONTROL, DELIVER, DIRECT, ERROR};
pub use codec::{decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use route::{decode_route, encode_route, MAX_ROUTE_ID_LEN};
pub use writer::FrameWriter;
