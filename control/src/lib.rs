//! Control channel of the NDT protocol.
//!
//! Every control message is a 3-byte header (1-byte type, 2-byte big-endian length)
//! followed by up to 65535 payload bytes. [`codec`] implements that framing on top of
//! `tokio_util::codec`, [`streams`] wraps a TCP connection with bounded-retry sends and
//! deadline-bounded receives, and [`protocol`] holds the message vocabulary: login
//! bitmasks, queue statuses and the test-suite announcement.
//!
//! [`port_ranges`] binds the per-test data listeners.

pub mod codec;
pub mod port_ranges;
pub mod protocol;
pub mod streams;

pub use codec::{Error, Message, MessageType, NdtCodec, MAX_PAYLOAD};
pub use port_ranges::PortRanges;
pub use streams::ControlConnection;
