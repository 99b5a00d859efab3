//! APRS message protocol: frame types and fixed protocol constants.

use crate::callsign::Callsign;

/// Destination (tocall) identifying this software on APRS-IS.
pub const TOCALL: &str = "APP614";

/// Path appended after the tocall for frames injected over the internet.
pub const TCPIP_PATH: &str = "TCPIP*";

/// Maximum message payload length. Fixed by the protocol's frame-length ceiling.
pub const MAX_PAYLOAD_LEN: usize = 67;

/// Message numbers are at most five characters on the wire.
pub const MAX_SEQ: u32 = 99_999;

/// One received line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Numbered text message.
    Message {
        from: Callsign,
        to: Callsign,
        text: String,
        seq: u32,
        /// Igate that injected the packet into APRS-IS, if the path names one.
        via: Option<String>,
    },
    /// Acknowledgment of a message we sent.
    Ack { from: Callsign, to: Callsign, seq: u32 },
    /// Noise, other packet types, or malformed messages.
    Unparseable,
}

/// Sequence number following `seq`, wrapping past [`MAX_SEQ`] back to 1.
pub fn next_seq(seq: u32) -> u32 {
    if seq >= MAX_SEQ {
        1
    } else {
        seq + 1
    }
}
