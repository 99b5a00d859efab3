//! Chat platform seam: what the bridge needs from a threaded chat service.

use std::fmt;
use std::time::SystemTime;

use crate::callsign::Callsign;

/// Chat thread id (the conversation handle for a peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A chat message the bridge can react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyRef {
    pub thread: ThreadId,
    pub message: u64,
}

/// A reply posted in a bridged thread by a user allowed to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub reply: ReplyRef,
    pub thread_name: String,
    /// Licensed callsign of the author, taken from their display name.
    pub author_call: Callsign,
    pub content: String,
}

/// A radio message rendered into a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCard {
    pub from: Callsign,
    pub text: String,
    pub seq: u32,
    pub via: Option<String>,
    /// When the bridge took the frame off the feed.
    pub received_at: SystemTime,
}

/// Delivery progress shown on the originating chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Handed to the radio side, waiting for an ack.
    Queued,
    /// The station acknowledged.
    Acknowledged,
    /// Retries exhausted without an ack; may still have arrived.
    Unconfirmed,
    /// The feed refused the transmission.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Online,
    Offline,
}

/// Threaded chat service. Calls run on the bridge's single-threaded scheduler, so the
/// returned futures need not be `Send`.
pub trait ChatPlatform {
    async fn create_thread(&self, name: &str) -> Result<ThreadId, ChatError>;
    async fn post_text(&self, thread: ThreadId, content: &str) -> Result<(), ChatError>;
    async fn post_card(&self, thread: ThreadId, card: &InboundCard) -> Result<(), ChatError>;
    async fn react(&self, target: ReplyRef, reaction: Reaction) -> Result<(), ChatError>;
    async fn set_presence(&self, presence: Presence) -> Result<(), ChatError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat platform rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("chat platform unreachable: {0}")]
    Transport(String),
    #[error("unexpected chat platform response: {0}")]
    Protocol(String),
}
