//! APRS message bridge core.
//! Frame codec, per-peer delivery state, and the two bridge tasks. Network I/O is
//! supplied by the host through [`FrameSink`] and [`ChatPlatform`].

#![allow(async_fn_in_trait)]

pub mod cache;
pub mod callsign;
pub mod chat;
pub mod engine;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod wire;

pub use cache::{PeerCache, PeerState, DEFAULT_CACHE_CAPACITY};
pub use callsign::{Callsign, CallsignError};
pub use chat::{ChatError, ChatPlatform, ChatReply, InboundCard, Presence, Reaction, ReplyRef, ThreadId};
pub use engine::{Action, Delivery, DeliveryEngine, DeliverySettings, FrameSink, Forward, TransportError};
pub use protocol::{next_seq, Frame, MAX_PAYLOAD_LEN, TOCALL};
pub use queue::{bridge_queue, QueueClosed, QueueCloser, QueueConsumer, QueueProducer, DEFAULT_QUEUE_CAPACITY};
pub use wire::{build_ack_frame, build_message_frame, decode_frame, parse_frame, FrameDecodeError};
