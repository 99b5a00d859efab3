//! Delivery engine: at-least-once outbound messages and deduplicated inbound handling.
//!
//! The engine owns all per-peer state and is confined to one single-threaded
//! scheduler, so state lives in a `RefCell` and no borrow is held across an await.
//! Inbound frames go in through [`DeliveryEngine::handle_inbound`], which returns
//! [`Action`]s for the host to carry out.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{PeerCache, PeerState, DEFAULT_CACHE_CAPACITY};
use crate::callsign::Callsign;
use crate::chat::ThreadId;
use crate::protocol::{next_seq, Frame};
use crate::wire;

/// Transmissions per outbound message.
pub const DEFAULT_MAX_TRIES: u32 = 3;

/// How long each transmission waits for its ack.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// How often peer state is checked for an arrived ack.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Gap between the two transmissions of every ack.
pub const DEFAULT_DOUBLE_TAP_DELAY: Duration = Duration::from_secs(30);

/// Outgoing side of the radio feed.
pub trait FrameSink {
    /// Transmit one frame (without line terminator).
    fn send_all(&self, frame: &str) -> Result<(), TransportError>;
}

impl<T: FrameSink + ?Sized> FrameSink for Rc<T> {
    fn send_all(&self, frame: &str) -> Result<(), TransportError> {
        (**self).send_all(frame)
    }
}

impl<T: FrameSink + ?Sized> FrameSink for Arc<T> {
    fn send_all(&self, frame: &str) -> Result<(), TransportError> {
        (**self).send_all(frame)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("feed is not connected")]
    NotConnected,
    #[error("feed login failed: {0}")]
    Login(String),
    #[error("feed i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Timing and sizing knobs. Defaults match the radio network's conventions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    pub max_tries: u32,
    pub ack_timeout: Duration,
    pub poll_interval: Duration,
    pub double_tap_delay: Duration,
    pub cache_capacity: usize,
    /// First outbound sequence number for every newly tracked peer.
    pub first_seq: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            double_tap_delay: DEFAULT_DOUBLE_TAP_DELAY,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            first_seq: 1,
        }
    }
}

/// Outcome of [`DeliveryEngine::send_reliable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Acknowledged,
    /// No ack observed. The station may still have received the message.
    Unconfirmed,
}

/// New inbound content to show on the chat side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub from: Callsign,
    pub text: String,
    pub seq: u32,
    pub via: Option<String>,
    /// Thread already bound to this peer, if any.
    pub conversation: Option<ThreadId>,
}

/// Work for the host after an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Run one ack round ([`DeliveryEngine::send_ack`]) for `seq` back to `to`.
    SendAck { to: Callsign, seq: u32 },
    Forward(Forward),
}

pub struct DeliveryEngine<S> {
    bot_call: Callsign,
    sink: S,
    settings: DeliverySettings,
    peers: RefCell<PeerCache>,
}

impl<S: FrameSink> DeliveryEngine<S> {
    pub fn new(bot_call: Callsign, sink: S, settings: DeliverySettings) -> Self {
        let peers = PeerCache::new(settings.cache_capacity, settings.first_seq.max(1));
        Self {
            bot_call,
            sink,
            settings,
            peers: RefCell::new(peers),
        }
    }

    pub fn bot_call(&self) -> &Callsign {
        &self.bot_call
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.settings
    }

    /// Send `text` to `to`, retransmitting until acked or `max_tries` is spent.
    ///
    /// The sequence number is reserved before the first transmission and never reused.
    /// Transport errors abort immediately; they are not retried here.
    pub async fn send_reliable(
        &self,
        to: &Callsign,
        text: &str,
    ) -> Result<Delivery, TransportError> {
        let seq = self.peers.borrow_mut().upsert(to, |state| {
            let seq = state.next_out_seq;
            state.next_out_seq = next_seq(seq);
            seq
        });
        let frame = wire::build_message_frame(&self.bot_call, to, text, seq);

        for attempt in 1..=self.settings.max_tries {
            self.sink.send_all(&frame)?;
            tracing::info!(peer = %to, seq, attempt, frame = %frame, "message transmitted");
            match tokio::time::timeout(self.settings.ack_timeout, self.wait_for_ack(to, seq)).await
            {
                Ok(()) => {
                    tracing::info!(peer = %to, seq, attempt, "message acknowledged");
                    return Ok(Delivery::Acknowledged);
                }
                Err(_) => {
                    tracing::debug!(
                        peer = %to,
                        seq,
                        attempt,
                        max_tries = self.settings.max_tries,
                        "ack timeout expired"
                    );
                }
            }
        }

        tracing::info!(peer = %to, seq, "no ack after retries, delivery unconfirmed");
        Ok(Delivery::Unconfirmed)
    }

    async fn wait_for_ack(&self, peer: &Callsign, seq: u32) {
        loop {
            tokio::time::sleep(self.settings.poll_interval).await;
            if self.is_acked(peer, seq) {
                return;
            }
        }
    }

    fn is_acked(&self, peer: &Callsign, seq: u32) -> bool {
        self.peers
            .borrow()
            .get(peer)
            .is_some_and(|state| state.pending_acks.contains(&seq))
    }

    /// Acknowledge message `seq` from `to`: transmit the ack, wait, transmit it again.
    pub async fn send_ack(&self, to: &Callsign, seq: u32) -> Result<(), TransportError> {
        let frame = wire::build_ack_frame(&self.bot_call, to, seq);
        self.sink.send_all(&frame)?;
        tracing::info!(peer = %to, seq, "ack transmitted");
        tokio::time::sleep(self.settings.double_tap_delay).await;
        self.sink.send_all(&frame)?;
        tracing::info!(peer = %to, seq, "ack transmitted (double-tap)");
        Ok(())
    }

    /// Apply one inbound frame to peer state.
    ///
    /// Every message addressed to us yields exactly one [`Action::SendAck`], new or
    /// duplicate. Only a sequence number above the last one seen yields
    /// [`Action::Forward`].
    pub fn handle_inbound(&self, frame: Frame) -> Vec<Action> {
        match frame {
            Frame::Ack { from, to, seq } => {
                if to != self.bot_call {
                    tracing::debug!(peer = %from, addressee = %to, "ignoring ack for another station");
                    return vec![];
                }
                self.peers.borrow_mut().upsert(&from, |state| {
                    state.pending_acks.insert(seq);
                });
                tracing::info!(peer = %from, seq, "ack received");
                vec![]
            }
            Frame::Message {
                from,
                to,
                text,
                seq,
                via,
            } => {
                if to != self.bot_call {
                    tracing::debug!(peer = %from, addressee = %to, "ignoring message for another station");
                    return vec![];
                }
                let (is_new, conversation) = self.peers.borrow_mut().upsert(&from, |state| {
                    let is_new = seq > state.last_seen_seq;
                    if is_new {
                        state.last_seen_seq = seq;
                    }
                    (is_new, state.conversation)
                });
                let mut actions = vec![Action::SendAck {
                    to: from.clone(),
                    seq,
                }];
                if is_new {
                    tracing::info!(peer = %from, seq, text = %text, "message received");
                    actions.push(Action::Forward(Forward {
                        from,
                        text,
                        seq,
                        via,
                        conversation,
                    }));
                } else {
                    tracing::info!(peer = %from, seq, "duplicate message, repeating ack only");
                }
                actions
            }
            Frame::Unparseable => {
                tracing::debug!("discarding unparseable frame");
                vec![]
            }
        }
    }

    /// Associate `thread` with `peer`, tracking the peer if it is not already.
    pub fn bind_conversation(&self, peer: &Callsign, thread: ThreadId) {
        self.peers
            .borrow_mut()
            .upsert(peer, |state| state.conversation = Some(thread));
    }

    pub fn conversation(&self, peer: &Callsign) -> Option<ThreadId> {
        self.peers.borrow().get(peer).and_then(|s| s.conversation)
    }

    pub fn peer_for_conversation(&self, thread: ThreadId) -> Option<Callsign> {
        self.peers.borrow().find_by_conversation(thread).cloned()
    }

    /// Snapshot of a peer's state.
    pub fn peer_state(&self, peer: &Callsign) -> Option<PeerState> {
        self.peers.borrow().get(peer).cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::time::Instant;

    /// Records every transmitted frame with its (virtual) send time.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) frames: RefCell<Vec<(Instant, String)>>,
        pub(crate) fail: Cell<bool>,
    }

    impl RecordingSink {
        pub(crate) fn sent(&self) -> Vec<String> {
            self.frames.borrow().iter().map(|(_, f)| f.clone()).collect()
        }
    }

    impl FrameSink for RecordingSink {
        fn send_all(&self, frame: &str) -> Result<(), TransportError> {
            if self.fail.get() {
                return Err(TransportError::NotConnected);
            }
            self.frames
                .borrow_mut()
                .push((Instant::now(), frame.to_string()));
            Ok(())
        }
    }

    pub(crate) fn call(s: &str) -> Callsign {
        Callsign::new(s).unwrap()
    }

    pub(crate) fn engine() -> (DeliveryEngine<Rc<RecordingSink>>, Rc<RecordingSink>) {
        let sink = Rc::new(RecordingSink::default());
        let engine = DeliveryEngine::new(call("PPRAA"), sink.clone(), DeliverySettings::default());
        (engine, sink)
    }

    fn message(from: &str, seq: u32) -> Frame {
        Frame::Message {
            from: call(from),
            to: call("PPRAA"),
            text: format!("msg {seq}"),
            seq,
            via: None,
        }
    }

    fn ack(from: &str, seq: u32) -> Frame {
        Frame::Ack {
            from: call(from),
            to: call("PPRAA"),
            seq,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_send_retries_three_times_then_reports_unconfirmed() {
        let (engine, sink) = engine();
        let start = Instant::now();
        let result = engine.send_reliable(&call("AD8IS-10"), "hello").await.unwrap();
        assert_eq!(result, Delivery::Unconfirmed);

        let frames = sink.frames.borrow();
        assert_eq!(frames.len(), 3);
        for (i, (at, frame)) in frames.iter().enumerate() {
            assert_eq!(frame, "PPRAA>APP614,TCPIP*::AD8IS-10 :hello{1");
            assert_eq!(*at - start, Duration::from_secs(30) * i as u32);
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(90) && elapsed < Duration::from_secs(91));
        let state = engine.peer_state(&call("AD8IS-10")).unwrap();
        assert_eq!(state.next_out_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_during_second_attempt_stops_retries() {
        let (engine, sink) = engine();
        let start = Instant::now();
        let peer = call("AD8IS-10");
        let (result, ()) = tokio::join!(engine.send_reliable(&peer, "hello"), async {
            tokio::time::sleep(Duration::from_secs(35)).await;
            assert!(engine.handle_inbound(ack("AD8IS-10", 1)).is_empty());
        });
        assert_eq!(result.unwrap(), Delivery::Acknowledged);
        assert_eq!(sink.sent().len(), 2);
        assert!(start.elapsed() <= Duration::from_secs(36));
    }

    #[tokio::test(start_paused = true)]
    async fn each_send_reserves_a_fresh_sequence_number() {
        let sink = Rc::new(RecordingSink::default());
        let settings = DeliverySettings {
            max_tries: 1,
            first_seq: 41,
            ..DeliverySettings::default()
        };
        let engine = DeliveryEngine::new(call("PPRAA"), sink.clone(), settings);
        let peer = call("K8XYZ");
        engine.send_reliable(&peer, "one").await.unwrap();
        engine.send_reliable(&peer, "two").await.unwrap();
        let sent = sink.sent();
        assert!(sent[0].ends_with(":one{41"));
        assert!(sent[1].ends_with(":two{42"));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_propagates_without_retry() {
        let (engine, sink) = engine();
        sink.fail.set(true);
        let err = engine.send_reliable(&call("K8XYZ"), "hi").await;
        assert!(matches!(err, Err(TransportError::NotConnected)));
        // The number stays consumed.
        assert_eq!(engine.peer_state(&call("K8XYZ")).unwrap().next_out_seq, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ack_is_double_tapped() {
        let (engine, sink) = engine();
        engine.send_ack(&call("AD8IS-10"), 5).await.unwrap();
        let frames = sink.frames.borrow();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].1, "PPRAA>APP614,TCPIP*::AD8IS-10 :ack5");
        assert_eq!(frames[0].1, frames[1].1);
        assert_eq!(frames[1].0 - frames[0].0, DEFAULT_DOUBLE_TAP_DELAY);
    }

    #[test]
    fn new_message_is_acked_and_forwarded_duplicate_only_acked() {
        let (engine, _sink) = engine();
        let actions = engine.handle_inbound(message("AD8IS-10", 5));
        assert_eq!(
            actions,
            vec![
                Action::SendAck {
                    to: call("AD8IS-10"),
                    seq: 5
                },
                Action::Forward(Forward {
                    from: call("AD8IS-10"),
                    text: "msg 5".into(),
                    seq: 5,
                    via: None,
                    conversation: None,
                }),
            ]
        );

        let again = engine.handle_inbound(message("AD8IS-10", 5));
        assert_eq!(
            again,
            vec![Action::SendAck {
                to: call("AD8IS-10"),
                seq: 5
            }]
        );
        let older = engine.handle_inbound(message("AD8IS-10", 3));
        assert_eq!(older.len(), 1);
        let newer = engine.handle_inbound(message("AD8IS-10", 6));
        assert!(matches!(newer[1], Action::Forward(Forward { seq: 6, .. })));
        assert_eq!(engine.peer_state(&call("AD8IS-10")).unwrap().last_seen_seq, 6);
    }

    #[test]
    fn repeated_ack_is_idempotent() {
        let (engine, _sink) = engine();
        engine.handle_inbound(ack("K8XYZ", 4));
        let after_first = engine.peer_state(&call("K8XYZ")).unwrap().pending_acks;
        engine.handle_inbound(ack("K8XYZ", 4));
        let after_second = engine.peer_state(&call("K8XYZ")).unwrap().pending_acks;
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 1);
    }

    #[test]
    fn evicted_peer_is_treated_as_new() {
        let (engine, _sink) = engine();
        let first = "N0AAA";
        engine.handle_inbound(message(first, 8));
        for i in 1..=DEFAULT_CACHE_CAPACITY {
            let actions = engine.handle_inbound(message(&format!("N{i}BBB"), 1));
            assert_eq!(actions.len(), 2);
        }
        assert!(engine.peer_state(&call(first)).is_none());
        // Lower than the forgotten last_seen_seq, still forwarded.
        let actions = engine.handle_inbound(message(first, 2));
        assert!(matches!(actions[1], Action::Forward(Forward { seq: 2, .. })));
    }

    #[test]
    fn frames_for_other_stations_and_noise_are_ignored() {
        let (engine, sink) = engine();
        let other = Frame::Message {
            from: call("K8XYZ"),
            to: call("W1AW"),
            text: "hi".into(),
            seq: 1,
            via: None,
        };
        assert!(engine.handle_inbound(other).is_empty());
        assert!(engine
            .handle_inbound(Frame::Ack {
                from: call("K8XYZ"),
                to: call("W1AW"),
                seq: 1
            })
            .is_empty());
        assert!(engine.handle_inbound(Frame::Unparseable).is_empty());
        assert!(engine.peer_state(&call("K8XYZ")).is_none());
        assert!(sink.sent().is_empty());
    }

    #[test]
    fn forward_carries_bound_conversation() {
        let (engine, _sink) = engine();
        engine.bind_conversation(&call("K8XYZ"), ThreadId(77));
        assert_eq!(engine.peer_for_conversation(ThreadId(77)), Some(call("K8XYZ")));
        let actions = engine.handle_inbound(message("K8XYZ", 1));
        assert!(matches!(
            &actions[1],
            Action::Forward(Forward {
                conversation: Some(ThreadId(77)),
                ..
            })
        ));
    }
}
