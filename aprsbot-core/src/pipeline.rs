//! Bridge tasks: radio to chat (inbound) and chat to radio (outbound).
//!
//! Both run on one `LocalSet` and share the engine through `Rc`. Ack rounds and
//! outbound relays are spawned as local tasks so neither loop stalls on a 30 second
//! timer.

use std::rc::Rc;
use std::time::SystemTime;

use tokio::sync::mpsc;

use crate::callsign::Callsign;
use crate::chat::{ChatPlatform, ChatReply, InboundCard, Reaction};
use crate::engine::{Action, Delivery, DeliveryEngine, FrameSink, Forward};
use crate::protocol::Frame;
use crate::queue::QueueConsumer;

/// Suffix of every thread the bridge opens for a station.
pub const THREAD_SUFFIX: &str = " via APRS";

pub fn thread_name(peer: &Callsign) -> String {
    format!("{peer}{THREAD_SUFFIX}")
}

/// Station a bridge thread belongs to, recovered from its name.
pub fn peer_from_thread_name(name: &str) -> Option<Callsign> {
    name.strip_suffix(THREAD_SUFFIX)
        .and_then(|call| Callsign::new(call).ok())
}

fn thread_intro(peer: &Callsign) -> String {
    format!(
        "Licensed radio amateurs can reply in this thread. If permitted, it will be \
         retransmitted via APRS-IS in reply to {peer}"
    )
}

/// Drain the feed queue in arrival order until it is closed, then discard leftovers.
pub async fn run_inbound<S, C>(
    engine: Rc<DeliveryEngine<S>>,
    chat: Rc<C>,
    mut queue: QueueConsumer<Frame>,
) where
    S: FrameSink + 'static,
    C: ChatPlatform + 'static,
{
    while let Some(frame) = queue.pop().await {
        tracing::debug!(remaining = queue.len(), "frame dequeued");
        for action in engine.handle_inbound(frame) {
            match action {
                Action::SendAck { to, seq } => {
                    let engine = engine.clone();
                    tokio::task::spawn_local(async move {
                        if let Err(e) = engine.send_ack(&to, seq).await {
                            tracing::warn!(peer = %to, seq, error = %e, "ack transmission failed");
                        }
                    });
                }
                Action::Forward(forward) => forward_to_chat(&engine, &chat, forward).await,
            }
        }
    }
    let dropped = queue.drain();
    tracing::info!(dropped = dropped.len(), "inbound bridge stopped");
}

/// Post new radio content to the peer's thread, opening the thread on first contact.
/// The thread is bound before the next frame is taken; the card itself is posted
/// from a local task. Chat failures are logged; the radio side has already been acked.
async fn forward_to_chat<S: FrameSink, C: ChatPlatform + 'static>(
    engine: &DeliveryEngine<S>,
    chat: &Rc<C>,
    forward: Forward,
) {
    let received_at = SystemTime::now();
    let thread = match forward.conversation {
        Some(thread) => thread,
        None => match chat.create_thread(&thread_name(&forward.from)).await {
            Ok(thread) => {
                engine.bind_conversation(&forward.from, thread);
                tracing::info!(peer = %forward.from, %thread, "created thread");
                if let Err(e) = chat.post_text(thread, &thread_intro(&forward.from)).await {
                    tracing::warn!(%thread, error = %e, "failed to post thread intro");
                }
                thread
            }
            Err(e) => {
                tracing::warn!(peer = %forward.from, seq = forward.seq, error = %e, "thread creation failed, message not posted");
                return;
            }
        },
    };
    let card = InboundCard {
        from: forward.from,
        text: forward.text,
        seq: forward.seq,
        via: forward.via,
        received_at,
    };
    let chat = chat.clone();
    tokio::task::spawn_local(async move {
        if let Err(e) = chat.post_card(thread, &card).await {
            tracing::warn!(peer = %card.from, seq = card.seq, %thread, error = %e, "failed to post message");
        }
    });
}

/// Relay qualifying chat replies to the radio side until the reply stream ends.
pub async fn run_outbound<S, C>(
    engine: Rc<DeliveryEngine<S>>,
    chat: Rc<C>,
    mut replies: mpsc::Receiver<ChatReply>,
) where
    S: FrameSink + 'static,
    C: ChatPlatform + 'static,
{
    while let Some(reply) = replies.recv().await {
        let Some(peer) = resolve_peer(&engine, &reply) else {
            tracing::debug!(thread = %reply.reply.thread, name = %reply.thread_name, "reply outside a bridged thread");
            continue;
        };
        tokio::task::spawn_local(relay_reply(engine.clone(), chat.clone(), peer, reply));
    }
    tracing::info!("outbound bridge stopped");
}

/// Peer bound to the reply's thread; an unbound thread named like one of ours
/// (e.g. from before a restart or eviction) is adopted.
fn resolve_peer<S: FrameSink>(engine: &DeliveryEngine<S>, reply: &ChatReply) -> Option<Callsign> {
    let thread = reply.reply.thread;
    if let Some(peer) = engine.peer_for_conversation(thread) {
        return Some(peer);
    }
    let peer = peer_from_thread_name(&reply.thread_name)?;
    tracing::info!(peer = %peer, %thread, "adopting existing thread");
    engine.bind_conversation(&peer, thread);
    Some(peer)
}

async fn relay_reply<S: FrameSink, C: ChatPlatform>(
    engine: Rc<DeliveryEngine<S>>,
    chat: Rc<C>,
    peer: Callsign,
    reply: ChatReply,
) {
    let text = format!("{}-{}", reply.author_call, reply.content);
    tracing::info!(from = %reply.author_call, to = %peer, "forwarding reply via APRS");
    react(chat.as_ref(), &reply, Reaction::Queued).await;
    let outcome = match engine.send_reliable(&peer, &text).await {
        Ok(Delivery::Acknowledged) => Reaction::Acknowledged,
        Ok(Delivery::Unconfirmed) => Reaction::Unconfirmed,
        Err(e) => {
            tracing::warn!(to = %peer, error = %e, "transmission failed");
            Reaction::Failed
        }
    };
    react(chat.as_ref(), &reply, outcome).await;
}

async fn react<C: ChatPlatform>(chat: &C, reply: &ChatReply, reaction: Reaction) {
    if let Err(e) = chat.react(reply.reply, reaction).await {
        tracing::warn!(?reaction, error = %e, "failed to add reaction");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::thread;
    use std::time::Duration;

    use crate::chat::{ChatError, Presence, ReplyRef, ThreadId};
    use crate::engine::tests::{call, engine, RecordingSink};
    use crate::queue::bridge_queue;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum ChatCall {
        CreateThread(String),
        Text(ThreadId),
        Card(ThreadId, u32),
        React(u64, Reaction),
    }

    #[derive(Default)]
    struct RecordingChat {
        calls: RefCell<Vec<ChatCall>>,
        fail_threads: bool,
        /// Simulated slow (e.g. rate limited) card posts.
        card_delay: Option<Duration>,
    }

    impl ChatPlatform for RecordingChat {
        async fn create_thread(&self, name: &str) -> Result<ThreadId, ChatError> {
            self.calls
                .borrow_mut()
                .push(ChatCall::CreateThread(name.to_string()));
            if self.fail_threads {
                return Err(ChatError::Transport("down".into()));
            }
            Ok(ThreadId(900))
        }

        async fn post_text(&self, thread: ThreadId, _content: &str) -> Result<(), ChatError> {
            self.calls.borrow_mut().push(ChatCall::Text(thread));
            Ok(())
        }

        async fn post_card(&self, thread: ThreadId, card: &InboundCard) -> Result<(), ChatError> {
            if let Some(delay) = self.card_delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.borrow_mut().push(ChatCall::Card(thread, card.seq));
            Ok(())
        }

        async fn react(&self, target: ReplyRef, reaction: Reaction) -> Result<(), ChatError> {
            self.calls
                .borrow_mut()
                .push(ChatCall::React(target.message, reaction));
            Ok(())
        }

        async fn set_presence(&self, _presence: Presence) -> Result<(), ChatError> {
            Ok(())
        }
    }

    fn message(seq: u32) -> Frame {
        Frame::Message {
            from: call("AD8IS-10"),
            to: call("PPRAA"),
            text: "hello".into(),
            seq,
            via: Some("K8IGT".into()),
        }
    }

    /// Push frames from a plain thread, as the feed reader does.
    fn feed(producer: crate::queue::QueueProducer<Frame>, frames: Vec<Frame>) {
        thread::spawn(move || {
            for frame in frames {
                producer.push(frame).unwrap();
            }
        })
        .join()
        .unwrap();
    }

    fn acks(sink: &RecordingSink) -> usize {
        sink.sent().iter().filter(|f| f.contains(":ack")).count()
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_message_opens_thread_posts_and_double_acks() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                let chat = Rc::new(RecordingChat::default());
                let (producer, consumer) = bridge_queue(8);
                let closer = consumer.closer();
                let task =
                    tokio::task::spawn_local(run_inbound(engine.clone(), chat.clone(), consumer));

                feed(producer.clone(), vec![message(5), message(5)]);
                tokio::time::sleep(Duration::from_secs(61)).await;

                assert_eq!(
                    *chat.calls.borrow(),
                    vec![
                        ChatCall::CreateThread("AD8IS-10 via APRS".into()),
                        ChatCall::Text(ThreadId(900)),
                        ChatCall::Card(ThreadId(900), 5),
                    ]
                );
                // Two ack rounds (new + duplicate), each transmitted twice.
                assert_eq!(acks(&sink), 4);
                assert_eq!(engine.conversation(&call("AD8IS-10")), Some(ThreadId(900)));

                feed(producer, vec![message(6)]);
                tokio::time::sleep(Duration::from_secs(1)).await;
                assert_eq!(chat.calls.borrow().last(), Some(&ChatCall::Card(ThreadId(900), 6)));

                closer.close();
                task.await.unwrap();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn chat_failure_still_acks_radio_side() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                let chat = Rc::new(RecordingChat {
                    fail_threads: true,
                    ..RecordingChat::default()
                });
                let (producer, consumer) = bridge_queue(8);
                let closer = consumer.closer();
                let task =
                    tokio::task::spawn_local(run_inbound(engine.clone(), chat.clone(), consumer));

                feed(producer, vec![message(1)]);
                tokio::time::sleep(Duration::from_secs(31)).await;

                assert_eq!(acks(&sink), 2);
                assert_eq!(engine.conversation(&call("AD8IS-10")), None);
                closer.close();
                task.await.unwrap();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_card_post_does_not_hold_back_later_acks() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                let chat = Rc::new(RecordingChat {
                    card_delay: Some(Duration::from_secs(60)),
                    ..RecordingChat::default()
                });
                let (producer, consumer) = bridge_queue(8);
                let closer = consumer.closer();
                let task =
                    tokio::task::spawn_local(run_inbound(engine.clone(), chat.clone(), consumer));

                let other = Frame::Message {
                    from: call("K8XYZ"),
                    to: call("PPRAA"),
                    text: "second station".into(),
                    seq: 1,
                    via: None,
                };
                feed(producer, vec![message(5), other]);
                tokio::time::sleep(Duration::from_secs(1)).await;

                // Both first ack transmissions went out while the first card is still posting.
                assert_eq!(acks(&sink), 2);
                assert!(!chat
                    .calls
                    .borrow()
                    .iter()
                    .any(|c| matches!(c, ChatCall::Card(..))));

                tokio::time::sleep(Duration::from_secs(60)).await;
                let cards = chat
                    .calls
                    .borrow()
                    .iter()
                    .filter(|c| matches!(c, ChatCall::Card(..)))
                    .count();
                assert_eq!(cards, 2);
                closer.close();
                task.await.unwrap();
            })
            .await;
    }

    fn reply(thread: u64, name: &str) -> ChatReply {
        ChatReply {
            reply: ReplyRef {
                thread: ThreadId(thread),
                message: 555,
            },
            thread_name: name.into(),
            author_call: call("KD8ABC"),
            content: "good copy".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledged_reply_gets_queued_then_delivered_reactions() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                engine.bind_conversation(&call("AD8IS-10"), ThreadId(900));
                let chat = Rc::new(RecordingChat::default());
                let (tx, rx) = mpsc::channel(4);
                let task =
                    tokio::task::spawn_local(run_outbound(engine.clone(), chat.clone(), rx));

                tx.send(reply(900, "AD8IS-10 via APRS")).await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
                assert_eq!(
                    sink.sent(),
                    vec!["PPRAA>APP614,TCPIP*::AD8IS-10 :KD8ABC-good copy{1".to_string()]
                );
                engine.handle_inbound(Frame::Ack {
                    from: call("AD8IS-10"),
                    to: call("PPRAA"),
                    seq: 1,
                });
                tokio::time::sleep(Duration::from_secs(2)).await;

                assert_eq!(
                    *chat.calls.borrow(),
                    vec![
                        ChatCall::React(555, Reaction::Queued),
                        ChatCall::React(555, Reaction::Acknowledged),
                    ]
                );
                drop(tx);
                task.await.unwrap();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_reply_is_marked_unconfirmed() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                let chat = Rc::new(RecordingChat::default());
                let (tx, rx) = mpsc::channel(4);
                let task =
                    tokio::task::spawn_local(run_outbound(engine.clone(), chat.clone(), rx));

                // Unknown thread, but named like ours: adopted.
                tx.send(reply(321, "K8XYZ via APRS")).await.unwrap();
                tokio::time::sleep(Duration::from_secs(91)).await;

                assert_eq!(sink.sent().len(), 3);
                assert_eq!(engine.peer_for_conversation(ThreadId(321)), Some(call("K8XYZ")));
                assert_eq!(
                    chat.calls.borrow().last(),
                    Some(&ChatCall::React(555, Reaction::Unconfirmed))
                );
                drop(tx);
                task.await.unwrap();
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn reply_in_foreign_thread_is_ignored() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (engine, sink) = engine();
                let engine = Rc::new(engine);
                let chat = Rc::new(RecordingChat::default());
                let (tx, rx) = mpsc::channel(4);
                let task =
                    tokio::task::spawn_local(run_outbound(engine.clone(), chat.clone(), rx));

                tx.send(reply(42, "general chatter")).await.unwrap();
                drop(tx);
                task.await.unwrap();

                assert!(sink.sent().is_empty());
                assert!(chat.calls.borrow().is_empty());
            })
            .await;
    }

    #[test]
    fn thread_names_roundtrip_peer() {
        let peer = call("AD8IS-10");
        assert_eq!(peer_from_thread_name(&thread_name(&peer)), Some(peer));
        assert_eq!(peer_from_thread_name("AD8IS-10 on HF"), None);
    }
}
