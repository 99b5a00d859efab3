//! Discord over REST: thread/message/reaction calls and a reply poller.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, SecondsFormat, Utc};
use aprsbot_core::{
    Callsign, ChatError, ChatPlatform, ChatReply, InboundCard, Presence, Reaction, ReplyRef,
    ThreadId,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const API_BASE: &str = "https://discord.com/api/v10";
const PUBLIC_THREAD: u8 = 11;
const THREAD_SLOWMODE_SECS: u64 = 30;
const THREAD_ARCHIVE_MINUTES: u64 = 1440;
const MESSAGES_PER_FETCH: u32 = 50;
const MAX_RATE_LIMIT_WAIT_SECS: f64 = 60.0;

/// Discord ids arrive as decimal strings.
fn snowflake<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    let s = String::deserialize(d)?;
    s.parse().map_err(serde::de::Error::custom)
}

fn snowflakes<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
    Vec::<String>::deserialize(d)?
        .iter()
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .collect()
}

fn opt_snowflake<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Deserialize)]
struct User {
    #[serde(deserialize_with = "snowflake")]
    id: u64,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(deserialize_with = "snowflake")]
    id: u64,
    #[serde(default, deserialize_with = "opt_snowflake")]
    guild_id: Option<u64>,
    #[serde(default, deserialize_with = "opt_snowflake")]
    parent_id: Option<u64>,
    #[serde(default)]
    name: String,
    #[serde(default, deserialize_with = "opt_snowflake")]
    last_message_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Role {
    #[serde(deserialize_with = "snowflake")]
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ActiveThreads {
    threads: Vec<Channel>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(deserialize_with = "snowflake")]
    id: u64,
    author: User,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct Member {
    #[serde(default)]
    nick: Option<String>,
    #[serde(deserialize_with = "snowflakes")]
    roles: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

/// REST session bound to one guild channel.
pub struct Discord {
    http: reqwest::Client,
    channel_id: u64,
    guild_id: u64,
    bot_user_id: u64,
    required_roles: Vec<u64>,
    bot_call: Callsign,
}

impl Discord {
    /// Authenticate and resolve the bot user, the channel's guild, and role names to ids.
    pub async fn connect(
        token: &str,
        channel_id: u64,
        required_roles: &[String],
        bot_call: Callsign,
    ) -> anyhow::Result<Discord> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bot {}", token.trim()))
            .context("discord token is not a valid header value")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("aprsbot (https://aprs.fi, ", env!("CARGO_PKG_VERSION"), ")"))
            .build()
            .context("building HTTP client")?;

        let mut discord = Discord {
            http,
            channel_id,
            guild_id: 0,
            bot_user_id: 0,
            required_roles: Vec::new(),
            bot_call,
        };
        let me: User = discord
            .call(Method::GET, "/users/@me", None)
            .await
            .context("discord login")?;
        discord.bot_user_id = me.id;

        let channel: Channel = discord
            .call(Method::GET, &format!("/channels/{channel_id}"), None)
            .await
            .with_context(|| format!("fetching channel {channel_id}"))?;
        let Some(guild_id) = channel.guild_id else {
            bail!("channel {channel_id} is not a guild channel");
        };
        discord.guild_id = guild_id;

        let roles: Vec<Role> = discord
            .call(Method::GET, &format!("/guilds/{guild_id}/roles"), None)
            .await
            .context("fetching guild roles")?;
        discord.required_roles = resolve_roles(&roles, required_roles)?;
        tracing::info!(
            bot_user = me.id,
            channel = channel_id,
            guild = guild_id,
            name = %channel.name,
            "discord ready"
        );
        Ok(discord)
    }

    /// One REST call, decoded as JSON. A single rate-limit response is waited out.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ChatError> {
        let response = self.send(method, path, body).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| ChatError::Protocol(format!("{path}: {e}")))
    }

    /// Like [`Discord::call`], for endpoints whose response body is not needed.
    async fn call_unit(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<(), ChatError> {
        self.send(method, path, body).await.map(drop)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, ChatError> {
        let url = format!("{API_BASE}{path}");
        for attempt in 1..=2 {
            let mut req = self.http.request(method.clone(), &url);
            req = match body {
                Some(body) => req.json(body),
                // PUT without a body still needs a length for Discord.
                None => req.header(reqwest::header::CONTENT_LENGTH, 0),
            };
            let response = req
                .send()
                .await
                .map_err(|e| ChatError::Transport(e.to_string()))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            let text = response.text().await.unwrap_or_default();
            if attempt == 1 {
                if let Some(wait) = rate_limit_wait(status, &text) {
                    tracing::debug!(path, ?wait, "rate limited");
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }
            return Err(ChatError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }
        Err(ChatError::Protocol(format!("{path}: still rate limited")))
    }
}

/// How long to back off before retrying a rate-limited request, capped at a minute.
fn rate_limit_wait(status: StatusCode, body: &str) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let limit: RateLimited = serde_json::from_str(body).ok()?;
    Some(Duration::from_secs_f64(limit.retry_after.clamp(0.0, MAX_RATE_LIMIT_WAIT_SECS)))
}

fn resolve_roles(roles: &[Role], names: &[String]) -> anyhow::Result<Vec<u64>> {
    names
        .iter()
        .map(|name| {
            roles
                .iter()
                .find(|r| &r.name == name)
                .map(|r| r.id)
                .with_context(|| format!("required role {name:?} does not exist in the guild"))
        })
        .collect()
}

/// Percent-encoded emoji for the reactions endpoint.
fn reaction_emoji(reaction: Reaction) -> &'static str {
    match reaction {
        // outbox tray
        Reaction::Queued => "%F0%9F%93%A4",
        // mobile phone with arrow
        Reaction::Acknowledged => "%F0%9F%93%B2",
        // white question mark
        Reaction::Unconfirmed => "%E2%9D%94",
        // warning sign
        Reaction::Failed => "%E2%9A%A0%EF%B8%8F",
    }
}

fn card_embed(card: &InboundCard) -> Value {
    let received: DateTime<Utc> = card.received_at.into();
    json!({
        "title": format!("{}: ", card.from),
        "type": "rich",
        "description": card.text,
        "url": format!("https://aprs.fi/?c=raw&call={}", card.from),
        "timestamp": received.to_rfc3339_opts(SecondsFormat::Millis, true),
        "fields": [
            { "name": "via", "value": card.via.as_deref().unwrap_or("APRS-IS"), "inline": true },
            { "name": "msgNo", "value": card.seq.to_string(), "inline": true },
        ],
    })
}

/// Callsign from a `"Name | CALL"` server nickname.
fn callsign_from_nick(nick: &str) -> Option<Callsign> {
    let (_, call) = nick.split_once('|')?;
    Callsign::new(call).ok()
}

impl ChatPlatform for Discord {
    async fn create_thread(&self, name: &str) -> Result<ThreadId, ChatError> {
        let body = json!({
            "name": name,
            "type": PUBLIC_THREAD,
            "auto_archive_duration": THREAD_ARCHIVE_MINUTES,
            "rate_limit_per_user": THREAD_SLOWMODE_SECS,
        });
        let thread: Channel = self
            .call(
                Method::POST,
                &format!("/channels/{}/threads", self.channel_id),
                Some(&body),
            )
            .await?;
        Ok(ThreadId(thread.id))
    }

    async fn post_text(&self, thread: ThreadId, content: &str) -> Result<(), ChatError> {
        self.call_unit(
            Method::POST,
            &format!("/channels/{thread}/messages"),
            Some(&json!({ "content": content })),
        )
        .await
    }

    async fn post_card(&self, thread: ThreadId, card: &InboundCard) -> Result<(), ChatError> {
        self.call_unit(
            Method::POST,
            &format!("/channels/{thread}/messages"),
            Some(&json!({ "embeds": [card_embed(card)] })),
        )
        .await
    }

    async fn react(&self, target: ReplyRef, reaction: Reaction) -> Result<(), ChatError> {
        self.call_unit(
            Method::PUT,
            &format!(
                "/channels/{}/messages/{}/reactions/{}/@me",
                target.thread,
                target.message,
                reaction_emoji(reaction)
            ),
            None,
        )
        .await
    }

    /// Bots cannot set presence over REST; post a status line in the channel instead.
    async fn set_presence(&self, presence: Presence) -> Result<(), ChatError> {
        let content = match presence {
            Presence::Online => format!("online: listening to APRS-IS for \"{}\"", self.bot_call),
            Presence::Offline => "offline".to_string(),
        };
        self.post_text(ThreadId(self.channel_id), &content).await
    }
}

/// Poll active threads under the channel and forward authorized replies.
/// Returns when the reply receiver is gone.
pub async fn poll_replies(discord: Rc<Discord>, replies: mpsc::Sender<ChatReply>, every: Duration) {
    let mut poller = ReplyPoller {
        bot_user_id: discord.bot_user_id,
        required_roles: discord.required_roles.clone(),
        source: discord,
        cursors: Cursors::default(),
    };
    let mut tick = tokio::time::interval(every);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        match poller.poll(&replies).await {
            Ok(()) => {}
            Err(PollError::Closed) => {
                tracing::debug!("reply receiver gone, poller exiting");
                return;
            }
            Err(PollError::Chat(e)) => tracing::warn!(error = %e, "reply poll failed"),
        }
    }
}

/// What the reply poller reads from the chat service.
trait ReplySource {
    /// Active threads under the bridge channel.
    async fn active_threads(&self) -> Result<Vec<Channel>, ChatError>;
    async fn messages_after(&self, thread: u64, after: u64) -> Result<Vec<Message>, ChatError>;
    async fn member(&self, user: u64) -> Result<Member, ChatError>;
}

impl ReplySource for Discord {
    async fn active_threads(&self) -> Result<Vec<Channel>, ChatError> {
        let active: ActiveThreads = self
            .call(
                Method::GET,
                &format!("/guilds/{}/threads/active", self.guild_id),
                None,
            )
            .await?;
        Ok(active
            .threads
            .into_iter()
            .filter(|t| t.parent_id == Some(self.channel_id))
            .collect())
    }

    async fn messages_after(&self, thread: u64, after: u64) -> Result<Vec<Message>, ChatError> {
        self.call(
            Method::GET,
            &format!("/channels/{thread}/messages?after={after}&limit={MESSAGES_PER_FETCH}"),
            None,
        )
        .await
    }

    async fn member(&self, user: u64) -> Result<Member, ChatError> {
        self.call(
            Method::GET,
            &format!("/guilds/{}/members/{user}", self.guild_id),
            None,
        )
        .await
    }
}

enum PollError {
    Closed,
    Chat(ChatError),
}

impl From<ChatError> for PollError {
    fn from(e: ChatError) -> Self {
        PollError::Chat(e)
    }
}

/// Newest handled message id per thread.
#[derive(Debug, Default)]
struct Cursors {
    by_thread: HashMap<u64, u64>,
    /// False until the first pass; history from before startup is not replayed.
    seeded: bool,
}

impl Cursors {
    /// Id to fetch `thread` after, or `None` when it has nothing new this pass.
    fn fetch_from(&mut self, thread: &Channel) -> Option<u64> {
        let cursor = match self.by_thread.get(&thread.id) {
            Some(cursor) => *cursor,
            None if !self.seeded => {
                self.by_thread
                    .insert(thread.id, thread.last_message_id.unwrap_or(thread.id));
                return None;
            }
            // Thread opened since the first pass: everything in it is new.
            None => *self.by_thread.entry(thread.id).or_insert(thread.id),
        };
        match thread.last_message_id {
            Some(last) if last <= cursor => None,
            _ => Some(cursor),
        }
    }

    fn advance(&mut self, thread: u64, to: u64) {
        let cursor = self.by_thread.entry(thread).or_insert(to);
        *cursor = (*cursor).max(to);
    }

    fn end_pass(&mut self) {
        self.seeded = true;
    }
}

/// Member lookups that will not succeed on retry (e.g. the author left the guild).
fn is_permanent(e: &ChatError) -> bool {
    matches!(e, ChatError::Rejected { status, .. } if (400..500).contains(status) && *status != 429)
}

struct ReplyPoller<D> {
    source: Rc<D>,
    bot_user_id: u64,
    required_roles: Vec<u64>,
    cursors: Cursors,
}

impl<D: ReplySource> ReplyPoller<D> {
    async fn poll(&mut self, replies: &mpsc::Sender<ChatReply>) -> Result<(), PollError> {
        let threads = self.source.active_threads().await?;
        for thread in threads {
            let Some(after) = self.cursors.fetch_from(&thread) else {
                continue;
            };
            match self.source.messages_after(thread.id, after).await {
                Ok(messages) => self.relay_batch(&thread, messages, replies).await?,
                Err(e) => {
                    tracing::warn!(thread = thread.id, error = %e, "fetching thread messages failed");
                }
            }
        }
        self.cursors.end_pass();
        Ok(())
    }

    /// Forward one thread's new messages in order. The cursor moves past a message
    /// only once it is handled; a transient lookup failure leaves the rest for the
    /// next pass.
    async fn relay_batch(
        &mut self,
        thread: &Channel,
        messages: Vec<Message>,
        replies: &mpsc::Sender<ChatReply>,
    ) -> Result<(), PollError> {
        let newest = messages.iter().map(|m| m.id).max();
        for message in human_messages(messages, self.bot_user_id) {
            let id = message.id;
            match self.authorize(thread, message).await {
                Ok(Some(reply)) => replies.send(reply).await.map_err(|_| PollError::Closed)?,
                Ok(None) => {}
                Err(e) if is_permanent(&e) => {
                    tracing::warn!(thread = %thread.name, message = id, error = %e, "author lookup rejected, reply skipped");
                }
                Err(e) => {
                    tracing::warn!(thread = %thread.name, message = id, error = %e, "author lookup failed, retrying next poll");
                    return Ok(());
                }
            }
            self.cursors.advance(thread.id, id);
        }
        if let Some(newest) = newest {
            self.cursors.advance(thread.id, newest);
        }
        Ok(())
    }

    /// Turn a thread message into a reply if its author may transmit.
    async fn authorize(
        &self,
        thread: &Channel,
        message: Message,
    ) -> Result<Option<ChatReply>, ChatError> {
        let member = self.source.member(message.author.id).await?;
        let nick = member.nick.as_deref().unwrap_or_default();
        if let Some(missing) = self
            .required_roles
            .iter()
            .find(|role| !member.roles.contains(role))
        {
            tracing::info!(nick, role = missing, thread = %thread.name, "author lacks a required role");
            return Ok(None);
        }
        let Some(author_call) = callsign_from_nick(nick) else {
            tracing::info!(nick, thread = %thread.name, "no callsign in author nickname");
            return Ok(None);
        };
        Ok(Some(ChatReply {
            reply: ReplyRef {
                thread: ThreadId(thread.id),
                message: message.id,
            },
            thread_name: thread.name.clone(),
            author_call,
            content: message.content,
        }))
    }
}

/// Messages not written by a bot, with content, oldest first.
fn human_messages(mut messages: Vec<Message>, bot_user_id: u64) -> Vec<Message> {
    messages.retain(|m| m.author.id != bot_user_id && !m.author.bot && !m.content.trim().is_empty());
    messages.sort_by_key(|m| m.id);
    messages
}
