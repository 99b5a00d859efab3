//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use aprsbot_core::{engine::DEFAULT_POLL_INTERVAL, Callsign, DeliverySettings};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/aprsbot/config.toml or /etc/aprsbot/config.toml
/// (or `--config PATH`). Env overrides: DISCORD_BOT_SECRET, DISCORD_BOT_CHANNEL,
/// DISCORD_BOT_CALL, APRS_CALL, APRS_PASSWD, APRS_HOST, APRS_PORT, APRS_MSGNO.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Callsign the bot answers to on APRS.
    #[serde(default)]
    pub bot_call: String,
    /// Licensed callsign used to log in to APRS-IS.
    #[serde(default)]
    pub admin_call: String,
    /// APRS-IS passcode. Computed from `admin_call` when absent.
    #[serde(default)]
    pub admin_pass: Option<String>,
    #[serde(default = "default_aprs_host")]
    pub aprs_host: String,
    #[serde(default = "default_aprs_port")]
    pub aprs_port: u16,
    #[serde(default)]
    pub discord_token: String,
    /// Channel whose threads carry the conversations.
    #[serde(default)]
    pub channel_id: u64,
    /// Role names a member must all hold to transmit. Empty disables the check.
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// First outbound sequence number. Time-derived when absent.
    #[serde(default)]
    pub first_seq: Option<u32>,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_double_tap_secs")]
    pub double_tap_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// How often chat threads are checked for new replies.
    #[serde(default = "default_reply_poll_secs")]
    pub reply_poll_secs: u64,
    /// Log frames instead of transmitting them.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_aprs_host() -> String {
    "noam.aprs2.net".to_string()
}
fn default_aprs_port() -> u16 {
    14580
}
fn default_max_tries() -> u32 {
    aprsbot_core::engine::DEFAULT_MAX_TRIES
}
fn default_ack_timeout_secs() -> u64 {
    30
}
fn default_double_tap_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    aprsbot_core::DEFAULT_CACHE_CAPACITY
}
fn default_queue_capacity() -> usize {
    aprsbot_core::DEFAULT_QUEUE_CAPACITY
}
fn default_reply_poll_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_call: String::new(),
            admin_call: String::new(),
            admin_pass: None,
            aprs_host: default_aprs_host(),
            aprs_port: default_aprs_port(),
            discord_token: String::new(),
            channel_id: 0,
            required_roles: Vec::new(),
            first_seq: None,
            max_tries: default_max_tries(),
            ack_timeout_secs: default_ack_timeout_secs(),
            double_tap_secs: default_double_tap_secs(),
            cache_capacity: default_cache_capacity(),
            queue_capacity: default_queue_capacity(),
            reply_poll_secs: default_reply_poll_secs(),
            dry_run: false,
            log_level: default_log_level(),
        }
    }
}

/// Load config: default, then config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => read_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => read_file(&path)?,
            None => Config::default(),
        },
    };
    c.apply_env(|key| std::env::var(key).ok())?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/aprsbot/config.toml"));
    }
    out.push(PathBuf::from("/etc/aprsbot/config.toml"));
    out
}

fn read_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

impl Config {
    /// Override fields from environment variables, as returned by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(s) = lookup("DISCORD_BOT_SECRET") {
            self.discord_token = s;
        }
        if let Some(s) = lookup("DISCORD_BOT_CHANNEL") {
            self.channel_id = s
                .trim()
                .parse()
                .with_context(|| format!("DISCORD_BOT_CHANNEL is not a channel id: {s:?}"))?;
        }
        if let Some(s) = lookup("DISCORD_BOT_CALL") {
            self.bot_call = s;
        }
        if let Some(s) = lookup("APRS_CALL") {
            self.admin_call = s;
        }
        if let Some(s) = lookup("APRS_PASSWD") {
            self.admin_pass = Some(s);
        }
        if let Some(s) = lookup("APRS_HOST") {
            self.aprs_host = s;
        }
        if let Some(s) = lookup("APRS_PORT") {
            self.aprs_port = s
                .trim()
                .parse()
                .with_context(|| format!("APRS_PORT is not a port: {s:?}"))?;
        }
        if let Some(s) = lookup("APRS_MSGNO") {
            self.first_seq = Some(
                s.trim()
                    .parse()
                    .with_context(|| format!("APRS_MSGNO is not a number: {s:?}"))?,
            );
        }
        Ok(())
    }

    /// Check that everything needed to start the bridge is present.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.bot_callsign()?;
        self.admin_callsign()?;
        if self.discord_token.trim().is_empty() {
            bail!("discord_token is not set (DISCORD_BOT_SECRET)");
        }
        if self.channel_id == 0 {
            bail!("channel_id is not set (DISCORD_BOT_CHANNEL)");
        }
        Ok(())
    }

    pub fn bot_callsign(&self) -> anyhow::Result<Callsign> {
        Callsign::new(&self.bot_call).context("bot_call (DISCORD_BOT_CALL)")
    }

    pub fn admin_callsign(&self) -> anyhow::Result<Callsign> {
        Callsign::new(&self.admin_call).context("admin_call (APRS_CALL)")
    }

    pub fn reply_poll_interval(&self) -> Duration {
        Duration::from_secs(self.reply_poll_secs.max(1))
    }

    pub fn to_settings(&self) -> DeliverySettings {
        DeliverySettings {
            max_tries: self.max_tries.max(1),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
            double_tap_delay: Duration::from_secs(self.double_tap_secs),
            cache_capacity: self.cache_capacity,
            first_seq: self.first_seq.filter(|s| *s > 0).unwrap_or_else(time_based_seq),
        }
    }
}

/// Tens of seconds since the epoch, mod 100, plus one: never 0, rarely a recent number.
fn time_based_seq() -> u32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (secs / 10 % 100) as u32 + 1
}
