// aprsbot daemon: bridges APRS-IS messages to Discord threads and back.

mod config;
mod discord;
mod feed;

use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context};
use aprsbot_core::{bridge_queue, pipeline, ChatPlatform, DeliveryEngine, Presence};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long the inbound bridge gets to drain after the queue is closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut dry_run = false;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("aprsbot-daemon {}", VERSION);
                return Ok(());
            }
            "--dry-run" => dry_run = true,
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument {other:?} (expected --version, --dry-run, --config PATH)"),
        }
    }

    let mut cfg = config::load(config_path.as_deref())?;
    cfg.dry_run |= dry_run;
    init_tracing(&cfg.log_level);
    cfg.validate()?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, run(cfg))
}

/// `RUST_LOG` wins; otherwise the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let bot_call = cfg.bot_callsign()?;
    let admin_call = cfg.admin_callsign()?;
    let passcode = match &cfg.admin_pass {
        Some(pass) => pass.clone(),
        None => {
            let pass = feed::passcode(&admin_call).to_string();
            tracing::warn!(call = %admin_call, passcode = %pass, "no APRS-IS passcode configured, using the computed one");
            pass
        }
    };
    if cfg.dry_run {
        tracing::warn!("dry run: frames will be logged, not transmitted");
    }

    let discord = Rc::new(
        discord::Discord::connect(
            &cfg.discord_token,
            cfg.channel_id,
            &cfg.required_roles,
            bot_call.clone(),
        )
        .await?,
    );
    if let Err(e) = discord.set_presence(Presence::Online).await {
        tracing::warn!(error = %e, "failed to announce presence");
    }

    let login = feed::Login {
        call: admin_call,
        passcode,
        bot_call: bot_call.clone(),
    };
    let (host, port, dry) = (cfg.aprs_host.clone(), cfg.aprs_port, cfg.dry_run);
    let (aprs, reader) =
        tokio::task::spawn_blocking(move || feed::AprsIs::connect(&login, &host, port, dry))
            .await
            .context("APRS-IS connect task")?
            .with_context(|| format!("logging in to APRS-IS at {}:{}", cfg.aprs_host, port))?;
    aprs.set_filter(&format!("g/{bot_call}"))?;
    let aprs = Rc::new(aprs);

    let engine = Rc::new(DeliveryEngine::new(
        bot_call.clone(),
        aprs.clone(),
        cfg.to_settings(),
    ));
    let (producer, consumer) = bridge_queue(cfg.queue_capacity);
    let closer = consumer.closer();
    // Never joined; it sees EOF once the socket is shut down.
    reader
        .spawn(producer)
        .context("spawning APRS-IS reader thread")?;

    let (reply_tx, reply_rx) = mpsc::channel(cfg.queue_capacity.max(1));
    let mut inbound = tokio::task::spawn_local(pipeline::run_inbound(
        engine.clone(),
        discord.clone(),
        consumer,
    ));
    let outbound =
        tokio::task::spawn_local(pipeline::run_outbound(engine.clone(), discord.clone(), reply_rx));
    let poller = tokio::task::spawn_local(discord::poll_replies(
        discord.clone(),
        reply_tx,
        cfg.reply_poll_interval(),
    ));
    tracing::info!(%bot_call, first_seq = engine.settings().first_seq, "bridge running");

    let feed_lost = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            false
        }
        _ = &mut inbound => true,
    };

    tracing::info!("shutting down");
    closer.close();
    if let Err(e) = discord.set_presence(Presence::Offline).await {
        tracing::warn!(error = %e, "failed to announce shutdown");
    }
    aprs.close();
    if !feed_lost && tokio::time::timeout(SHUTDOWN_GRACE, inbound).await.is_err() {
        tracing::warn!("inbound bridge did not stop in time");
    }
    poller.abort();
    outbound.abort();

    if feed_lost {
        bail!("APRS-IS feed ended");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
