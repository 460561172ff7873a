mod access;
mod client;
mod commands;
mod config;
mod diff;
mod error;
mod event;
mod monitor;
mod sink;
mod source;
mod status_parser;
mod transport;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::access::AccessGuard;
use crate::commands::CommandContext;
use crate::config::RunMode;
use crate::error::{ConfigError, MonitorError};
use crate::event::DaemonEvent;
use crate::monitor::Monitor;
use crate::sink::EventSink;
use crate::source::{FileStatusSource, StatusSource};
use crate::transport::telegram::{self, TelegramClient};
use crate::transport::Transport;

#[derive(Parser, Debug)]
#[command(name = "ovpn-watch", version)]
#[command(about = "Notifies Telegram chats when OpenVPN clients connect or disconnect")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "OVPN_WATCH_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Dotenv file with OPENVPN_STATUS_LOG_FILE, TOKEN and WHITELIST; skipped if absent
    #[arg(long, default_value = config::DEFAULT_ENV_FILE)]
    env_file: PathBuf,

    /// Print the currently connected clients and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            if e.chain().any(|cause| cause.is::<ConfigError>()) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

async fn run(args: Args) -> Result<()> {
    // ── Configuration ─────────────────────────────────────────────────────────
    let mode = if args.once { RunMode::Once } else { RunMode::Bot };
    let settings = config::load(&args.config, &args.env_file, mode)
        .with_context(|| format!("Invalid configuration ({})", args.config.display()))?;

    info!(
        path = %settings.status_path.display(),
        identity_key = %settings.identity_key,
        "Watching OpenVPN status file"
    );
    let source: Arc<dyn StatusSource> = Arc::new(FileStatusSource::new(
        &settings.status_path,
        settings.identity_key,
        settings.sample_timeout,
    ));

    if args.once {
        return print_once(source.as_ref()).await;
    }

    // ── Transport ─────────────────────────────────────────────────────────────
    let telegram_settings = settings
        .telegram
        .context("Telegram settings are required in bot mode")?;
    let client = Arc::new(
        TelegramClient::new(
            &telegram_settings.api_url,
            &telegram_settings.token,
            telegram_settings.long_poll_timeout,
        )
        .context("Failed to build the Telegram client")?,
    );
    let me = client
        .get_me()
        .await
        .context("Telegram did not accept the bot token")?;
    let bot_username = me.username.unwrap_or_default();
    info!(bot = %bot_username, "Authenticated with Telegram");

    // ── Monitor ───────────────────────────────────────────────────────────────
    let transport: Arc<dyn Transport> = client.clone();
    let sink = EventSink::new(Arc::clone(&transport), telegram_settings.delivery_timeout);
    let monitor = Monitor::start(source, sink, settings.monitor)
        .await
        .context("Failed to read the initial OpenVPN status")?;
    let commands = CommandContext::new(
        monitor.clone(),
        AccessGuard::new(settings.allow_list),
        transport,
    );

    // ── Background tasks ──────────────────────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::channel::<DaemonEvent>(32);
    let (stop_tx, stop_rx) = watch::channel(false);
    let update_poller = tokio::spawn(telegram::poll_commands(
        client,
        bot_username,
        event_tx.clone(),
        stop_rx,
    ));

    // Graceful shutdown on Ctrl+C or SIGTERM.
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = event_tx.send(DaemonEvent::Shutdown).await;
    });

    info!(
        state = ?monitor.state(),
        "ovpn-watch v{} started",
        env!("CARGO_PKG_VERSION")
    );

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::Command(command) => commands.handle(command).await,
            DaemonEvent::Shutdown => {
                info!(subscribers = monitor.subscription_count(), "Shutting down");
                break;
            }
        }
    }

    drop(event_rx);
    stop_tx.send_replace(true);
    if let Err(e) = update_poller.await {
        warn!("Update poller ended abnormally: {e}");
    }
    monitor.shutdown().await;
    Ok(())
}

async fn print_once(source: &dyn StatusSource) -> Result<()> {
    let snapshot = source
        .sample()
        .await
        .map_err(MonitorError::InitializationFailed)
        .context("Failed to read the OpenVPN status")?;
    print!("{}", sink::render_stats(&snapshot));
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl+C handler unavailable: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
