/// Chat command routing.
///
/// `help` is public. `start`, `stop` and `stats` go through the
/// [`AccessGuard`] first; a denied principal gets the refusal and nothing else.
use std::sync::Arc;

use tracing::{info, warn};

use crate::access::{AccessGuard, Authorization, Principal};
use crate::error::MonitorError;
use crate::monitor::{Monitor, SubscribeOutcome};
use crate::sink::render_stats;
use crate::transport::{ChatId, OutgoingMessage, Transport};

pub const HELP_TEXT: &str = "\
The bot continuously parses the OpenVPN status log and notifies you when it detects changes between checks.
Use /start to start monitoring the connection log.
Use /stop to stop monitoring.
Use /stats to print current statistics from the OpenVPN server.";

const START_TEXT: &str =
    "Starting the OpenVPN monitor. Will continuously check the status log for changes.";
const ALREADY_STARTED_TEXT: &str = "The OpenVPN monitor is already running for you.";
const STOP_TEXT: &str = "Stopped watching the OpenVPN status log.";
const NOT_STARTED_TEXT: &str = "You have no active watch. Send /start to begin.";
const SHUTTING_DOWN_TEXT: &str = "The monitor is shutting down.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Start,
    Stop,
    Stats,
    Unknown(String),
}

impl Command {
    /// Parses the leading `/name` or `/name@bot` word of a message.
    ///
    /// Returns `None` for plain text and for commands addressed to another bot.
    pub fn parse(text: &str, bot_username: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.strip_prefix('/')?;
        let name = match word.split_once('@') {
            Some((name, target)) if target.eq_ignore_ascii_case(bot_username) => name,
            Some(_) => return None,
            None => word,
        };

        Some(match name.to_ascii_lowercase().as_str() {
            "help" => Command::Help,
            "start" => Command::Start,
            "stop" => Command::Stop,
            "stats" => Command::Stats,
            _ => Command::Unknown(name.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Help => "help",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Stats => "stats",
            Command::Unknown(name) => name,
        }
    }
}

/// A parsed command together with who sent it and where to answer.
#[derive(Debug, Clone)]
pub struct IncomingCommand {
    pub principal: Principal,
    pub chat: ChatId,
    pub command: Command,
}

pub struct CommandContext {
    monitor: Monitor,
    guard: AccessGuard,
    transport: Arc<dyn Transport>,
}

impl CommandContext {
    pub fn new(monitor: Monitor, guard: AccessGuard, transport: Arc<dyn Transport>) -> Self {
        Self {
            monitor,
            guard,
            transport,
        }
    }

    /// Runs one command to completion. Never fails: reply errors are logged.
    pub async fn handle(&self, incoming: IncomingCommand) {
        let IncomingCommand {
            principal,
            chat,
            command,
        } = incoming;

        let reply = match &command {
            Command::Help => OutgoingMessage::markdown(HELP_TEXT),
            Command::Unknown(name) => OutgoingMessage::plain(format!(
                "Unknown command /{name}. Send /help for the list of commands."
            )),
            privileged => {
                let decision = self
                    .guard
                    .intercept(&principal, privileged.name(), self.transport.as_ref(), chat)
                    .await;
                if decision == Authorization::Denied {
                    return;
                }
                match privileged {
                    Command::Start => self.start(principal.clone(), chat),
                    Command::Stop => self.stop(&principal).await,
                    _ => {
                        info!(%principal, "Stats requested");
                        OutgoingMessage::plain(stats_report(&self.monitor))
                    }
                }
            }
        };

        if let Err(e) = self.transport.send(chat, &reply).await {
            warn!(%principal, %chat, command = command.name(), "Failed to send reply: {e}");
        }
    }

    fn start(&self, principal: Principal, chat: ChatId) -> OutgoingMessage {
        let header = match self.monitor.subscribe(principal.clone(), chat) {
            Ok(SubscribeOutcome::Created) => {
                info!(%principal, "Enabled the OpenVPN monitor");
                START_TEXT
            }
            Ok(SubscribeOutcome::AlreadySubscribed) => ALREADY_STARTED_TEXT,
            Err(MonitorError::Stopped) => return OutgoingMessage::plain(SHUTTING_DOWN_TEXT),
            Err(e) => {
                warn!(%principal, "Subscribe failed: {e}");
                return OutgoingMessage::plain(SHUTTING_DOWN_TEXT);
            }
        };
        OutgoingMessage::plain(format!("{header}\n\n{}", stats_report(&self.monitor)))
    }

    async fn stop(&self, principal: &Principal) -> OutgoingMessage {
        if self.monitor.unsubscribe(principal).await {
            OutgoingMessage::plain(STOP_TEXT)
        } else {
            OutgoingMessage::plain(NOT_STARTED_TEXT)
        }
    }
}

/// The stats dump, plus a warning line when the latest refresh failed.
pub fn stats_report(monitor: &Monitor) -> String {
    let mut text = render_stats(&monitor.snapshot());
    if let Some(failure) = monitor.last_failure() {
        text.push_str(&format!(
            "⚠ Last refresh failed at {}: {}\n",
            failure.at.format("%Y-%m-%d %H:%M:%S UTC"),
            failure.reason
        ));
    }
    text
}
