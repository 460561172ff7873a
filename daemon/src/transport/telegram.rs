/// Telegram Bot API client.
///
/// Three methods are used: `getMe` to validate the token at startup,
/// `getUpdates` (long polling) to receive commands and `sendMessage` to
/// deliver replies and notifications.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{ChatId, OutgoingMessage, TextFormat, Transport};
use crate::access::Principal;
use crate::commands::{Command, IncomingCommand};
use crate::error::TransportError;
use crate::event::DaemonEvent;

pub const DEFAULT_API_URL: &str = "https://api.telegram.org";

/// Extra time the HTTP client waits on top of the long-poll timeout.
const REQUEST_SLACK: Duration = Duration::from_secs(10);
const MAX_UPDATE_BACKOFF: Duration = Duration::from_secs(60);
/// `sendMessage` rejects longer texts.
const MAX_MESSAGE_CHARS: usize = 4096;

/// Holds the bot token inside `base_url`; keep it out of logs.
#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
    long_poll_timeout: Duration,
}

impl TelegramClient {
    pub fn new(
        api_url: &str,
        token: &str,
        long_poll_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(long_poll_timeout + REQUEST_SLACK)
            .build()?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{token}", api_url.trim_end_matches('/')),
            long_poll_timeout,
        })
    }

    /// Validates the token and returns the bot's own account.
    pub async fn get_me(&self) -> Result<User, TransportError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// Long-polls for updates newer than `offset`.
    pub async fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>, TransportError> {
        let params = GetUpdates {
            offset,
            timeout: self.long_poll_timeout.as_secs(),
            allowed_updates: ["message"],
        };
        self.call("getUpdates", &params).await
    }

    async fn call<P, T>(&self, method: &str, params: &P) -> Result<T, TransportError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(params)
            .send()
            .await?;

        // Failed calls still carry a JSON body with `ok: false`, so the status
        // code alone is only used when that body is missing.
        let status = response.status();
        let body: ApiResponse<T> = match response.json().await {
            Ok(body) => body,
            Err(e) if status.is_success() => return Err(TransportError::Decode(e.to_string())),
            Err(_) => return Err(TransportError::Http(format!("{method} returned {status}"))),
        };
        body.into_result()
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<(), TransportError> {
        for text in split_text(&message.text, MAX_MESSAGE_CHARS) {
            let params = SendMessage::new(chat, text, message.format);
            let _sent: serde_json::Value = self.call("sendMessage", &params).await?;
        }
        Ok(())
    }
}

/// Long-polls `getUpdates` and forwards every recognised command to the
/// daemon's event loop until `stop_rx` fires or the loop goes away.
pub async fn poll_commands(
    client: Arc<TelegramClient>,
    bot_username: String,
    tx: mpsc::Sender<DaemonEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    info!(bot = %bot_username, "Listening for commands");
    let mut offset: Option<i64> = None;
    let mut failures: u32 = 0;

    loop {
        let batch = tokio::select! {
            batch = client.get_updates(offset) => batch,
            _ = stop_rx.changed() => break,
        };

        match batch {
            Ok(updates) => {
                failures = 0;
                if let Some(last) = updates.last() {
                    offset = Some(last.update_id + 1);
                }
                let commands = updates
                    .into_iter()
                    .filter_map(|update| update.into_command(&bot_username));
                if forward(&tx, commands, &mut stop_rx).await == Forward::Stop {
                    break;
                }
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = update_backoff(failures);
                warn!(?delay, "getUpdates failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => break,
                }
            }
        }
    }

    debug!("Update poller stopped");
}

#[derive(Debug, PartialEq, Eq)]
enum Forward {
    Continue,
    Stop,
}

/// Hands commands to the event loop. A full channel must not keep the poller
/// from seeing the stop signal, so every send races `stop_rx`.
async fn forward(
    tx: &mpsc::Sender<DaemonEvent>,
    commands: impl IntoIterator<Item = IncomingCommand>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Forward {
    for command in commands {
        tokio::select! {
            sent = tx.send(DaemonEvent::Command(command)) => {
                if sent.is_err() {
                    return Forward::Stop;
                }
            }
            _ = stop_rx.changed() => return Forward::Stop,
        }
    }
    Forward::Continue
}

/// Splits `text` into pieces of at most `limit` characters, preferring line
/// boundaries. A single overlong line is cut mid-line.
fn split_text(text: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        let hard_cut = rest
            .char_indices()
            .nth(limit)
            .map_or(rest.len(), |(i, _)| i);
        let cut = match rest[..hard_cut].rfind('\n') {
            Some(newline) if newline > 0 => newline + 1,
            _ => hard_cut,
        };
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// 2s, 4s, 8s ... capped at one minute.
fn update_backoff(failures: u32) -> Duration {
    let secs = 2u64.saturating_pow(failures.min(16));
    Duration::from_secs(secs).min(MAX_UPDATE_BACKOFF)
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, TransportError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(TransportError::Api {
                code: self.error_code.unwrap_or_default(),
                description: self
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<i64>,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

impl<'a> SendMessage<'a> {
    fn new(chat: ChatId, text: &'a str, format: TextFormat) -> Self {
        Self {
            chat_id: chat.0,
            text,
            parse_mode: match format {
                TextFormat::Plain => None,
                TextFormat::Markdown => Some("Markdown"),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

impl Update {
    /// Extracts a command from a text message, if there is one.
    pub fn into_command(self, bot_username: &str) -> Option<IncomingCommand> {
        let message = self.message?;
        let command = Command::parse(message.text.as_deref()?, bot_username)?;
        let from = message.from?;
        Some(IncomingCommand {
            principal: from.principal(),
            chat: ChatId(message.chat.id),
            command,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

impl User {
    /// The username when set, otherwise the numeric id.
    pub fn principal(&self) -> Principal {
        match &self.username {
            Some(name) => Principal::new(name.as_str()),
            None => Principal::new(self.id.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(json: &str) -> Update {
        serde_json::from_str(json).unwrap()
    }

    // ── responses ─────────────────────────────────────────────────────────────

    #[test]
    fn successful_response_yields_result() {
        let body: ApiResponse<User> =
            serde_json::from_str(r#"{"ok":true,"result":{"id":7,"is_bot":true,"username":"vpnbot"}}"#)
                .unwrap();
        let me = body.into_result().unwrap();
        assert_eq!(me.username.as_deref(), Some("vpnbot"));
    }

    #[test]
    fn rejected_call_maps_to_api_error() {
        let body: ApiResponse<User> =
            serde_json::from_str(r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#)
                .unwrap();
        match body.into_result() {
            Err(TransportError::Api { code, description }) => {
                assert_eq!(code, 401);
                assert_eq!(description, "Unauthorized");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    // ── requests ──────────────────────────────────────────────────────────────

    #[test]
    fn plain_message_omits_parse_mode() {
        let json =
            serde_json::to_value(SendMessage::new(ChatId(5), "hi", TextFormat::Plain)).unwrap();
        assert_eq!(json, serde_json::json!({"chat_id": 5, "text": "hi"}));
    }

    #[test]
    fn markdown_message_sets_parse_mode() {
        let json =
            serde_json::to_value(SendMessage::new(ChatId(5), "*hi*", TextFormat::Markdown))
                .unwrap();
        assert_eq!(json["parse_mode"], "Markdown");
    }

    #[test]
    fn first_get_updates_has_no_offset() {
        let params = GetUpdates {
            offset: None,
            timeout: 30,
            allowed_updates: ["message"],
        };
        let json = serde_json::to_value(params).unwrap();
        assert!(json.get("offset").is_none());
        assert_eq!(json["timeout"], 30);
    }

    // ── updates ───────────────────────────────────────────────────────────────

    #[test]
    fn command_message_becomes_incoming_command() {
        let cmd = update(
            r#"{"update_id":10,"message":{"message_id":1,"chat":{"id":-42,"type":"group"},
                "from":{"id":9,"is_bot":false,"username":"alice"},"text":"/stats@vpnbot"}}"#,
        )
        .into_command("vpnbot")
        .unwrap();

        assert_eq!(cmd.principal, Principal::new("alice"));
        assert_eq!(cmd.chat, ChatId(-42));
        assert_eq!(cmd.command, Command::Stats);
    }

    #[test]
    fn sender_without_username_is_identified_by_id() {
        let cmd = update(
            r#"{"update_id":11,"message":{"chat":{"id":9},"from":{"id":9,"is_bot":false},"text":"/start"}}"#,
        )
        .into_command("vpnbot")
        .unwrap();
        assert_eq!(cmd.principal, Principal::new("9"));
    }

    #[test]
    fn non_command_updates_are_ignored() {
        let text = update(
            r#"{"update_id":12,"message":{"chat":{"id":9},"from":{"id":9},"text":"hello"}}"#,
        );
        let sticker = update(r#"{"update_id":13,"message":{"chat":{"id":9},"from":{"id":9}}}"#);
        let edited = update(r#"{"update_id":14}"#);

        assert!(text.into_command("vpnbot").is_none());
        assert!(sticker.into_command("vpnbot").is_none());
        assert!(edited.into_command("vpnbot").is_none());
    }

    // ── forwarding ────────────────────────────────────────────────────────────

    fn stats_from(who: &str) -> IncomingCommand {
        IncomingCommand {
            principal: Principal::new(who),
            chat: ChatId(1),
            command: Command::Stats,
        }
    }

    #[tokio::test]
    async fn forward_delivers_commands_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let outcome = forward(&tx, [stats_from("a"), stats_from("b")], &mut stop_rx).await;

        assert_eq!(outcome, Forward::Continue);
        for expected in ["a", "b"] {
            match rx.recv().await {
                Some(DaemonEvent::Command(cmd)) => assert_eq!(cmd.principal, Principal::new(expected)),
                _ => panic!("expected a command"),
            }
        }
    }

    #[tokio::test]
    async fn forward_stops_when_loop_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (_stop_tx, mut stop_rx) = watch::channel(false);

        let outcome = forward(&tx, [stats_from("a")], &mut stop_rx).await;
        assert_eq!(outcome, Forward::Stop);
    }

    #[tokio::test]
    async fn stop_signal_wins_over_a_full_channel() {
        // The receiver stays alive but is never read, as after the event loop exits.
        let (tx, _rx) = mpsc::channel(2);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let forwarding = tokio::spawn(async move {
            let burst = (0..5).map(|i| stats_from(&format!("user{i}")));
            forward(&tx, burst, &mut stop_rx).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send_replace(true);

        let outcome = tokio::time::timeout(Duration::from_secs(5), forwarding)
            .await
            .expect("forwarding should end after the stop signal")
            .unwrap();
        assert_eq!(outcome, Forward::Stop);
    }

    // ── message splitting ─────────────────────────────────────────────────────

    #[test]
    fn short_text_is_sent_whole() {
        assert_eq!(split_text("one\ntwo\n", 4096), ["one\ntwo\n"]);
        assert_eq!(split_text("", 4096), [""]);
    }

    #[test]
    fn long_text_splits_at_line_boundaries() {
        let text = "aaa\nbbb\nccc\n";
        assert_eq!(split_text(text, 8), ["aaa\nbbb\n", "ccc\n"]);
    }

    #[test]
    fn overlong_line_is_cut() {
        assert_eq!(split_text("abcdefghij", 4), ["abcd", "efgh", "ij"]);
    }

    #[test]
    fn splitting_counts_characters_not_bytes() {
        let text = "⚠⚠⚠\n⚠⚠";
        assert_eq!(split_text(text, 4), ["⚠⚠⚠\n", "⚠⚠"]);
    }

    #[test]
    fn large_stats_dump_fits_message_limit() {
        let line = format!("{}\n", "x".repeat(99));
        let dump = line.repeat(120);
        let chunks = split_text(&dump, MAX_MESSAGE_CHARS);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_CHARS));
        assert!(chunks.iter().all(|c| c.ends_with('\n')));
        assert_eq!(chunks.concat(), dump);
    }

    #[test]
    fn update_backoff_doubles_up_to_a_minute() {
        assert_eq!(update_backoff(1), Duration::from_secs(2));
        assert_eq!(update_backoff(3), Duration::from_secs(8));
        assert_eq!(update_backoff(6), MAX_UPDATE_BACKOFF);
        assert_eq!(update_backoff(u32::MAX), MAX_UPDATE_BACKOFF);
    }

    #[test]
    fn base_url_embeds_token() {
        let client =
            TelegramClient::new("https://api.example.org/", "123:abc", Duration::from_secs(30))
                .unwrap();
        assert_eq!(client.base_url, "https://api.example.org/bot123:abc");
    }
}
