/// Messaging transport seam.
///
/// The monitor and command handlers only ever talk to a [`Transport`]; the
/// Telegram Bot API client in [`telegram`] is the production implementation.
use std::fmt;

use async_trait::async_trait;

use crate::error::TransportError;

pub mod telegram;

/// Conversation a reply or notification is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextFormat {
    Plain,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub format: TextFormat,
}

impl OutgoingMessage {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::Plain,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: TextFormat::Markdown,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<(), TransportError>;
}
