/// Allow-list access control for privileged commands.
///
/// [`AccessGuard::intercept`] runs in front of every privileged handler. On a
/// denial it sends the refusal itself and the handler is never called.
use std::collections::HashSet;
use std::fmt;

use tracing::{info, warn};

use crate::transport::{ChatId, OutgoingMessage, Transport};

pub const ACCESS_DENIED_TEXT: &str =
    "🚫 *ACCESS DENIED*\nSorry, you are *not authorized* to use this command";

/// Identity of whoever issued a command (a Telegram username, or the numeric
/// user id for accounts without one).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Allowed,
    Denied,
}

/// Static allow-list, loaded once at startup. Matching is exact and case-sensitive.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    allowed: HashSet<String>,
}

impl AccessGuard {
    pub fn new<I, S>(allow_list: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allow_list.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks `principal` against the allow-list. Logging is the only side effect.
    pub fn authorize(&self, principal: &Principal, command: &str) -> Authorization {
        info!(%principal, command, "Privileged command requested");
        if self.allowed.contains(principal.as_str()) {
            Authorization::Allowed
        } else {
            warn!(%principal, command, "Unauthorized access denied");
            Authorization::Denied
        }
    }

    /// Authorizes `principal`; on denial replies with the refusal message.
    pub async fn intercept(
        &self,
        principal: &Principal,
        command: &str,
        transport: &dyn Transport,
        chat: ChatId,
    ) -> Authorization {
        let decision = self.authorize(principal, command);
        if decision == Authorization::Denied {
            if let Err(e) = transport
                .send(chat, &OutgoingMessage::markdown(ACCESS_DENIED_TEXT))
                .await
            {
                warn!(%principal, %chat, "Failed to deliver access refusal: {e}");
            }
        }
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;
    use crate::transport::TextFormat;

    fn guard() -> AccessGuard {
        AccessGuard::new(["alice", "bob"])
    }

    #[test]
    fn listed_principal_is_allowed() {
        assert_eq!(guard().authorize(&Principal::new("alice"), "stats"), Authorization::Allowed);
    }

    #[test]
    fn unlisted_principal_is_denied() {
        assert_eq!(guard().authorize(&Principal::new("mallory"), "stats"), Authorization::Denied);
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert_eq!(guard().authorize(&Principal::new("Alice"), "stats"), Authorization::Denied);
        assert_eq!(guard().authorize(&Principal::new("alice "), "stats"), Authorization::Denied);
    }

    #[test]
    fn empty_allow_list_denies_everyone() {
        let g = AccessGuard::new(Vec::<String>::new());
        assert_eq!(g.authorize(&Principal::new(""), "start"), Authorization::Denied);
    }

    #[test]
    fn repeated_attempts_are_judged_independently() {
        let g = guard();
        for _ in 0..5 {
            assert_eq!(g.authorize(&Principal::new("mallory"), "start"), Authorization::Denied);
        }
        assert_eq!(g.authorize(&Principal::new("bob"), "start"), Authorization::Allowed);
    }

    #[tokio::test]
    async fn intercept_sends_refusal_on_denial() {
        let transport = RecordingTransport::new();
        let decision = guard()
            .intercept(&Principal::new("mallory"), "stats", transport.as_ref(), ChatId(7))
            .await;

        assert_eq!(decision, Authorization::Denied);
        let sent = transport.messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, ChatId(7));
        assert_eq!(sent[0].1.text, ACCESS_DENIED_TEXT);
        assert_eq!(sent[0].1.format, TextFormat::Markdown);
    }

    #[tokio::test]
    async fn intercept_is_silent_when_allowed() {
        let transport = RecordingTransport::new();
        let decision = guard()
            .intercept(&Principal::new("bob"), "stats", transport.as_ref(), ChatId(7))
            .await;

        assert_eq!(decision, Authorization::Allowed);
        assert!(transport.messages().is_empty());
    }
}
