use chrono::{DateTime, Utc};

use crate::client::ClientRecord;
use crate::commands::IncomingCommand;

/// A transition detected between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// The client appears in the new snapshot but not the previous one.
    Connected(ClientRecord),
    /// The client has gone. `last_seen` is the capture time of the last
    /// snapshot that still listed it.
    Disconnected {
        client: ClientRecord,
        last_seen: DateTime<Utc>,
    },
}

impl ChangeEvent {
    pub fn client(&self) -> &ClientRecord {
        match self {
            ChangeEvent::Connected(client) => client,
            ChangeEvent::Disconnected { client, .. } => client,
        }
    }
}

/// Inputs to the daemon's main event loop.
pub enum DaemonEvent {
    /// A command arrived over the messaging transport.
    Command(IncomingCommand),
    /// Ctrl+C or SIGTERM received; the daemon should stop the monitor and exit.
    Shutdown,
}
