/// Status sources: where the monitor gets each [`Snapshot`] from.
///
/// A source keeps no memory between calls; every `sample()` is an independent
/// read of external state and may run concurrently with another.
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::client::{ClientRecord, IdentityKey, Snapshot};
use crate::error::SourceError;
use crate::status_parser::{self, ClientEntry};

#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Takes one sample of the connected clients.
    async fn sample(&self) -> Result<Snapshot, SourceError>;

    /// Where samples come from, for log lines and error messages.
    fn location(&self) -> &str;
}

/// Reads the status file OpenVPN rewrites every `--status` interval.
#[derive(Debug, Clone)]
pub struct FileStatusSource {
    path: PathBuf,
    location: String,
    identity_key: IdentityKey,
    read_timeout: Duration,
}

impl FileStatusSource {
    pub fn new(path: impl AsRef<Path>, identity_key: IdentityKey, read_timeout: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let location = path.display().to_string();
        Self {
            path,
            location,
            identity_key,
            read_timeout,
        }
    }
}

#[async_trait]
impl StatusSource for FileStatusSource {
    async fn sample(&self) -> Result<Snapshot, SourceError> {
        let text = match tokio::time::timeout(self.read_timeout, tokio::fs::read_to_string(&self.path)).await {
            Ok(Ok(text)) => text,
            Ok(Err(source)) => {
                return Err(SourceError::Unavailable {
                    location: self.location.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(SourceError::TimedOut {
                    location: self.location.clone(),
                    after: self.read_timeout,
                })
            }
        };

        let parsed = status_parser::parse(&text).map_err(|source| SourceError::Malformed {
            location: self.location.clone(),
            source,
        })?;

        let records = parsed
            .clients
            .into_iter()
            .map(|entry| into_record(entry, self.identity_key));
        Ok(Snapshot::new(records, Utc::now(), parsed.updated_at))
    }

    fn location(&self) -> &str {
        &self.location
    }
}

fn into_record(entry: ClientEntry, key: IdentityKey) -> ClientRecord {
    let identity = match key {
        IdentityKey::Address => entry.real_address.clone(),
        IdentityKey::CommonName => entry.common_name.clone(),
    };
    ClientRecord {
        identity,
        display_name: entry.common_name,
        real_address: entry.real_address,
        virtual_address: entry.virtual_address,
        connected_since: entry.connected_since,
        bytes_received: entry.bytes_received,
        bytes_sent: entry.bytes_sent,
    }
}
