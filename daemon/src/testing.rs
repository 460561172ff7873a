/// Fixtures shared by the unit tests: record builders, a scripted
/// [`StatusSource`] and a [`Transport`] that records what it was asked to send.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::client::{ClientRecord, Snapshot};
use crate::error::{SourceError, TransportError};
use crate::source::StatusSource;
use crate::transport::{ChatId, OutgoingMessage, Transport};

pub(crate) const V1_SAMPLE: &str = "\
OpenVPN CLIENT LIST
Updated,Thu Jun 18 08:12:15 2015
Common Name,Real Address,Bytes Received,Bytes Sent,Connected Since
alice,10.0.0.5:49502,334948,1973012,Thu Jun 18 04:23:03 2015
bob,10.0.0.6:63414,75782,1007508,Thu Jun  4 07:25:29 2015
ROUTING TABLE
Virtual Address,Common Name,Real Address,Last Ref
192.168.255.118,bob,10.0.0.6:63414,Thu Jun 18 08:12:09 2015
192.168.255.134,alice,10.0.0.5:49502,Thu Jun 18 08:11:55 2015
GLOBAL STATS
Max bcast/mcast queue length,0
END
";

pub(crate) fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

pub(crate) fn record(identity: &str, display_name: &str) -> ClientRecord {
    ClientRecord {
        identity: identity.to_string(),
        display_name: display_name.to_string(),
        real_address: identity.to_string(),
        virtual_address: None,
        connected_since: ts("2015-06-18 04:23:03"),
        bytes_received: 0,
        bytes_sent: 0,
    }
}

pub(crate) fn snapshot(records: impl IntoIterator<Item = ClientRecord>) -> Snapshot {
    Snapshot::new(records, Utc::now(), None)
}

/// A snapshot whose records use each id as both identity and display name.
pub(crate) fn snapshot_of(ids: &[&str]) -> Snapshot {
    snapshot(ids.iter().map(|id| record(id, id)))
}

pub(crate) fn unavailable() -> SourceError {
    SourceError::Unavailable {
        location: "scripted".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "status file vanished"),
    }
}

// ── ScriptedSource ────────────────────────────────────────────────────────────

/// Returns queued results in order; once the queue is empty it keeps returning
/// the most recent successful snapshot.
pub(crate) struct ScriptedSource {
    steps: Mutex<VecDeque<Result<Snapshot, SourceError>>>,
    last_ok: Mutex<Snapshot>,
    sampled_at: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub(crate) fn new(initial: Snapshot) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(VecDeque::new()),
            last_ok: Mutex::new(initial),
            sampled_at: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn push_ok(&self, snapshot: Snapshot) {
        self.steps.lock().push_back(Ok(snapshot));
    }

    pub(crate) fn push_err(&self, err: SourceError) {
        self.steps.lock().push_back(Err(err));
    }

    /// Clock readings of every `sample()` call so far.
    pub(crate) fn sampled_at(&self) -> Vec<Instant> {
        self.sampled_at.lock().clone()
    }
}

#[async_trait]
impl StatusSource for ScriptedSource {
    async fn sample(&self) -> Result<Snapshot, SourceError> {
        self.sampled_at.lock().push(Instant::now());
        match self.steps.lock().pop_front() {
            Some(Ok(snapshot)) => {
                *self.last_ok.lock() = snapshot.clone();
                Ok(snapshot)
            }
            Some(Err(err)) => Err(err),
            None => Ok(self.last_ok.lock().clone()),
        }
    }

    fn location(&self) -> &str {
        "scripted"
    }
}

// ── RecordingTransport ────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(ChatId, OutgoingMessage)>>,
    failures_left: AtomicUsize,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `n` sends fail with a connection error.
    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn messages(&self) -> Vec<(ChatId, OutgoingMessage)> {
        self.sent.lock().clone()
    }

    pub(crate) fn texts_for(&self, chat: ChatId) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|(c, _)| *c == chat)
            .map(|(_, m)| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, chat: ChatId, message: &OutgoingMessage) -> Result<(), TransportError> {
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::Connection("scripted failure".to_string()));
        }
        self.sent.lock().push((chat, message.clone()));
        Ok(())
    }
}
