/// Data model for one sample of the VPN server's connected clients.
///
/// A [`Snapshot`] is produced whole by a [`StatusSource`](crate::source::StatusSource)
/// and never mutated afterwards; the monitor replaces it by swapping an `Arc`.
use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

/// Which status-file column distinguishes one session from another across samples.
///
/// `Address` treats a reconnect from a new `ip:port` as disconnect + connect.
/// `CommonName` collapses such reconnects but merges concurrent sessions that
/// share a certificate name.
#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKey {
    #[default]
    Address,
    CommonName,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityKey::Address => f.write_str("address"),
            IdentityKey::CommonName => f.write_str("common_name"),
        }
    }
}

/// One connected VPN session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    /// Key used for diffing (address or common name, per [`IdentityKey`]).
    pub identity: String,
    /// Certificate common name.
    pub display_name: String,
    /// Remote `ip:port` the session connects from.
    pub real_address: String,
    /// Tunnel address, when the routing table lists one.
    pub virtual_address: Option<String>,
    /// Connection start in the server's local time, as written in the status file.
    pub connected_since: NaiveDateTime,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl ClientRecord {
    /// Short human label: the identity, plus the display name when it differs.
    pub fn label(&self) -> String {
        if self.display_name == self.identity {
            self.identity.clone()
        } else {
            format!("{} ({})", self.identity, self.display_name)
        }
    }
}

/// An immutable mapping from identity key to [`ClientRecord`].
///
/// Records keep the order they had in the status file so that stats dumps are
/// stable between polls. When two records share an identity key the first wins.
#[derive(Debug, Clone)]
pub struct Snapshot {
    records: Vec<ClientRecord>,
    index: HashMap<String, usize>,
    captured_at: DateTime<Utc>,
    updated_at: Option<NaiveDateTime>,
}

impl Snapshot {
    pub fn new(
        records: impl IntoIterator<Item = ClientRecord>,
        captured_at: DateTime<Utc>,
        updated_at: Option<NaiveDateTime>,
    ) -> Self {
        let mut kept = Vec::new();
        let mut index = HashMap::new();
        for record in records {
            if index.contains_key(&record.identity) {
                tracing::debug!(identity = %record.identity, "Dropping duplicate client record");
                continue;
            }
            index.insert(record.identity.clone(), kept.len());
            kept.push(record);
        }
        Self {
            records: kept,
            index,
            captured_at,
            updated_at,
        }
    }

    #[cfg(test)]
    /// A snapshot with no connected clients.
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self::new(Vec::new(), captured_at, None)
    }

    #[cfg(test)]
    pub fn get(&self, identity: &str) -> Option<&ClientRecord> {
        self.index.get(identity).map(|&i| &self.records[i])
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.index.contains_key(identity)
    }

    /// Records in status-file order.
    pub fn iter(&self) -> impl Iterator<Item = &ClientRecord> {
        self.records.iter()
    }

    #[cfg(test)]
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.identity.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// When this sample was taken.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// The `Updated` time the server wrote into the status file, if any.
    pub fn updated_at(&self) -> Option<NaiveDateTime> {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, ts};

    #[test]
    fn duplicate_identities_keep_first_record() {
        let first = record("10.0.0.5:1194", "alice");
        let second = record("10.0.0.5:1194", "mallory");
        let snap = Snapshot::new([first.clone(), second], Utc::now(), None);
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get("10.0.0.5:1194"), Some(&first));
    }

    #[test]
    fn iteration_preserves_input_order() {
        let snap = Snapshot::new(
            [record("z", "zed"), record("a", "amy"), record("m", "mo")],
            Utc::now(),
            None,
        );
        let ids: Vec<_> = snap.identities().collect();
        assert_eq!(ids, ["z", "a", "m"]);
    }

    #[test]
    fn empty_snapshot_has_no_clients() {
        let snap = Snapshot::empty(Utc::now());
        assert!(snap.is_empty());
        assert!(!snap.contains("anything"));
        assert!(snap.updated_at().is_none());
    }

    #[test]
    fn label_omits_name_when_it_equals_identity() {
        let mut r = record("alice", "alice");
        assert_eq!(r.label(), "alice");
        r.identity = "10.0.0.5:1194".to_string();
        assert_eq!(r.label(), "10.0.0.5:1194 (alice)");
    }

    #[test]
    fn updated_at_is_kept() {
        let snap = Snapshot::new(Vec::new(), Utc::now(), Some(ts("2015-06-18 08:12:15")));
        assert_eq!(snap.updated_at(), Some(ts("2015-06-18 08:12:15")));
    }

    #[test]
    fn identity_key_parses_from_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            key: IdentityKey,
        }
        let w: Wrapper = toml::from_str("key = \"common_name\"").unwrap();
        assert_eq!(w.key, IdentityKey::CommonName);
        let w: Wrapper = toml::from_str("key = \"address\"").unwrap();
        assert_eq!(w.key, IdentityKey::Address);
    }
}
