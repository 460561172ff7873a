/// Snapshot differ: identity-key set subtraction between two samples.
///
/// Pure and I/O free. Both result lists are ordered by identity key so the
/// event stream is reproducible for a given pair of snapshots.
use crate::client::{ClientRecord, Snapshot};
use crate::event::ChangeEvent;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotDiff {
    /// In `current` but not in `previous`.
    pub connected: Vec<ClientRecord>,
    /// In `previous` but not in `current`.
    pub disconnected: Vec<ClientRecord>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }

    /// Flattens into events, connected before disconnected.
    pub fn into_events(self, previous: &Snapshot) -> Vec<ChangeEvent> {
        let last_seen = previous.captured_at();
        self.connected
            .into_iter()
            .map(ChangeEvent::Connected)
            .chain(
                self.disconnected
                    .into_iter()
                    .map(|client| ChangeEvent::Disconnected { client, last_seen }),
            )
            .collect()
    }
}

/// Computes which sessions appeared and which went away between two snapshots.
pub fn diff(previous: &Snapshot, current: &Snapshot) -> SnapshotDiff {
    let mut connected: Vec<ClientRecord> = current
        .iter()
        .filter(|r| !previous.contains(&r.identity))
        .cloned()
        .collect();
    let mut disconnected: Vec<ClientRecord> = previous
        .iter()
        .filter(|r| !current.contains(&r.identity))
        .cloned()
        .collect();

    connected.sort_by(|a, b| a.identity.cmp(&b.identity));
    disconnected.sort_by(|a, b| a.identity.cmp(&b.identity));

    SnapshotDiff {
        connected,
        disconnected,
    }
}


#[cfg(test)]
mod proptests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::testing::{record, snapshot};
    use proptest::prelude::*;

    fn keys() -> impl Strategy<Value = BTreeSet<String>> {
        prop::collection::btree_set("[a-f]{1,2}", 0..12)
    }

    fn snap(keys: &BTreeSet<String>) -> Snapshot {
        snapshot(keys.iter().map(|k| record(k, k)))
    }

    fn identities(records: &[ClientRecord]) -> BTreeSet<String> {
        records.iter().map(|r| r.identity.clone()).collect()
    }

    proptest! {
        /// Diffing a snapshot against itself reports nothing.
        #[test]
        fn prop_self_diff_is_empty(a in keys()) {
            let s = snap(&a);
            prop_assert!(diff(&s, &s).is_empty());
        }

        /// Swapping the arguments swaps connected and disconnected.
        #[test]
        fn prop_diff_is_mirrored(a in keys(), b in keys()) {
            let (sa, sb) = (snap(&a), snap(&b));
            let forward = diff(&sa, &sb);
            let backward = diff(&sb, &sa);
            prop_assert_eq!(forward.connected, backward.disconnected);
            prop_assert_eq!(forward.disconnected, backward.connected);
        }

        /// Applying the diff to the previous key set yields the current key set.
        #[test]
        fn prop_diff_reconstructs_current(a in keys(), b in keys()) {
            let d = diff(&snap(&a), &snap(&b));
            let mut rebuilt = a.clone();
            rebuilt.extend(identities(&d.connected));
            for gone in identities(&d.disconnected) {
                rebuilt.remove(&gone);
            }
            prop_assert_eq!(rebuilt, b);
        }
    }
}
