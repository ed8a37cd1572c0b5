//! Server ids and the authoritative coordinator server list.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::coord::tracker::{ServerChangeEvent, ServerDetails, ServerTracker};
use crate::utils::KeystoneError;

use bytes::Bytes;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

use tokio::sync::mpsc;

/// Cluster-unique server identifier.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct ServerId(pub u64);

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Liveness status of a listed server.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Server is up and serving.
    Up,

    /// Server crashed; it stays listed until its tablets are recovered.
    Crashed,
}

/// Details the server list stores per server.
#[derive(Debug, PartialEq, Clone)]
pub struct Entry {
    /// The server's id.
    pub server_id: ServerId,

    /// Locator string for reaching the server's RPC endpoints.
    pub service_locator: String,

    /// Liveness status.
    pub status: ServerStatus,

    /// The server's will in serialized form, decoded only when a recovery
    /// is constructed from it.
    pub will: Bytes,

    /// Replicas of segments with ids below this are stale and excluded
    /// from any recovery of this server.
    pub min_open_segment_id: u64,
}

/// A membership delta to be broadcast to the cluster.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct MembershipUpdate {
    /// Membership version this delta advances the cluster to.
    pub version: u64,

    /// Servers removed from the membership.
    pub removed: Vec<ServerId>,
}

/// A membership update resolved to its broadcast targets, handed to the
/// transport layer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MembershipBroadcast {
    /// Servers the update should be pushed to.
    pub recipients: Vec<ServerId>,

    /// The delta itself.
    pub update: MembershipUpdate,
}

/// Entries and the membership version, kept under one lock.
struct ListInner {
    entries: HashMap<ServerId, Entry>,
    version: u64,
}

/// Authoritative list of all servers in the cluster and their details.
///
/// Membership mutations push change records into every registered tracker
/// and fire the trackers' notifiers, and removal deltas are handed to the
/// transport layer through the broadcast channel returned by `new`.
pub struct CoordinatorServerList {
    /// Entries and version.
    inner: Mutex<ListInner>,

    /// Trackers to push membership change records to.
    trackers: Mutex<Vec<Arc<ServerTracker>>>,

    /// Sender side of the broadcast channel.
    tx_broadcast: mpsc::UnboundedSender<MembershipBroadcast>,
}

impl CoordinatorServerList {
    /// Creates a new empty server list. Returns the list and the receiver
    /// end of the membership broadcast channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MembershipBroadcast>) {
        let (tx_broadcast, rx_broadcast) = mpsc::unbounded_channel();
        (
            CoordinatorServerList {
                inner: Mutex::new(ListInner {
                    entries: HashMap::new(),
                    version: 0,
                }),
                trackers: Mutex::new(Vec::new()),
                tx_broadcast,
            },
            rx_broadcast,
        )
    }

    /// Registers a tracker. The current membership is replayed into it
    /// (in server id order) so that a late registrant observes every
    /// server, then the tracker's notifier is fired once.
    pub fn register_tracker(&self, tracker: Arc<ServerTracker>) {
        {
            let inner = self.inner.lock();
            let mut entries: Vec<&Entry> = inner.entries.values().collect();
            entries.sort_by_key(|entry| entry.server_id);
            for entry in entries {
                tracker.enqueue_change(
                    Self::details_of(entry),
                    ServerChangeEvent::ServerAdded,
                );
                if entry.status == ServerStatus::Crashed {
                    tracker.enqueue_change(
                        Self::details_of(entry),
                        ServerChangeEvent::ServerCrashed,
                    );
                }
            }
        }
        self.trackers.lock().push(tracker.clone());
        tracker.notify_enqueued();
    }

    /// Adds a new server to the list and pushes the change to trackers.
    pub fn add(
        &self,
        server_id: ServerId,
        service_locator: &str,
        will: Bytes,
        min_open_segment_id: u64,
    ) -> Result<(), KeystoneError> {
        let details;
        {
            let mut inner = self.inner.lock();
            if inner.entries.contains_key(&server_id) {
                return logged_err!(
                    "servlist";
                    "server {} already in the list",
                    server_id
                );
            }
            let entry = Entry {
                server_id,
                service_locator: service_locator.into(),
                status: ServerStatus::Up,
                will,
                min_open_segment_id,
            };
            details = Self::details_of(&entry);
            inner.entries.insert(server_id, entry);
        }
        self.push_change(details, ServerChangeEvent::ServerAdded);
        Ok(())
    }

    /// Marks a server crashed and pushes the change to trackers. The entry
    /// stays in the list (its will is still needed) until the server is
    /// removed after recovery.
    pub fn server_crashed(
        &self,
        server_id: ServerId,
    ) -> Result<(), KeystoneError> {
        let details;
        {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(&server_id) {
                Some(entry) => {
                    entry.status = ServerStatus::Crashed;
                    details = Self::details_of(entry);
                }
                None => {
                    return logged_err!(
                        "servlist";
                        "server {} not in the list",
                        server_id
                    );
                }
            }
        }
        self.push_change(details, ServerChangeEvent::ServerCrashed);
        Ok(())
    }

    /// Replaces the will stored for a server. Masters push a fresh will
    /// whenever their tablet assignment changes.
    pub fn set_will(
        &self,
        server_id: ServerId,
        will: Bytes,
    ) -> Result<(), KeystoneError> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&server_id) {
            Some(entry) => {
                entry.will = will;
                Ok(())
            }
            None => logged_err!(
                "servlist";
                "server {} not in the list",
                server_id
            ),
        }
    }

    /// Raises the minimum open segment id recorded for a server. The
    /// barrier is monotone; a lower value is ignored.
    pub fn set_min_open_segment_id(
        &self,
        server_id: ServerId,
        segment_id: u64,
    ) -> Result<(), KeystoneError> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&server_id) {
            Some(entry) => {
                if segment_id > entry.min_open_segment_id {
                    entry.min_open_segment_id = segment_id;
                }
                Ok(())
            }
            None => logged_err!(
                "servlist";
                "server {} not in the list",
                server_id
            ),
        }
    }

    /// Returns a copy of the entry stored for the given server.
    pub fn entry(&self, server_id: ServerId) -> Result<Entry, KeystoneError> {
        self.inner
            .lock()
            .entries
            .get(&server_id)
            .cloned()
            .ok_or_else(|| {
                KeystoneError(format!("server {} not in the list", server_id))
            })
    }

    /// Removes a server, pushing the change to trackers and returning the
    /// membership delta describing the removal. The delta carries no
    /// version yet; see `increment_version`.
    pub fn remove(
        &self,
        server_id: ServerId,
    ) -> Result<MembershipUpdate, KeystoneError> {
        let entry = match self.inner.lock().entries.remove(&server_id) {
            Some(entry) => entry,
            None => {
                return logged_err!(
                    "servlist";
                    "server {} not in the list",
                    server_id
                );
            }
        };
        self.push_change(
            Self::details_of(&entry),
            ServerChangeEvent::ServerRemoved,
        );
        Ok(MembershipUpdate {
            version: 0,
            removed: vec![server_id],
        })
    }

    /// Advances the membership version and stamps it into the delta.
    pub fn increment_version(&self, update: &mut MembershipUpdate) {
        let mut inner = self.inner.lock();
        inner.version += 1;
        update.version = inner.version;
    }

    /// Current membership version.
    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    /// Resolves recipients (every live server minus `excluded`) and hands
    /// the update to the transport layer through the broadcast channel.
    pub fn send_membership_update(
        &self,
        update: MembershipUpdate,
        excluded: &[ServerId],
    ) {
        let mut recipients: Vec<ServerId> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|entry| {
                entry.status == ServerStatus::Up
                    && !excluded.contains(&entry.server_id)
            })
            .map(|entry| entry.server_id)
            .collect();
        recipients.sort_unstable();

        ks_debug!(
            "servlist";
            "sending membership update v{} to {} servers",
            update.version,
            recipients.len()
        );
        if let Err(e) = self
            .tx_broadcast
            .send(MembershipBroadcast { recipients, update })
        {
            ks_error!("servlist"; "error sending membership broadcast: {}", e);
        }
    }

    /// Number of listed servers (crashed ones included).
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if no server is listed.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Pushes one change record to every registered tracker.
    fn push_change(&self, details: ServerDetails, event: ServerChangeEvent) {
        let trackers = self.trackers.lock();
        for tracker in trackers.iter() {
            tracker.enqueue_change(details.clone(), event);
            tracker.notify_enqueued();
        }
    }

    fn details_of(entry: &Entry) -> ServerDetails {
        ServerDetails {
            server_id: entry.server_id,
            service_locator: entry.service_locator.clone(),
        }
    }
}

#[cfg(test)]
mod servlist_tests {
    use super::*;

    fn listed(
    ) -> (CoordinatorServerList, mpsc::UnboundedReceiver<MembershipBroadcast>)
    {
        let (list, rx_broadcast) = CoordinatorServerList::new();
        list.add(ServerId(1), "tcp:host1", Bytes::new(), 3).unwrap();
        list.add(ServerId(2), "tcp:host2", Bytes::new(), 5).unwrap();
        (list, rx_broadcast)
    }

    #[test]
    fn add_and_lookup() {
        let (list, _rx) = listed();
        assert_eq!(list.len(), 2);
        let entry = list.entry(ServerId(2)).unwrap();
        assert_eq!(entry.service_locator, "tcp:host2");
        assert_eq!(entry.min_open_segment_id, 5);
        assert!(list.entry(ServerId(9)).is_err());
        assert!(list.add(ServerId(1), "tcp:dup", Bytes::new(), 0).is_err());
    }

    #[test]
    fn crash_and_barrier() {
        let (list, _rx) = listed();
        list.server_crashed(ServerId(1)).unwrap();
        assert_eq!(
            list.entry(ServerId(1)).unwrap().status,
            ServerStatus::Crashed
        );

        list.set_min_open_segment_id(ServerId(2), 9).unwrap();
        assert_eq!(list.entry(ServerId(2)).unwrap().min_open_segment_id, 9);
        // barrier is monotone
        list.set_min_open_segment_id(ServerId(2), 4).unwrap();
        assert_eq!(list.entry(ServerId(2)).unwrap().min_open_segment_id, 9);
    }

    #[test]
    fn remove_and_broadcast() {
        let (list, mut rx_broadcast) = listed();
        list.add(ServerId(3), "tcp:host3", Bytes::new(), 0).unwrap();
        list.server_crashed(ServerId(1)).unwrap();

        let mut update = list.remove(ServerId(1)).unwrap();
        list.increment_version(&mut update);
        assert_eq!(update.version, 1);
        assert_eq!(update.removed, vec![ServerId(1)]);
        assert!(list.entry(ServerId(1)).is_err());

        list.send_membership_update(update.clone(), &[ServerId(3)]);
        let broadcast = rx_broadcast.try_recv().unwrap();
        assert_eq!(broadcast.update, update);
        // removed and excluded servers are not recipients
        assert_eq!(broadcast.recipients, vec![ServerId(2)]);
    }

    #[test]
    fn tracker_replay_on_register() {
        let (list, _rx) = listed();
        list.server_crashed(ServerId(2)).unwrap();

        let tracker = Arc::new(ServerTracker::new());
        list.register_tracker(tracker.clone());

        let mut events = Vec::new();
        while let Some((details, event)) = tracker.get_change() {
            events.push((details.server_id, event));
        }
        assert_eq!(
            events,
            vec![
                (ServerId(1), ServerChangeEvent::ServerAdded),
                (ServerId(2), ServerChangeEvent::ServerAdded),
                (ServerId(2), ServerChangeEvent::ServerCrashed),
            ]
        );
    }
}
