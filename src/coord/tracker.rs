//! Membership change tracker owned by the recovery manager.

use std::collections::{HashMap, VecDeque};

use crate::coord::recovery::RecoveryId;
use crate::coord::servlist::ServerId;

use parking_lot::Mutex;

/// Kind of membership change delivered to a tracker.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ServerChangeEvent {
    /// Server joined the cluster.
    ServerAdded,

    /// Server crashed and awaits recovery.
    ServerCrashed,

    /// Server was removed from the membership.
    ServerRemoved,
}

/// Details carried along with a change record.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServerDetails {
    /// The server's id.
    pub server_id: ServerId,

    /// Locator string for reaching the server.
    pub service_locator: String,
}

/// A server as seen through the changes drained so far.
struct TrackedServer {
    details: ServerDetails,
    crashed: bool,
    /// Recovery currently using this server as a recovery master, if any.
    recovery: Option<RecoveryId>,
}

/// The drained membership view plus the one removal whose application is
/// deferred to the next drain.
struct TrackerView {
    servers: HashMap<ServerId, TrackedServer>,
    pending_removal: Option<ServerId>,
}

/// Buffers membership change records pushed by the server list and mirrors
/// the membership as its owner drains them. Also owns the per-server
/// recovery slot used to find the recovery a lost recovery master belonged
/// to.
#[derive(Default)]
pub struct ServerTracker {
    /// Change records pushed but not yet drained.
    changes: Mutex<VecDeque<(ServerDetails, ServerChangeEvent)>>,

    /// Membership view as of the changes drained so far.
    view: Mutex<TrackerView>,

    /// Invoked by the server list after it pushes changes.
    notifier: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for TrackerView {
    fn default() -> Self {
        TrackerView {
            servers: HashMap::new(),
            pending_removal: None,
        }
    }
}

impl ServerTracker {
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the closure fired whenever changes have been pushed.
    pub fn set_notifier(&self, notifier: impl Fn() + Send + Sync + 'static) {
        *self.notifier.lock() = Some(Box::new(notifier));
    }

    /// Appends a change record. Called by the server list.
    pub fn enqueue_change(
        &self,
        details: ServerDetails,
        event: ServerChangeEvent,
    ) {
        self.changes.lock().push_back((details, event));
    }

    /// Fires the registered notifier, if any. Called by the server list
    /// after pushing changes.
    pub fn notify_enqueued(&self) {
        if let Some(notifier) = self.notifier.lock().as_ref() {
            notifier();
        }
    }

    /// Drains the next change record, applying it to the membership view.
    /// A `ServerRemoved` record keeps the removed server's slot readable
    /// until the following call, so the caller can clean up what the slot
    /// points at.
    pub fn get_change(&self) -> Option<(ServerDetails, ServerChangeEvent)> {
        let mut view = self.view.lock();
        if let Some(server_id) = view.pending_removal.take() {
            view.servers.remove(&server_id);
        }

        let (details, event) = self.changes.lock().pop_front()?;
        match event {
            ServerChangeEvent::ServerAdded => {
                view.servers.insert(
                    details.server_id,
                    TrackedServer {
                        details: details.clone(),
                        crashed: false,
                        recovery: None,
                    },
                );
            }
            ServerChangeEvent::ServerCrashed => {
                if let Some(server) = view.servers.get_mut(&details.server_id)
                {
                    server.crashed = true;
                }
            }
            ServerChangeEvent::ServerRemoved => {
                view.pending_removal = Some(details.server_id);
            }
        }
        Some((details, event))
    }

    /// Recovery currently associated with the server's slot.
    pub fn recovery_for(&self, server_id: ServerId) -> Option<RecoveryId> {
        self.view
            .lock()
            .servers
            .get(&server_id)
            .and_then(|server| server.recovery)
    }

    /// Associates (or clears) the server's slot.
    pub fn set_recovery(
        &self,
        server_id: ServerId,
        recovery: Option<RecoveryId>,
    ) {
        if let Some(server) = self.view.lock().servers.get_mut(&server_id) {
            server.recovery = recovery;
        }
    }

    /// Clears every slot still pointing at the given recovery.
    pub fn clear_recovery(&self, recovery_id: RecoveryId) {
        for server in self.view.lock().servers.values_mut() {
            if server.recovery == Some(recovery_id) {
                server.recovery = None;
            }
        }
    }

    /// Servers currently believed alive (added, not crashed, not pending
    /// removal), in id order.
    pub fn live_servers(&self) -> Vec<ServerId> {
        let view = self.view.lock();
        let mut servers: Vec<ServerId> = view
            .servers
            .values()
            .filter(|server| {
                !server.crashed
                    && view.pending_removal != Some(server.details.server_id)
            })
            .map(|server| server.details.server_id)
            .collect();
        servers.sort_unstable();
        servers
    }

    /// Number of change records not yet drained.
    pub fn num_pending_changes(&self) -> usize {
        self.changes.lock().len()
    }
}

#[cfg(test)]
mod tracker_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn details(id: u64) -> ServerDetails {
        ServerDetails {
            server_id: ServerId(id),
            service_locator: format!("tcp:host{}", id),
        }
    }

    #[test]
    fn drain_applies_view() {
        let tracker = ServerTracker::new();
        tracker.enqueue_change(details(1), ServerChangeEvent::ServerAdded);
        tracker.enqueue_change(details(2), ServerChangeEvent::ServerAdded);
        tracker.enqueue_change(details(1), ServerChangeEvent::ServerCrashed);
        assert_eq!(tracker.num_pending_changes(), 3);

        while tracker.get_change().is_some() {}
        assert_eq!(tracker.num_pending_changes(), 0);
        assert_eq!(tracker.live_servers(), vec![ServerId(2)]);
    }

    #[test]
    fn removal_defers_slot_cleanup() {
        let tracker = ServerTracker::new();
        tracker.enqueue_change(details(1), ServerChangeEvent::ServerAdded);
        tracker.get_change().unwrap();
        tracker.set_recovery(ServerId(1), Some(42));

        tracker.enqueue_change(details(1), ServerChangeEvent::ServerRemoved);
        let (_, event) = tracker.get_change().unwrap();
        assert_eq!(event, ServerChangeEvent::ServerRemoved);
        // slot stays readable until the next drain
        assert_eq!(tracker.recovery_for(ServerId(1)), Some(42));
        assert!(tracker.live_servers().is_empty());

        assert!(tracker.get_change().is_none());
        assert_eq!(tracker.recovery_for(ServerId(1)), None);
    }

    #[test]
    fn slots_and_clearing() {
        let tracker = ServerTracker::new();
        tracker.enqueue_change(details(1), ServerChangeEvent::ServerAdded);
        tracker.enqueue_change(details(2), ServerChangeEvent::ServerAdded);
        while tracker.get_change().is_some() {}

        tracker.set_recovery(ServerId(1), Some(7));
        tracker.set_recovery(ServerId(2), Some(7));
        assert_eq!(tracker.recovery_for(ServerId(1)), Some(7));

        tracker.set_recovery(ServerId(1), None);
        assert_eq!(tracker.recovery_for(ServerId(1)), None);

        tracker.clear_recovery(7);
        assert_eq!(tracker.recovery_for(ServerId(2)), None);
    }

    #[test]
    fn notifier_fires() {
        let tracker = ServerTracker::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_ref = fired.clone();
        tracker.set_notifier(move || {
            fired_ref.fetch_add(1, Ordering::SeqCst);
        });
        tracker.notify_enqueued();
        tracker.notify_enqueued();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
