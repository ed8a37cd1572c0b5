//! Master recovery manager: the coordinator-side control plane that
//! notices crashed masters, re-assigns their tablets to surviving masters,
//! and retires them from the membership once recovery completes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::coord::recovery::{
    RecoverRequest, Recovery, RecoveryId, RecoveryPhase,
};
use crate::coord::servlist::{CoordinatorServerList, ServerId};
use crate::coord::tablets::{Tablet, TabletMap, TabletStatus, Will};
use crate::coord::taskqueue::{Task, TaskQueue, TaskSubmitter};
use crate::coord::tracker::{ServerChangeEvent, ServerTracker};
use crate::utils::KeystoneError;

use rmp_serde::decode::from_slice as decode_from_slice;

use tokio::sync::mpsc;

/// Configuration parameters of the recovery manager.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ManagerConfig {
    /// Maximum number of recoveries allowed in progress at once. At most
    /// one of them concerns any given crashed server, regardless of this
    /// bound.
    pub max_active_recoveries: usize,

    /// Test-only switch: when true, crash notifications mark tablets and
    /// log, but no recovery is scheduled.
    pub do_not_start_recoveries: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            max_active_recoveries: 1,
            do_not_start_recoveries: false,
        }
    }
}

/// A one-shot work item of the recovery manager. All manager state is
/// mutated only through these, serialized on the queue's worker.
pub(crate) enum ManagerTask {
    /// Push a freshly constructed recovery onto the waiting queue, then
    /// try admission.
    Enqueue { recovery: Recovery },

    /// Promote waiting recoveries into the active set while the admission
    /// policy allows.
    MaybeStart,

    /// A recovery master reported the outcome of its partitions.
    MasterFinished {
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<Tablet>,
        successful: bool,
    },

    /// Drain tracker change records, failing recovery masters that are
    /// gone.
    ApplyTrackerChanges,

    /// Advance a recovery's own state machine by one step.
    DriveRecovery { recovery_id: RecoveryId },
}

impl Task for ManagerTask {
    type Ctx = RecoveryCore;

    fn perform(self, core: &mut RecoveryCore) {
        match self {
            ManagerTask::Enqueue { recovery } => {
                core.enqueue_recovery(recovery)
            }
            ManagerTask::MaybeStart => core.maybe_start_recoveries(),
            ManagerTask::MasterFinished {
                recovery_id,
                recovery_master_id,
                recovered_tablets,
                successful,
            } => core.master_finished(
                recovery_id,
                recovery_master_id,
                recovered_tablets,
                successful,
            ),
            ManagerTask::ApplyTrackerChanges => core.apply_tracker_changes(),
            ManagerTask::DriveRecovery { recovery_id } => {
                core.drive_recovery(recovery_id)
            }
        }
    }
}

/// Worker-side state of the recovery manager, touched only from task
/// execution on the queue's worker.
pub(crate) struct RecoveryCore {
    /// Authoritative server list.
    server_list: Arc<CoordinatorServerList>,

    /// Authoritative tablet map.
    tablet_map: Arc<TabletMap>,

    /// Membership change tracker, shared with the manager front.
    tracker: Arc<ServerTracker>,

    /// Submission handle for follow-up tasks.
    queue: TaskSubmitter<ManagerTask>,

    /// Sender side of the recover-request channel, inherited by
    /// follow-up recoveries.
    tx_recover: mpsc::UnboundedSender<RecoverRequest>,

    /// Recoveries waiting for admission, in arrival order.
    waiting: VecDeque<Recovery>,

    /// Admitted recoveries keyed by recovery id. Never holds two entries
    /// for the same crashed server.
    active: HashMap<RecoveryId, Recovery>,

    /// Admission bound on `active`.
    max_active_recoveries: usize,
}

impl RecoveryCore {
    /// Submits a follow-up task, logging on failure; the queue outlives
    /// the core, so failures mean the manager is being torn down.
    fn submit(&self, task: ManagerTask) {
        if let Err(e) = self.queue.submit(task) {
            ks_error!("recovman"; "error submitting follow-up task: {}", e);
        }
    }

    /// Puts a new recovery at the tail of the waiting queue and tries
    /// admission.
    fn enqueue_recovery(&mut self, recovery: Recovery) {
        self.waiting.push_back(recovery);
        self.submit(ManagerTask::MaybeStart);
    }

    /// Promotes waiting recoveries into the active set while capacity
    /// remains. A recovery whose crashed server already has an active
    /// recovery is rotated to the back of the waiting queue instead; this
    /// happens when a failed recovery schedules a follow-up before the
    /// original has finished its cleanup.
    fn maybe_start_recoveries(&mut self) {
        let mut delayed = Vec::new();
        while self.active.len() < self.max_active_recoveries {
            let recovery = match self.waiting.pop_front() {
                Some(recovery) => recovery,
                None => break,
            };
            let server_already_recovering = self.active.values().any(|other| {
                other.crashed_server_id == recovery.crashed_server_id
            });
            if server_already_recovering {
                ks_info!(
                    "recovman";
                    "delaying start of recovery of server {}; another \
                     recovery is active for the same server",
                    recovery.crashed_server_id
                );
                delayed.push(recovery);
            } else {
                recovery.schedule();
                ks_info!(
                    "recovman";
                    "starting recovery {} of server {} (now {} active \
                     recoveries)",
                    recovery.recovery_id(),
                    recovery.crashed_server_id,
                    self.active.len() + 1
                );
                self.active.insert(recovery.recovery_id(), recovery);
            }
        }
        // rotated recoveries go to the back in their mutual order, to be
        // retried once a same-server recovery completes
        for recovery in delayed {
            self.waiting.push_back(recovery);
        }
        if !self.waiting.is_empty() {
            ks_info!(
                "recovman";
                "{} recoveries blocked waiting for other recoveries",
                self.waiting.len()
            );
        }
    }

    /// Applies a recovery master's completion report: on success the
    /// tablet map is pointed at the new owners first, so that the
    /// recovery's downstream completion observes the new ownership; the
    /// report is then forwarded to the owning recovery either way.
    fn master_finished(
        &mut self,
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<Tablet>,
        successful: bool,
    ) {
        if !self.active.contains_key(&recovery_id) {
            ks_error!(
                "recovman";
                "recovery master {} reported completing recovery {} but \
                 there is no ongoing recovery with that id",
                recovery_master_id,
                recovery_id
            );
            return;
        }

        if successful {
            for tablet in &recovered_tablets {
                // the master filled in its own id and its log head as the
                // tablet's new owner and ctime; copy them over
                if let Err(e) = self.tablet_map.modify_tablet(
                    tablet.table_id,
                    tablet.start_key_hash,
                    tablet.end_key_hash,
                    tablet.server_id,
                    TabletStatus::Normal,
                    tablet.ctime,
                ) {
                    ks_error!(
                        "recovman";
                        "tablet reported recovered by master {} is gone \
                         from the tablet map: {}",
                        recovery_master_id,
                        e
                    );
                    panic!(
                        "tablet map lost an entry previously marked \
                         recovering; coordinator state is inconsistent"
                    );
                }
            }
        } else {
            ks_warn!(
                "recovman";
                "a recovery master failed to recover its partitions"
            );
        }

        if let Some(recovery) = self.active.get_mut(&recovery_id) {
            recovery.recovery_master_finished(recovery_master_id, successful);
        }
    }

    /// Drains tracker change records. A crashed or removed server that was
    /// acting as a recovery master is reported to its recovery as an
    /// unsuccessful completion. Draining stops at the first such change
    /// with an empty slot; remaining records wait for the next
    /// notification.
    fn apply_tracker_changes(&mut self) {
        while let Some((server, event)) = self.tracker.get_change() {
            if event == ServerChangeEvent::ServerCrashed
                || event == ServerChangeEvent::ServerRemoved
            {
                let recovery_id =
                    match self.tracker.recovery_for(server.server_id) {
                        Some(recovery_id) => recovery_id,
                        None => break,
                    };
                match self.active.get_mut(&recovery_id) {
                    Some(recovery) => {
                        // like it or not, recovery is done on this master,
                        // just unsuccessfully
                        recovery.recovery_master_finished(
                            server.server_id,
                            false,
                        );
                    }
                    None => {
                        ks_warn!(
                            "recovman";
                            "tracker slot of server {} pointed at unknown \
                             recovery {}",
                            server.server_id,
                            recovery_id
                        );
                        self.tracker.set_recovery(server.server_id, None);
                    }
                }
            }
        }
    }

    /// Advances a recovery's state machine by one step.
    fn drive_recovery(&mut self, recovery_id: RecoveryId) {
        let phase = match self.active.get(&recovery_id) {
            Some(recovery) => recovery.phase(),
            None => {
                ks_debug!(
                    "recovman";
                    "drive step for recovery {} which is no longer active",
                    recovery_id
                );
                return;
            }
        };
        match phase {
            RecoveryPhase::StartRecoveryMasters => {
                if let Some(recovery) = self.active.get_mut(&recovery_id) {
                    recovery.start_recovery_masters();
                }
            }
            RecoveryPhase::WaitRecoveryMasters => {} // spurious wakeup
            RecoveryPhase::BroadcastRecoveryComplete => {
                self.recovery_finished(recovery_id);
                if let Some(recovery) = self.active.get_mut(&recovery_id) {
                    recovery.finalized();
                }
            }
            RecoveryPhase::Done => {
                self.destroy_and_free_recovery(recovery_id);
            }
        }
    }

    /// Finalizes a recovery that has done as much as it can: a completely
    /// successful recovery retires the crashed server from the membership
    /// and broadcasts the change; anything less re-enqueues a follow-up
    /// recovery inheriting the same will and barrier. The recovery itself
    /// stays active until its cleanup step frees it.
    fn recovery_finished(&mut self, recovery_id: RecoveryId) {
        let recovery = match self.active.get(&recovery_id) {
            Some(recovery) => recovery,
            None => return,
        };
        ks_info!(
            "recovman";
            "recovery completed for master {} ({}/{} partitions recovered)",
            recovery.crashed_server_id,
            recovery.successful_partitions(),
            recovery.will.num_partitions()
        );

        if recovery.was_completely_successful() {
            let crashed_server_id = recovery.crashed_server_id;
            match self.server_list.remove(crashed_server_id) {
                Ok(mut update) => {
                    self.server_list.increment_version(&mut update);
                    self.server_list.send_membership_update(update, &[]);
                }
                Err(e) => {
                    ks_error!(
                        "recovman";
                        "error retiring recovered server {}: {}",
                        crashed_server_id,
                        e
                    );
                }
            }
            // rotated same-server recoveries may be admissible now
            self.submit(ManagerTask::MaybeStart);
        } else {
            ks_info!(
                "recovman";
                "recovery of server {} failed to recover some tablets, \
                 rescheduling another recovery",
                recovery.crashed_server_id
            );
            let follow_up = Recovery::new(
                self.queue.clone(),
                self.tracker.clone(),
                self.tx_recover.clone(),
                recovery.crashed_server_id,
                recovery.will.clone(),
                recovery.min_open_segment_id,
            );
            // enqueueing schedules a MaybeStart of its own
            self.submit(ManagerTask::Enqueue {
                recovery: follow_up,
            });
        }
    }

    /// Frees a finished recovery. Removal from the active set happens only
    /// here, after the cleanup step, so a same-server follow-up cannot be
    /// admitted until the prior recovery has fully wound down.
    fn destroy_and_free_recovery(&mut self, recovery_id: RecoveryId) {
        if let Some(recovery) = self.active.remove(&recovery_id) {
            self.tracker.clear_recovery(recovery_id);
            ks_info!(
                "recovman";
                "recovery of server {} done (now {} active recoveries)",
                recovery.crashed_server_id,
                self.active.len()
            );
            // a same-server recovery rotated on the waiting queue becomes
            // admissible only at this point
            if !self.waiting.is_empty() {
                self.submit(ManagerTask::MaybeStart);
            }
        }
    }
}

/// Coordinator-side manager driving recovery of crashed masters.
///
/// All internal state mutates on the single worker of a serialized task
/// queue; public operations either run against the shared collaborators
/// (server list, tablet map) or enqueue work. `start`/`halt` must be
/// serialized by the caller, which `&mut self` enforces.
pub struct MasterRecoveryManager {
    /// Authoritative server list.
    server_list: Arc<CoordinatorServerList>,

    /// Authoritative tablet map.
    tablet_map: Arc<TabletMap>,

    /// Membership change tracker registered with the server list.
    tracker: Arc<ServerTracker>,

    /// The serialized task queue owning all manager state.
    task_queue: TaskQueue<ManagerTask>,

    /// Sender side of the recover-request channel, used when constructing
    /// recoveries on the caller's thread.
    tx_recover: mpsc::UnboundedSender<RecoverRequest>,

    /// Test-only: mark tablets and log on crash notifications, but do not
    /// schedule recoveries.
    do_not_start_recoveries: bool,
}

impl MasterRecoveryManager {
    /// Creates a new recovery manager bound to the given collaborators,
    /// parsing config overrides from `config_str`. A tracker is created
    /// and registered with the server list so membership deltas reach the
    /// manager. Returns the manager and the receiver end of the
    /// recover-request channel. The manager starts out halted; call
    /// `start`.
    pub fn new_and_setup(
        server_list: Arc<CoordinatorServerList>,
        tablet_map: Arc<TabletMap>,
        config_str: Option<&str>,
    ) -> Result<
        (Self, mpsc::UnboundedReceiver<RecoverRequest>),
        KeystoneError,
    > {
        let config = parsed_config!(config_str => ManagerConfig;
                                    max_active_recoveries,
                                    do_not_start_recoveries)?;
        if config.max_active_recoveries == 0 {
            return logged_err!(
                "recovman";
                "invalid max_active_recoveries {}",
                config.max_active_recoveries
            );
        }

        let (tx_recover, rx_recover) = mpsc::unbounded_channel();
        let tracker = Arc::new(ServerTracker::new());

        let core_server_list = server_list.clone();
        let core_tablet_map = tablet_map.clone();
        let core_tracker = tracker.clone();
        let core_tx_recover = tx_recover.clone();
        let task_queue = TaskQueue::new(move |queue| RecoveryCore {
            server_list: core_server_list,
            tablet_map: core_tablet_map,
            tracker: core_tracker,
            queue,
            tx_recover: core_tx_recover,
            waiting: VecDeque::new(),
            active: HashMap::new(),
            max_active_recoveries: config.max_active_recoveries,
        });

        // membership deltas pushed into the tracker wake the manager
        let notify_submitter = task_queue.submitter();
        tracker.set_notifier(move || {
            if let Err(e) =
                notify_submitter.submit(ManagerTask::ApplyTrackerChanges)
            {
                ks_error!(
                    "recovman";
                    "error scheduling tracker-change application: {}",
                    e
                );
            }
        });
        server_list.register_tracker(tracker.clone());

        Ok((
            MasterRecoveryManager {
                server_list,
                tablet_map,
                tracker,
                task_queue,
                tx_recover,
                do_not_start_recoveries: config.do_not_start_recoveries,
            },
            rx_recover,
        ))
    }

    /// Launches the worker performing recoveries; this must be called
    /// before other operations make progress. Calling `start` on a
    /// started manager has no effect.
    pub fn start(&mut self) {
        self.task_queue.start();
    }

    /// Stops progress on recoveries after the currently executing step;
    /// queued work is dropped. Idempotent; `start` resumes afterwards.
    pub async fn halt(&mut self) -> Result<(), KeystoneError> {
        self.task_queue.halt().await
    }

    /// Marks the tablets of a now crashed server as recovering and
    /// enqueues their recovery; the actual recovery happens
    /// asynchronously. A crashed server that owned no tablets needs no
    /// recovery.
    pub fn start_master_recovery(
        &self,
        crashed_server_id: ServerId,
    ) -> Result<(), KeystoneError> {
        let tablets = self
            .tablet_map
            .set_status_for_server(crashed_server_id, TabletStatus::Recovering);
        if tablets.is_empty() {
            ks_info!(
                "recovman";
                "server {} crashed, but it had no tablets",
                crashed_server_id
            );
            return Ok(());
        }
        self.restart_master_recovery(crashed_server_id)
    }

    /// Enqueues recovery of the will stored for the server in the server
    /// list. Does not touch tablet statuses; see `start_master_recovery`
    /// for that.
    fn restart_master_recovery(
        &self,
        crashed_server_id: ServerId,
    ) -> Result<(), KeystoneError> {
        let entry = self.server_list.entry(crashed_server_id)?;
        ks_info!(
            "recovman";
            "scheduling recovery of master {}",
            crashed_server_id
        );

        if self.do_not_start_recoveries {
            ks_trace!(
                "recovman";
                "recovery crashed server id: {}",
                crashed_server_id
            );
            ks_trace!(
                "recovman";
                "recovery min open segment id: {}",
                entry.min_open_segment_id
            );
            return Ok(());
        }

        let will: Will = decode_from_slice(&entry.will)?;
        let recovery = Recovery::new(
            self.task_queue.submitter(),
            self.tracker.clone(),
            self.tx_recover.clone(),
            crashed_server_id,
            will,
            entry.min_open_segment_id,
        );
        self.task_queue.submit(ManagerTask::Enqueue { recovery })
    }

    /// Reports that a recovery master finished recovering its partitions,
    /// successfully or not. On success `recovered_tablets` carries the
    /// master's own id and log head as each tablet's new owner and ctime.
    /// The report is processed asynchronously.
    pub fn recovery_master_finished(
        &self,
        recovery_id: RecoveryId,
        recovery_master_id: ServerId,
        recovered_tablets: Vec<Tablet>,
        successful: bool,
    ) -> Result<(), KeystoneError> {
        ks_info!(
            "recovman";
            "called by master {} with {} recovered tablets",
            recovery_master_id,
            recovered_tablets.len()
        );
        self.task_queue.submit(ManagerTask::MasterFinished {
            recovery_id,
            recovery_master_id,
            recovered_tablets,
            successful,
        })
    }

    /// Schedules the application of pending tracker changes. Invoked
    /// (through the tracker's notifier) whenever the server list has
    /// pushed changes; may also be called directly.
    pub fn tracker_changes_enqueued(&self) -> Result<(), KeystoneError> {
        self.task_queue.submit(ManagerTask::ApplyTrackerChanges)
    }

    /// Waits until no queued work remains. Meaningful only once external
    /// event sources have stopped submitting; useful to tests and
    /// operator tooling.
    pub async fn quiesce(&self) -> Result<(), KeystoneError> {
        loop {
            self.task_queue.flush().await?;
            if self.task_queue.num_pending() == 0 {
                return Ok(());
            }
        }
    }
}
