//! Per-recovery state machine, driven step by step on the manager's task
//! queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::coord::recovman::ManagerTask;
use crate::coord::servlist::ServerId;
use crate::coord::tablets::{Tablet, Will};
use crate::coord::taskqueue::TaskSubmitter;
use crate::coord::tracker::ServerTracker;

use rand::prelude::*;

use tokio::sync::mpsc;

/// Recovery instance id type.
pub type RecoveryId = u64;

/// Source of monotonically unique recovery ids.
static NEXT_RECOVERY_ID: AtomicU64 = AtomicU64::new(1);

/// One unit of recovery work pushed to a recovery master: reconstruct the
/// given partitions of the crashed master's will. The transport that would
/// deliver this as an RPC is external; the manager emits these on the
/// channel returned by `MasterRecoveryManager::new_and_setup`, and the
/// master answers through `recovery_master_finished`.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecoverRequest {
    /// Recovery this request belongs to.
    pub recovery_id: RecoveryId,

    /// The crashed master being recovered.
    pub crashed_server_id: ServerId,

    /// The recovery master asked to reconstruct the partitions.
    pub recovery_master_id: ServerId,

    /// Partition ids assigned to this master.
    pub partitions: Vec<usize>,

    /// Tablets of those partitions.
    pub tablets: Vec<Tablet>,

    /// Replicas of segments with lower ids are stale and must be ignored.
    pub min_open_segment_id: u64,
}

/// Progress phase of a recovery.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum RecoveryPhase {
    /// Admitted; the next drive step assigns partitions to recovery
    /// masters.
    StartRecoveryMasters,

    /// Recovery masters are reconstructing their partitions.
    WaitRecoveryMasters,

    /// Every master has reported (or none could be found); the next drive
    /// step finalizes the outcome with the manager.
    BroadcastRecoveryComplete,

    /// Finalized; the next drive step frees the recovery.
    Done,
}

/// State machine driving one attempt to restore a crashed master's
/// tablets. Owned by the manager's waiting queue or active set; every
/// method below runs from task execution on the shared queue.
pub(crate) struct Recovery {
    /// Submission handle onto the manager's task queue.
    queue: TaskSubmitter<ManagerTask>,

    /// The manager's server tracker, for master selection and slots.
    tracker: Arc<ServerTracker>,

    /// Sender side of the recover-request channel.
    tx_recover: mpsc::UnboundedSender<RecoverRequest>,

    /// Unique id of this recovery attempt.
    recovery_id: RecoveryId,

    /// The crashed master being recovered.
    pub(crate) crashed_server_id: ServerId,

    /// The crashed master's partitioned will.
    pub(crate) will: Will,

    /// Stale-replica barrier inherited from the server list entry.
    pub(crate) min_open_segment_id: u64,

    /// Current phase.
    phase: RecoveryPhase,

    /// Partitions assigned per still-outstanding recovery master.
    outstanding: HashMap<ServerId, Vec<usize>>,

    /// Partitions recovered successfully so far.
    successful_partitions: usize,

    /// Partitions whose recovery master failed or was lost.
    failed_partitions: usize,
}

impl Recovery {
    /// Creates a new recovery with a fresh id. Touches no manager state;
    /// the caller hands the recovery over through an enqueue task.
    pub(crate) fn new(
        queue: TaskSubmitter<ManagerTask>,
        tracker: Arc<ServerTracker>,
        tx_recover: mpsc::UnboundedSender<RecoverRequest>,
        crashed_server_id: ServerId,
        will: Will,
        min_open_segment_id: u64,
    ) -> Self {
        Recovery {
            queue,
            tracker,
            tx_recover,
            recovery_id: NEXT_RECOVERY_ID.fetch_add(1, Ordering::Relaxed),
            crashed_server_id,
            will,
            min_open_segment_id,
            phase: RecoveryPhase::StartRecoveryMasters,
            outstanding: HashMap::new(),
            successful_partitions: 0,
            failed_partitions: 0,
        }
    }

    /// Unique id of this recovery attempt.
    pub(crate) fn recovery_id(&self) -> RecoveryId {
        self.recovery_id
    }

    /// Current phase.
    pub(crate) fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Puts the next drive step of this recovery onto the queue.
    pub(crate) fn schedule(&self) {
        if let Err(e) = self.queue.submit(ManagerTask::DriveRecovery {
            recovery_id: self.recovery_id,
        }) {
            ks_error!(
                "recovery";
                "error scheduling recovery {}: {}",
                self.recovery_id,
                e
            );
        }
    }

    /// Assigns the will's partitions to live recovery masters, claims
    /// their tracker slots, and emits one recover request per master.
    /// With no eligible master every partition is accounted failed and the
    /// recovery completes immediately, unsuccessfully.
    pub(crate) fn start_recovery_masters(&mut self) {
        let num_partitions = self.will.num_partitions();
        if num_partitions == 0 {
            // a stale, empty will; complete vacuously
            self.phase = RecoveryPhase::BroadcastRecoveryComplete;
            self.schedule();
            return;
        }

        // eligible masters: live, not the crashed master itself, slot not
        // already claimed by some other recovery
        let mut candidates: Vec<ServerId> = self
            .tracker
            .live_servers()
            .into_iter()
            .filter(|&server_id| server_id != self.crashed_server_id)
            .filter(|&server_id| {
                self.tracker.recovery_for(server_id).is_none()
            })
            .collect();

        if candidates.is_empty() {
            ks_warn!(
                "recovery";
                "recovery {} of server {} found no usable recovery masters; \
                 failing all {} partitions",
                self.recovery_id,
                self.crashed_server_id,
                num_partitions
            );
            self.failed_partitions = num_partitions;
            self.phase = RecoveryPhase::BroadcastRecoveryComplete;
            self.schedule();
            return;
        }

        // spread partitions round-robin from a random starting master
        let start = rand::thread_rng().gen_range(0..candidates.len());
        candidates.rotate_left(start);
        let mut assignments: HashMap<ServerId, Vec<usize>> = HashMap::new();
        for partition_id in 0..num_partitions {
            let master = candidates[partition_id % candidates.len()];
            assignments.entry(master).or_default().push(partition_id);
        }

        for (master, partitions) in &assignments {
            self.tracker.set_recovery(*master, Some(self.recovery_id));
            let tablets: Vec<Tablet> = partitions
                .iter()
                .flat_map(|&partition_id| {
                    self.will.partition(partition_id).iter().cloned()
                })
                .collect();
            let request = RecoverRequest {
                recovery_id: self.recovery_id,
                crashed_server_id: self.crashed_server_id,
                recovery_master_id: *master,
                partitions: partitions.clone(),
                tablets,
                min_open_segment_id: self.min_open_segment_id,
            };
            if let Err(e) = self.tx_recover.send(request) {
                ks_error!(
                    "recovery";
                    "error sending recover request to {}: {}",
                    master,
                    e
                );
            }
        }
        ks_info!(
            "recovery";
            "recovery {} of server {}: {} partitions spread over {} \
             recovery masters",
            self.recovery_id,
            self.crashed_server_id,
            num_partitions,
            assignments.len()
        );
        self.outstanding = assignments;
        self.phase = RecoveryPhase::WaitRecoveryMasters;
    }

    /// Records a recovery master's completion report (successful or not)
    /// and releases its slot. Once no master is outstanding the completion
    /// step is scheduled.
    pub(crate) fn recovery_master_finished(
        &mut self,
        recovery_master_id: ServerId,
        successful: bool,
    ) {
        let partitions = match self.outstanding.remove(&recovery_master_id) {
            Some(partitions) => partitions,
            None => {
                // duplicate, late, or plain bogus report
                ks_warn!(
                    "recovery";
                    "server {} is not an outstanding recovery master of \
                     recovery {}",
                    recovery_master_id,
                    self.recovery_id
                );
                return;
            }
        };
        self.tracker.set_recovery(recovery_master_id, None);

        if successful {
            self.successful_partitions += partitions.len();
            ks_info!(
                "recovery";
                "recovery master {} finished recovering {} partitions of \
                 server {}",
                recovery_master_id,
                partitions.len(),
                self.crashed_server_id
            );
        } else {
            self.failed_partitions += partitions.len();
        }

        if self.outstanding.is_empty()
            && self.phase == RecoveryPhase::WaitRecoveryMasters
        {
            self.phase = RecoveryPhase::BroadcastRecoveryComplete;
            self.schedule();
        }
    }

    /// Marks finalization done and schedules the final cleanup step.
    pub(crate) fn finalized(&mut self) {
        self.phase = RecoveryPhase::Done;
        self.schedule();
    }

    /// Number of partitions recovered successfully so far.
    pub(crate) fn successful_partitions(&self) -> usize {
        self.successful_partitions
    }

    /// True if every partition of the will was recovered successfully.
    pub(crate) fn was_completely_successful(&self) -> bool {
        self.outstanding.is_empty() && self.failed_partitions == 0
    }
}
