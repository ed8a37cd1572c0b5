//! Tablets, wills, and the authoritative tablet map.

use crate::coord::servlist::ServerId;
use crate::utils::KeystoneError;

use parking_lot::Mutex;

use serde::{Deserialize, Serialize};

/// Position in a master's log: a segment id and a byte offset within it.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Default,
    Serialize,
    Deserialize,
)]
pub struct LogPosition {
    /// Segment id.
    pub segment_id: u64,

    /// Byte offset within the segment.
    pub offset: u32,
}

/// Availability status of a tablet.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum TabletStatus {
    /// The tablet is served normally by its owner.
    Normal,

    /// The tablet's owner crashed; its data is being reconstructed.
    Recovering,
}

/// A contiguous range of a table's key-hash space and its assignment.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Tablet {
    /// Table this tablet belongs to.
    pub table_id: u64,

    /// First key hash covered by this tablet.
    pub start_key_hash: u64,

    /// Last key hash covered by this tablet (inclusive).
    pub end_key_hash: u64,

    /// Server currently assigned this tablet.
    pub server_id: ServerId,

    /// Availability status.
    pub status: TabletStatus,

    /// Log position of the owner's head at the time this assignment was
    /// created. Data written before this position belongs to a previous
    /// assignment.
    pub ctime: LogPosition,
}

/// A crashed master's tablets partitioned into units of recovery work,
/// grouped by partition id.
///
/// Partition ids are consecutive starting at 0, and no empty partition may
/// precede a non-empty one; `add_tablet` enforces both by construction.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Will {
    /// Tablets per partition id.
    partitions: Vec<Vec<Tablet>>,
}

impl Will {
    /// Creates an empty will.
    pub fn new() -> Self {
        Will {
            partitions: Vec::new(),
        }
    }

    /// Adds a tablet to the given partition. The partition id must name an
    /// existing partition or the next consecutive one.
    pub fn add_tablet(
        &mut self,
        partition_id: usize,
        tablet: Tablet,
    ) -> Result<(), KeystoneError> {
        if partition_id > self.partitions.len() {
            return logged_err!(
                "tablets";
                "partition id {} skips over {} existing partitions",
                partition_id,
                self.partitions.len()
            );
        }
        if partition_id == self.partitions.len() {
            self.partitions.push(Vec::new());
        }
        self.partitions[partition_id].push(tablet);
        Ok(())
    }

    /// Number of partitions in the will.
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Tablets of the given partition; empty if out of range.
    pub fn partition(&self, partition_id: usize) -> &[Tablet] {
        self.partitions
            .get(partition_id)
            .map(|tablets| tablets.as_slice())
            .unwrap_or(&[])
    }

    /// True if the will covers no tablets at all.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Authoritative cluster-wide mapping from tablets to the masters serving
/// them. Shared between the coordinator's request-serving side and the
/// recovery control plane; all accessors synchronize internally.
#[derive(Default)]
pub struct TabletMap {
    /// All tablets in the cluster.
    tablets: Mutex<Vec<Tablet>>,
}

impl TabletMap {
    /// Creates a new empty tablet map.
    pub fn new() -> Self {
        TabletMap {
            tablets: Mutex::new(Vec::new()),
        }
    }

    /// Adds a tablet to the map.
    pub fn add_tablet(&self, tablet: Tablet) {
        self.tablets.lock().push(tablet);
    }

    /// Sets the status of every tablet currently assigned to `server_id`
    /// and returns the affected tablets (carrying their new status).
    pub fn set_status_for_server(
        &self,
        server_id: ServerId,
        status: TabletStatus,
    ) -> Vec<Tablet> {
        let mut tablets = self.tablets.lock();
        let mut affected = Vec::new();
        for tablet in tablets.iter_mut() {
            if tablet.server_id == server_id {
                tablet.status = status;
                affected.push(tablet.clone());
            }
        }
        affected
    }

    /// Reassigns the tablet identified exactly by `(table_id,
    /// start_key_hash, end_key_hash)`. Fails if no entry matches the triple
    /// exactly.
    pub fn modify_tablet(
        &self,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
        new_owner: ServerId,
        status: TabletStatus,
        ctime: LogPosition,
    ) -> Result<(), KeystoneError> {
        let mut tablets = self.tablets.lock();
        for tablet in tablets.iter_mut() {
            if tablet.table_id == table_id
                && tablet.start_key_hash == start_key_hash
                && tablet.end_key_hash == end_key_hash
            {
                tablet.server_id = new_owner;
                tablet.status = status;
                tablet.ctime = ctime;
                return Ok(());
            }
        }
        logged_err!(
            "tablets";
            "no tablet ({}, [{:#x}, {:#x}]) in the map",
            table_id,
            start_key_hash,
            end_key_hash
        )
    }

    /// Looks up a tablet by its exact identifying triple.
    pub fn get_tablet(
        &self,
        table_id: u64,
        start_key_hash: u64,
        end_key_hash: u64,
    ) -> Option<Tablet> {
        self.tablets
            .lock()
            .iter()
            .find(|tablet| {
                tablet.table_id == table_id
                    && tablet.start_key_hash == start_key_hash
                    && tablet.end_key_hash == end_key_hash
            })
            .cloned()
    }

    /// Returns copies of all tablets currently assigned to `server_id`.
    pub fn tablets_owned_by(&self, server_id: ServerId) -> Vec<Tablet> {
        self.tablets
            .lock()
            .iter()
            .filter(|tablet| tablet.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Number of tablets in the map.
    pub fn len(&self) -> usize {
        self.tablets.lock().len()
    }

    /// True if the map holds no tablets.
    pub fn is_empty(&self) -> bool {
        self.tablets.lock().is_empty()
    }
}

#[cfg(test)]
mod tablets_tests {
    use super::*;

    fn tablet(table_id: u64, start: u64, end: u64, owner: u64) -> Tablet {
        Tablet {
            table_id,
            start_key_hash: start,
            end_key_hash: end,
            server_id: ServerId(owner),
            status: TabletStatus::Normal,
            ctime: LogPosition::default(),
        }
    }

    #[test]
    fn will_consecutive_partitions() -> Result<(), KeystoneError> {
        let mut will = Will::new();
        will.add_tablet(0, tablet(1, 0, 9, 1))?;
        will.add_tablet(1, tablet(1, 10, 19, 1))?;
        will.add_tablet(0, tablet(2, 0, 9, 1))?;
        assert_eq!(will.num_partitions(), 2);
        assert_eq!(will.partition(0).len(), 2);
        assert_eq!(will.partition(1).len(), 1);
        assert!(will.partition(7).is_empty());
        // partition 3 would leave partition 2 empty before it
        assert!(will.add_tablet(3, tablet(3, 0, 9, 1)).is_err());
        Ok(())
    }

    #[test]
    fn status_for_server() {
        let map = TabletMap::new();
        map.add_tablet(tablet(1, 0, 9, 1));
        map.add_tablet(tablet(1, 10, 19, 2));
        map.add_tablet(tablet(2, 0, 9, 1));

        let affected =
            map.set_status_for_server(ServerId(1), TabletStatus::Recovering);
        assert_eq!(affected.len(), 2);
        assert!(affected
            .iter()
            .all(|t| t.status == TabletStatus::Recovering));
        assert_eq!(
            map.get_tablet(1, 10, 19).unwrap().status,
            TabletStatus::Normal
        );
        assert!(map
            .set_status_for_server(ServerId(9), TabletStatus::Recovering)
            .is_empty());
    }

    #[test]
    fn modify_hit_and_miss() {
        let map = TabletMap::new();
        map.add_tablet(tablet(1, 0, 9, 1));

        let ctime = LogPosition {
            segment_id: 7,
            offset: 96,
        };
        map.modify_tablet(1, 0, 9, ServerId(3), TabletStatus::Normal, ctime)
            .unwrap();
        let now = map.get_tablet(1, 0, 9).unwrap();
        assert_eq!(now.server_id, ServerId(3));
        assert_eq!(now.ctime, ctime);

        // range must match exactly
        assert!(map
            .modify_tablet(
                1,
                0,
                8,
                ServerId(3),
                TabletStatus::Normal,
                ctime
            )
            .is_err());
    }

    #[test]
    fn owned_by() {
        let map = TabletMap::new();
        map.add_tablet(tablet(1, 0, 9, 1));
        map.add_tablet(tablet(1, 10, 19, 2));
        assert_eq!(map.tablets_owned_by(ServerId(2)).len(), 1);
        assert_eq!(map.len(), 2);
    }
}
