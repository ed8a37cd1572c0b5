//! Public interface to the Keystone library: the coordinator-side control
//! plane that drives recovery of crashed master servers in a distributed
//! in-memory key-value storage cluster.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod coord;

pub use coord::{
    CoordinatorServerList, Entry, LogPosition, ManagerConfig,
    MasterRecoveryManager, MembershipBroadcast, MembershipUpdate,
    RecoverRequest, RecoveryId, ServerChangeEvent, ServerDetails, ServerId,
    ServerStatus, ServerTracker, Tablet, TabletMap, TabletStatus, Will,
};
pub use utils::KeystoneError;
