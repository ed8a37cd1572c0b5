//! Keystone's coordinator-side functionality modules.

mod recovery;
mod recovman;
mod servlist;
mod tablets;
mod taskqueue;
mod tracker;

pub use recovery::{RecoverRequest, RecoveryId};
pub use recovman::{ManagerConfig, MasterRecoveryManager};
pub use servlist::{
    CoordinatorServerList, Entry, MembershipBroadcast, MembershipUpdate,
    ServerId, ServerStatus,
};
pub use tablets::{LogPosition, Tablet, TabletMap, TabletStatus, Will};
pub use tracker::{ServerChangeEvent, ServerDetails, ServerTracker};
