//! Simulator handoff.
//!
//! A teleport moves through `Requested`, `Started` and `InProgress` as the
//! origin simulator reports on it, then ends in exactly one of `Finished`,
//! `Failed` or `TimedOut`. A `TeleportFinish` from the simulator still ends
//! in `Failed` when the destination circuit cannot be connected.

mod coordinator;
mod state;

pub use coordinator::{
    DIALOG_ACCEPT_TELEPORT, DIALOG_DENY_TELEPORT, TELEPORT_FLAGS_VIA_LURE, TeleportCoordinator,
    TeleportHandle, TeleportListener,
};
pub use state::{
    TeleportOutcome, TeleportPhase, TeleportSession, TeleportStatus, TeleportTarget,
    TeleportUpdate,
};
