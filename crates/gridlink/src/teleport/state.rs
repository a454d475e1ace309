use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use glam::Vec3;
use uuid::Uuid;

use crate::error::TeleportError;
use crate::net::Circuit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeleportPhase {
    Idle,
    /// Looking up a region name before anything is sent.
    Resolving,
    Requested,
    Started,
    InProgress,
    /// The simulator reported success; the destination circuit is connecting.
    Connecting,
    Finished,
    Failed,
    TimedOut,
}

impl TeleportPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::TimedOut)
    }

    /// Phases in which the simulator's teleport notifications are accepted.
    pub(crate) fn awaiting_simulator(self) -> bool {
        matches!(self, Self::Requested | Self::Started | Self::InProgress)
    }
}

/// Caller-facing status, as carried by outcomes and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeleportStatus {
    Start,
    Progress,
    Failed,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeleportTarget {
    Handle(u64),
    Name(String),
    /// Accepting a teleport offer from another agent.
    Lure(Uuid),
}

impl TeleportTarget {
    /// Look-at used when the caller has no preference.
    pub fn default_look_at(&self, position: Vec3) -> Vec3 {
        match self {
            Self::Handle(_) => Vec3::new(position.x + 1.0, position.y, position.z),
            Self::Name(_) | Self::Lure(_) => Vec3::new(0.0, 1.0, 0.0),
        }
    }
}

impl fmt::Display for TeleportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "region {handle:#x}"),
            Self::Name(name) => write!(f, "region {name:?}"),
            Self::Lure(id) => write!(f, "lure {id}"),
        }
    }
}

/// The one in-flight teleport.
#[derive(Debug, Clone)]
pub struct TeleportSession {
    pub target: TeleportTarget,
    pub position: Vec3,
    pub look_at: Vec3,
    pub phase: TeleportPhase,
    pub status_message: String,
    /// Armed once the request is on the wire.
    pub deadline: Option<Instant>,
    pub result: Option<Result<(), TeleportError>>,
}

impl TeleportSession {
    pub fn new(target: TeleportTarget, position: Vec3, look_at: Vec3) -> Self {
        let phase = match target {
            TeleportTarget::Name(_) => TeleportPhase::Resolving,
            _ => TeleportPhase::Requested,
        };
        Self {
            target,
            position,
            look_at,
            phase,
            status_message: String::new(),
            deadline: None,
            result: None,
        }
    }
}

/// Terminal result, delivered exactly once per teleport.
#[derive(Debug, Clone)]
pub struct TeleportOutcome {
    /// Current circuit at resolution: the destination on success.
    pub circuit: Option<Arc<Circuit>>,
    pub message: String,
    pub status: TeleportStatus,
    pub phase: TeleportPhase,
    pub error: Option<TeleportError>,
}

impl TeleportOutcome {
    pub fn into_result(self) -> Result<TeleportOutcome, TeleportError> {
        match self.error.clone() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}

/// Every observable step of a teleport, terminal ones included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeleportUpdate {
    pub phase: TeleportPhase,
    pub status: TeleportStatus,
    pub message: String,
}
