use std::io;

use thiserror::Error;

use crate::net::{CircuitId, EncodeError, MessageType};

pub use crate::net::{DecodeError, FieldError};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("timed out waiting for the simulator to acknowledge the circuit")]
    Timeout,
    #[error("simulator refused the circuit: {0}")]
    Refused(String),
    #[error("circuit {0} is closed")]
    Closed(CircuitId),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("circuit {0} is closed")]
    CircuitClosed(CircuitId),
    #[error("no current circuit")]
    NoCurrentCircuit,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("frame of {0} bytes exceeds the packet size limit")]
    TooLarge(usize),
    #[error("{0} reliable messages already awaiting acknowledgement")]
    Backlog(usize),
    #[error("sequence {0} collides with an unacknowledged message")]
    SequenceCorrupted(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A reliable message that ran out of resends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?} #{sequence} on circuit {circuit} unacknowledged after {attempts} attempts")]
pub struct DeliveryFailure {
    pub circuit: CircuitId,
    pub sequence: u32,
    pub kind: MessageType,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeleportErrorKind {
    Busy,
    Resolve,
    Connect,
    Timeout,
    Simulator,
    Cancelled,
    NoCircuit,
    Send,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TeleportError {
    #[error("busy")]
    Busy,
    #[error("unable to resolve name")]
    UnresolvedName { name: String },
    #[error("failed to connect to destination")]
    ConnectFailed { reason: String },
    #[error("timed out")]
    TimedOut,
    /// Reason string reported by the simulator.
    #[error("{0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
    #[error("no current circuit")]
    NoCircuit,
    #[error("failed to send teleport request: {0}")]
    Send(String),
}

impl TeleportError {
    pub fn kind(&self) -> TeleportErrorKind {
        match self {
            Self::Busy => TeleportErrorKind::Busy,
            Self::UnresolvedName { .. } => TeleportErrorKind::Resolve,
            Self::ConnectFailed { .. } => TeleportErrorKind::Connect,
            Self::TimedOut => TeleportErrorKind::Timeout,
            Self::Rejected(_) => TeleportErrorKind::Simulator,
            Self::Cancelled => TeleportErrorKind::Cancelled,
            Self::NoCircuit => TeleportErrorKind::NoCircuit,
            Self::Send(_) => TeleportErrorKind::Send,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_teleport_error_strings() {
        assert_eq!(TeleportError::Busy.to_string(), "busy");
        assert_eq!(TeleportError::TimedOut.to_string(), "timed out");
        assert_eq!(
            TeleportError::UnresolvedName {
                name: "ahern".into()
            }
            .to_string(),
            "unable to resolve name"
        );
        assert_eq!(
            TeleportError::ConnectFailed {
                reason: "refused".into()
            }
            .to_string(),
            "failed to connect to destination"
        );
        assert_eq!(
            TeleportError::Rejected("Region is full".into()).to_string(),
            "Region is full"
        );
    }

    #[test]
    fn test_teleport_error_kinds() {
        assert_eq!(TeleportError::Cancelled.kind(), TeleportErrorKind::Cancelled);
        assert_eq!(
            TeleportError::Rejected(String::new()).kind(),
            TeleportErrorKind::Simulator
        );
    }
}
