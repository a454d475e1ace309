use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use super::stats::NetworkStats;
use super::tracking::{AckQueue, AckTracker, ReceiveTracker};
use crate::agent::AgentIdentity;
use crate::config::ClientConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    PeerClosed,
    TimedOut,
    Refused,
    Retired,
    SequenceCorrupted,
    Shutdown,
    Io(io::ErrorKind),
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Requested => "closed locally",
            CloseReason::PeerClosed => "closed by simulator",
            CloseReason::TimedOut => "timed out",
            CloseReason::Refused => "connection refused",
            CloseReason::Retired => "retired after handoff",
            CloseReason::SequenceCorrupted => "sequence bookkeeping corrupted",
            CloseReason::Shutdown => "transport shut down",
            CloseReason::Io(_) => "socket error",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Io(kind) => write!(f, "{}: {kind}", self.as_str()),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Mutable per-circuit bookkeeping. Only the transport touches it, always
/// under the circuit's lock.
#[derive(Debug)]
pub struct CircuitState {
    next_sequence: u32,
    pub(crate) acks: AckTracker,
    pub(crate) seen: ReceiveTracker,
    pub(crate) outbound_acks: AckQueue,
    pub(crate) last_receive: Instant,
    pub(crate) stats: NetworkStats,
    pub(crate) retire_at: Option<Instant>,
}

impl CircuitState {
    fn new(config: &ClientConfig) -> Self {
        Self {
            next_sequence: 1,
            acks: AckTracker::new(config.max_pending_acks),
            seen: ReceiveTracker::new(config.dedup_window),
            outbound_acks: AckQueue::default(),
            last_receive: Instant::now(),
            stats: NetworkStats::default(),
            retire_at: None,
        }
    }

    /// Sequence the next frame will carry. Not consumed until `commit_sequence`.
    pub(crate) fn peek_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Advances the counter, wrapping past zero.
    pub(crate) fn commit_sequence(&mut self) {
        self.next_sequence = match self.next_sequence.wrapping_add(1) {
            0 => 1,
            next => next,
        };
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }
}

/// One simulator endpoint: a connected UDP socket plus its reliability state.
#[derive(Debug)]
pub struct Circuit {
    id: CircuitId,
    remote: SocketAddr,
    local: SocketAddr,
    code: u32,
    identity: AgentIdentity,
    socket: UdpSocket,
    alive: AtomicBool,
    current: AtomicBool,
    state: Mutex<CircuitState>,
}

impl Circuit {
    pub(crate) fn open(
        id: CircuitId,
        remote: SocketAddr,
        code: u32,
        identity: AgentIdentity,
        config: &ClientConfig,
    ) -> io::Result<Self> {
        let bind_addr: SocketAddr = match remote {
            SocketAddr::V4(v4) if v4.ip().is_loopback() => (Ipv4Addr::LOCALHOST, 0).into(),
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        socket.connect(remote)?;
        socket.set_read_timeout(Some(config.recv_poll()))?;
        let local = socket.local_addr()?;

        Ok(Self {
            id,
            remote,
            local,
            code,
            identity,
            socket,
            alive: AtomicBool::new(true),
            current: AtomicBool::new(false),
            state: Mutex::new(CircuitState::new(config)),
        })
    }

    pub fn id(&self) -> CircuitId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn circuit_code(&self) -> u32 {
        self.code
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock().stats.clone()
    }

    pub fn pending_acks(&self) -> usize {
        self.lock().acks.unacked_count()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CircuitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Marks the circuit dead. Returns true for the caller that flipped it.
    pub(crate) fn mark_closed(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }
}

impl fmt::Display for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit {} ({})", self.id, self.remote)
    }
}
