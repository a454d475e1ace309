use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use crate::agent::AgentIdentity;
use crate::error::{ConnectError, SendError};
use crate::net::{
    Block, Circuit, CloseReason, DeliveryOutcome, DeliveryTicket, FieldValue, Message,
    MessageType, ReliableTransport,
};

/// A circuit whose handshake has been sent but not yet acknowledged.
#[derive(Debug)]
pub struct PendingConnection {
    circuit: Arc<Circuit>,
    ticket: DeliveryTicket,
}

impl PendingConnection {
    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }
}

/// Every live simulator circuit, with exactly one designated current.
pub struct SimulatorRegistry {
    transport: ReliableTransport,
    identity: AgentIdentity,
    current: RwLock<Option<Arc<Circuit>>>,
}

impl SimulatorRegistry {
    pub fn new(transport: ReliableTransport, identity: AgentIdentity) -> Self {
        Self {
            transport,
            identity,
            current: RwLock::new(None),
        }
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    /// Opens a circuit to `endpoint` and sends the reliable `UseCircuitCode`
    /// handshake without waiting for its ack.
    pub fn begin_connect(
        &self,
        endpoint: SocketAddr,
        circuit_code: u32,
    ) -> Result<PendingConnection, ConnectError> {
        let circuit = self
            .transport
            .open_circuit(endpoint, circuit_code, self.identity)?;

        let handshake = Message::new(MessageType::UseCircuitCode).with_block(
            Block::new("CircuitCode")
                .with("Code", FieldValue::U32(circuit_code))
                .with("SessionID", FieldValue::Uuid(self.identity.session_id))
                .with("ID", FieldValue::Uuid(self.identity.agent_id)),
        );
        match self.transport.send_tracked(&circuit, handshake) {
            Ok(ticket) => Ok(PendingConnection { circuit, ticket }),
            Err(e) => {
                self.transport.close_circuit(&circuit, CloseReason::Requested);
                Err(match e {
                    SendError::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
                        ConnectError::Refused(io.to_string())
                    }
                    other => ConnectError::Send(other),
                })
            }
        }
    }

    /// Waits for the handshake ack. A failed connect closes the circuit.
    pub fn finish_connect(&self, pending: PendingConnection) -> Result<Arc<Circuit>, ConnectError> {
        let PendingConnection { circuit, ticket } = pending;
        let timeout = self.transport.config().connect_timeout();

        let error = match ticket.wait(timeout) {
            Some(DeliveryOutcome::Acked) => {
                log::info!("Connected {} with code {}", circuit, circuit.circuit_code());
                return Ok(circuit);
            }
            Some(DeliveryOutcome::Failed(_)) | None => ConnectError::Timeout,
            Some(DeliveryOutcome::Closed(reason)) => ConnectError::Refused(reason.to_string()),
        };
        log::warn!("Connecting {} failed: {}", circuit, error);
        self.transport.close_circuit(&circuit, CloseReason::Requested);
        Err(error)
    }

    /// Opens a circuit and blocks until the simulator acknowledges it.
    pub fn connect(
        &self,
        endpoint: SocketAddr,
        circuit_code: u32,
    ) -> Result<Arc<Circuit>, ConnectError> {
        let pending = self.begin_connect(endpoint, circuit_code)?;
        self.finish_connect(pending)
    }

    /// Makes `circuit` current and returns the one it replaced. The previous
    /// circuit stays open for the configured linger period.
    pub fn promote(&self, circuit: &Arc<Circuit>) -> Result<Option<Arc<Circuit>>, ConnectError> {
        if !circuit.is_alive() {
            return Err(ConnectError::Closed(circuit.id()));
        }

        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = current.as_ref() {
            if Arc::ptr_eq(existing, circuit) {
                return Ok(None);
            }
        }
        // A circuit lingering from an earlier handoff is current again.
        self.transport.unretire(circuit);
        circuit.set_current(true);
        let previous = current.replace(Arc::clone(circuit));
        if let Some(previous) = &previous {
            previous.set_current(false);
            self.transport
                .retire(previous, self.transport.config().previous_circuit_linger());
        }
        drop(current);

        log::info!("Promoted {} to current", circuit);
        Ok(previous)
    }

    /// The circuit agent actions go to, if it is still alive.
    pub fn current(&self) -> Option<Arc<Circuit>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|circuit| circuit.is_alive())
            .cloned()
    }

    pub fn circuits(&self) -> Vec<Arc<Circuit>> {
        self.transport.circuits()
    }

    /// Live circuits other than the current one.
    pub fn neighbors(&self) -> Vec<Arc<Circuit>> {
        self.transport
            .circuits()
            .into_iter()
            .filter(|circuit| !circuit.is_current())
            .collect()
    }

    pub fn disconnect(&self, circuit: &Circuit) {
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if current.as_ref().is_some_and(|c| c.id() == circuit.id()) {
                *current = None;
            }
        }
        self.transport.disconnect(circuit);
    }

    pub fn disconnect_all(&self) {
        for circuit in self.circuits() {
            self.disconnect(&circuit);
        }
    }
}
