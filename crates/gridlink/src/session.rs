use std::net::SocketAddr;
use std::sync::Arc;

use glam::Vec3;

use crate::agent::{AgentCache, AgentIdentity, AgentState};
use crate::config::ClientConfig;
use crate::dispatch::{CallbackDispatcher, HandlerId};
use crate::error::{ConnectError, SendError, TeleportError};
use crate::grid::RegionResolver;
use crate::net::{
    Block, Circuit, FieldValue, Message, MessageType, ReliableTransport, TransportEvent,
};
use crate::registry::SimulatorRegistry;
use crate::teleport::{TeleportCoordinator, TeleportHandle, TeleportOutcome, TeleportTarget};

/// One logged-in agent: the transport, its circuits and the teleport state.
///
/// Everything hangs off this value; dropping it shuts the transport down.
pub struct Session {
    identity: AgentIdentity,
    dispatcher: Arc<CallbackDispatcher>,
    transport: ReliableTransport,
    registry: Arc<SimulatorRegistry>,
    teleports: Arc<TeleportCoordinator>,
    agent: Arc<AgentCache>,
}

impl Session {
    pub fn new(
        config: ClientConfig,
        identity: AgentIdentity,
        resolver: Arc<dyn RegionResolver>,
    ) -> Self {
        let dispatcher = Arc::new(CallbackDispatcher::new());
        let transport = ReliableTransport::new(config, Arc::clone(&dispatcher));
        let registry = Arc::new(SimulatorRegistry::new(transport.clone(), identity));
        let agent = AgentCache::new();
        agent.attach(&dispatcher);
        let teleports = TeleportCoordinator::new(
            Arc::clone(&registry),
            transport.clone(),
            resolver,
            Arc::clone(&agent),
        );
        teleports.attach(&dispatcher);

        Self {
            identity,
            dispatcher,
            transport,
            registry,
            teleports,
            agent,
        }
    }

    /// Connects to the first simulator, makes it current and announces the
    /// agent with `CompleteAgentMovement`.
    pub fn login(
        &self,
        endpoint: SocketAddr,
        circuit_code: u32,
    ) -> Result<Arc<Circuit>, ConnectError> {
        let circuit = self.registry.connect(endpoint, circuit_code)?;
        self.registry.promote(&circuit)?;

        let complete = Message::new(MessageType::CompleteAgentMovement).with_block(
            Block::new("AgentData")
                .with("AgentID", FieldValue::Uuid(self.identity.agent_id))
                .with("SessionID", FieldValue::Uuid(self.identity.session_id))
                .with("CircuitCode", FieldValue::U32(circuit_code)),
        );
        self.transport.send(&circuit, complete, true)?;
        log::info!("Logged in as {} via {}", self.identity.agent_id, circuit);
        Ok(circuit)
    }

    /// Sends `LogoutRequest` on the current circuit, closes every circuit and
    /// stops the background threads.
    pub fn logout(&self) {
        if let Some(circuit) = self.registry.current() {
            let request =
                Message::new(MessageType::LogoutRequest).with_block(self.identity.agent_data());
            if let Err(e) = self.transport.send(&circuit, request, true) {
                log::warn!("LogoutRequest on {} failed: {}", circuit, e);
            }
        }
        self.teleports.cancel();
        self.registry.disconnect_all();
        self.transport.shutdown();
    }

    pub fn identity(&self) -> AgentIdentity {
        self.identity
    }

    pub fn send(
        &self,
        circuit: &Circuit,
        message: Message,
        reliable: bool,
    ) -> Result<u32, SendError> {
        self.transport.send(circuit, message, reliable)
    }

    /// Sends on whichever circuit is current right now.
    pub fn send_current(&self, message: Message, reliable: bool) -> Result<u32, SendError> {
        let circuit = self.current_circuit().ok_or(SendError::NoCurrentCircuit)?;
        self.transport.send(&circuit, message, reliable)
    }

    pub fn register_handler<F>(&self, kind: MessageType, handler: F) -> HandlerId
    where
        F: Fn(&Message, &Arc<Circuit>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.register(kind, handler)
    }

    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Blocking teleport. `Ok` only when the agent arrived.
    pub fn teleport(
        &self,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
    ) -> Result<TeleportOutcome, TeleportError> {
        self.teleports.teleport(target, position, look_at)
    }

    pub fn begin_teleport<F>(
        &self,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
        on_complete: F,
    ) -> Result<(), TeleportError>
    where
        F: FnOnce(TeleportOutcome) + Send + 'static,
    {
        self.teleports
            .begin_teleport(target, position, look_at, on_complete)
    }

    pub fn start_teleport(
        &self,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
    ) -> Result<TeleportHandle, TeleportError> {
        self.teleports.start(target, position, look_at)
    }

    pub fn current_circuit(&self) -> Option<Arc<Circuit>> {
        self.registry.current()
    }

    /// Name sent with instant messages, such as teleport offer replies.
    pub fn set_name(&self, first: &str, last: &str) {
        self.agent.set_name(format!("{first} {last}"));
    }

    pub fn agent_state(&self) -> AgentState {
        self.agent.snapshot()
    }

    pub fn drain_events(&self) -> Vec<TransportEvent> {
        self.transport.drain_events()
    }

    pub fn transport(&self) -> &ReliableTransport {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<SimulatorRegistry> {
        &self.registry
    }

    pub fn teleports(&self) -> &Arc<TeleportCoordinator> {
        &self.teleports
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}
