use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use glam::Vec3;
use uuid::Uuid;

use super::state::{
    TeleportOutcome, TeleportPhase, TeleportSession, TeleportStatus, TeleportTarget,
    TeleportUpdate,
};
use crate::agent::{AgentCache, AgentIdentity, AgentState};
use crate::dispatch::{CallbackDispatcher, HandlerId};
use crate::error::TeleportError;
use crate::grid::RegionResolver;
use crate::net::{Block, Circuit, FieldValue, Message, MessageType, ReliableTransport};
use crate::registry::SimulatorRegistry;

/// Instant message dialog codes used when answering a teleport offer.
pub const DIALOG_ACCEPT_TELEPORT: u8 = 23;
pub const DIALOG_DENY_TELEPORT: u8 = 24;
/// `TeleportFlags` value for a lure-initiated teleport.
pub const TELEPORT_FLAGS_VIA_LURE: u32 = 4;

pub type TeleportListener = Arc<dyn Fn(&TeleportUpdate) + Send + Sync>;

enum OutcomeSink {
    Callback(Box<dyn FnOnce(TeleportOutcome) + Send>),
    Channel(SyncSender<TeleportOutcome>),
}

impl OutcomeSink {
    fn deliver(self, outcome: TeleportOutcome) {
        match self {
            OutcomeSink::Callback(callback) => callback(outcome),
            OutcomeSink::Channel(tx) => {
                // A dropped handle means nobody is waiting.
                let _ = tx.try_send(outcome);
            }
        }
    }
}

struct ActiveTeleport {
    generation: u64,
    session: TeleportSession,
    origin: Arc<Circuit>,
    destination: Option<Arc<Circuit>>,
    sink: OutcomeSink,
    /// Dropped on resolution; wakes the deadline timer and resolver backoff.
    stop: Option<Sender<()>>,
}

/// Blocking side of a teleport started with [`TeleportCoordinator::start`].
pub struct TeleportHandle {
    generation: u64,
    rx: Receiver<TeleportOutcome>,
    coordinator: Arc<TeleportCoordinator>,
}

impl TeleportHandle {
    /// Blocks until the teleport resolves. `Ok` only for `Finished`.
    pub fn wait(self) -> Result<TeleportOutcome, TeleportError> {
        let limit = self.coordinator.transport.config().teleport_wait_limit();
        let outcome = match self.rx.recv_timeout(limit) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                self.coordinator.expire(self.generation);
                self.rx
                    .recv_timeout(Duration::from_secs(1))
                    .map_err(|_| TeleportError::TimedOut)?
            }
            Err(RecvTimeoutError::Disconnected) => return Err(TeleportError::TimedOut),
        };
        outcome.into_result()
    }

    /// Cancels this teleport if it is still the active one.
    pub fn cancel(&self) -> bool {
        self.coordinator.resolve_generation(
            self.generation,
            TeleportPhase::Failed,
            Err(TeleportError::Cancelled),
        )
    }
}

/// Drives one teleport at a time from request to a single terminal outcome.
pub struct TeleportCoordinator {
    registry: Arc<SimulatorRegistry>,
    transport: ReliableTransport,
    resolver: Arc<dyn RegionResolver>,
    agent: Arc<AgentCache>,
    active: Mutex<Option<ActiveTeleport>>,
    last_phase: Mutex<TeleportPhase>,
    generation: AtomicU64,
    listeners: RwLock<Vec<TeleportListener>>,
}

impl TeleportCoordinator {
    pub fn new(
        registry: Arc<SimulatorRegistry>,
        transport: ReliableTransport,
        resolver: Arc<dyn RegionResolver>,
        agent: Arc<AgentCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            resolver,
            agent,
            active: Mutex::new(None),
            last_phase: Mutex::new(TeleportPhase::Idle),
            generation: AtomicU64::new(0),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Registers the teleport notification handlers.
    pub fn attach(self: &Arc<Self>, dispatcher: &CallbackDispatcher) -> Vec<HandlerId> {
        let start = Arc::downgrade(self);
        let progress = Arc::downgrade(self);
        let failed = Arc::downgrade(self);
        let finish = Arc::downgrade(self);

        vec![
            dispatcher.register(MessageType::TeleportStart, move |_, circuit| {
                if let Some(coordinator) = start.upgrade() {
                    coordinator.on_start(circuit);
                }
                Ok(())
            }),
            dispatcher.register(MessageType::TeleportProgress, move |message, circuit| {
                let text = message.block("Info")?.string("Message")?;
                if let Some(coordinator) = progress.upgrade() {
                    coordinator.on_progress(circuit, text);
                }
                Ok(())
            }),
            dispatcher.register(MessageType::TeleportFailed, move |message, circuit| {
                let reason = message.block("Info")?.string("Reason")?;
                if let Some(coordinator) = failed.upgrade() {
                    coordinator.on_failed(circuit, reason);
                }
                Ok(())
            }),
            dispatcher.register(MessageType::TeleportFinish, move |message, circuit| {
                if let Some(coordinator) = finish.upgrade() {
                    coordinator.on_finish(circuit, message);
                }
                Ok(())
            }),
        ]
    }

    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&TeleportUpdate) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn phase(&self) -> TeleportPhase {
        match self.lock_active().as_ref() {
            Some(active) => active.session.phase,
            None => *self.last_phase.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn session(&self) -> Option<TeleportSession> {
        self.lock_active().as_ref().map(|active| active.session.clone())
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Teleports and blocks until the outcome. `Ok` only for `Finished`.
    pub fn teleport(
        self: &Arc<Self>,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
    ) -> Result<TeleportOutcome, TeleportError> {
        self.start(target, position, look_at)?.wait()
    }

    /// Starts a teleport; `on_complete` runs exactly once with the outcome.
    /// Busy and no-circuit rejections are returned here and never reach
    /// the callback.
    pub fn begin_teleport<F>(
        self: &Arc<Self>,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
        on_complete: F,
    ) -> Result<(), TeleportError>
    where
        F: FnOnce(TeleportOutcome) + Send + 'static,
    {
        self.launch(
            target,
            position,
            look_at,
            OutcomeSink::Callback(Box::new(on_complete)),
        )
        .map(|_| ())
    }

    pub fn start(
        self: &Arc<Self>,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
    ) -> Result<TeleportHandle, TeleportError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let generation = self.launch(target, position, look_at, OutcomeSink::Channel(tx))?;
        Ok(TeleportHandle {
            generation,
            rx,
            coordinator: Arc::clone(self),
        })
    }

    /// Accepts a teleport offer from `requester`.
    pub fn accept_lure(
        self: &Arc<Self>,
        requester: Uuid,
        lure_id: Uuid,
    ) -> Result<TeleportHandle, TeleportError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let target = TeleportTarget::Lure(lure_id);
        let look_at = target.default_look_at(Vec3::ZERO);
        let (generation, stop) =
            self.open_session(target, Vec3::ZERO, look_at, OutcomeSink::Channel(tx))?;

        let identity = self.registry.identity();
        let agent = self.agent.snapshot();
        let requests = vec![
            lure_reply(identity, &agent, requester, DIALOG_ACCEPT_TELEPORT),
            lure_request(identity, lure_id),
        ];
        if self.send_request(generation, requests) {
            self.spawn_deadline(generation, stop);
        }
        Ok(TeleportHandle {
            generation,
            rx,
            coordinator: Arc::clone(self),
        })
    }

    /// Declines a teleport offer. No teleport session is involved.
    pub fn deny_lure(&self, requester: Uuid) -> Result<(), TeleportError> {
        let circuit = self.registry.current().ok_or(TeleportError::NoCircuit)?;
        let agent = self.agent.snapshot();
        let reply = lure_reply(self.registry.identity(), &agent, requester, DIALOG_DENY_TELEPORT);
        self.transport
            .send(&circuit, reply, true)
            .map(|_| ())
            .map_err(|e| TeleportError::Send(e.to_string()))
    }

    /// Resolves the active teleport as cancelled and closes any half-open
    /// destination circuit. Returns false when nothing was in flight.
    pub fn cancel(&self) -> bool {
        let active = self.lock_active().take();
        match active {
            Some(active) => {
                self.finalize(active, TeleportPhase::Failed, Err(TeleportError::Cancelled));
                true
            }
            None => false,
        }
    }

    fn launch(
        self: &Arc<Self>,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
        sink: OutcomeSink,
    ) -> Result<u64, TeleportError> {
        let (generation, stop) = self.open_session(target.clone(), position, look_at, sink)?;

        match target {
            TeleportTarget::Handle(handle) => {
                let request = self.location_request(handle, position, look_at);
                if self.send_request(generation, vec![request]) {
                    self.spawn_deadline(generation, stop);
                }
            }
            TeleportTarget::Name(name) => {
                let coordinator = Arc::clone(self);
                let spawned = thread::Builder::new()
                    .name("gridlink-teleport-resolve".into())
                    .spawn(move || coordinator.resolve_name(generation, name, stop));
                if let Err(e) = spawned {
                    self.resolve_generation(
                        generation,
                        TeleportPhase::Failed,
                        Err(TeleportError::Send(e.to_string())),
                    );
                }
            }
            TeleportTarget::Lure(lure_id) => {
                let request = lure_request(self.registry.identity(), lure_id);
                if self.send_request(generation, vec![request]) {
                    self.spawn_deadline(generation, stop);
                }
            }
        }
        Ok(generation)
    }

    fn open_session(
        &self,
        target: TeleportTarget,
        position: Vec3,
        look_at: Vec3,
        sink: OutcomeSink,
    ) -> Result<(u64, Receiver<()>), TeleportError> {
        let origin = self.registry.current().ok_or(TeleportError::NoCircuit)?;
        let mut active = self.lock_active();
        if let Some(existing) = active.as_ref() {
            log::warn!(
                "Teleport to {} rejected, {} still in flight",
                target,
                existing.session.target
            );
            return Err(TeleportError::Busy);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = mpsc::channel();
        log::info!("Teleport {} to {} from {}", generation, target, origin);
        *active = Some(ActiveTeleport {
            generation,
            session: TeleportSession::new(target, position, look_at),
            origin,
            destination: None,
            sink,
            stop: Some(stop_tx),
        });
        Ok((generation, stop_rx))
    }

    fn location_request(&self, handle: u64, position: Vec3, look_at: Vec3) -> Message {
        Message::new(MessageType::TeleportLocationRequest)
            .with_block(self.registry.identity().agent_data())
            .with_block(
                Block::new("Info")
                    .with("RegionHandle", FieldValue::U64(handle))
                    .with("Position", FieldValue::Vector3(position))
                    .with("LookAt", FieldValue::Vector3(look_at)),
            )
    }

    /// Moves the session to `Requested`, arms its deadline and sends the
    /// request messages reliably on the origin circuit.
    fn send_request(&self, generation: u64, messages: Vec<Message>) -> bool {
        let origin = {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(active) if active.generation == generation => {
                    active.session.phase = TeleportPhase::Requested;
                    active.session.deadline =
                        Some(Instant::now() + self.transport.config().teleport_timeout());
                    Arc::clone(&active.origin)
                }
                _ => return false,
            }
        };

        for message in messages {
            if let Err(e) = self.transport.send(&origin, message, true) {
                self.resolve_generation(
                    generation,
                    TeleportPhase::Failed,
                    Err(TeleportError::Send(e.to_string())),
                );
                return false;
            }
        }
        true
    }

    fn spawn_deadline(self: &Arc<Self>, generation: u64, stop: Receiver<()>) {
        let coordinator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("gridlink-teleport-timer".into())
            .spawn(move || coordinator.await_deadline(generation, stop));
        if let Err(e) = spawned {
            log::error!("Teleport {} has no deadline timer: {}", generation, e);
        }
    }

    fn await_deadline(&self, generation: u64, stop: Receiver<()>) {
        let timeout = self.transport.config().teleport_timeout();
        if let Err(RecvTimeoutError::Timeout) = stop.recv_timeout(timeout) {
            self.expire(generation);
        }
    }

    fn resolve_name(self: Arc<Self>, generation: u64, name: String, stop: Receiver<()>) {
        let config = self.transport.config();
        let (attempts, backoff) = (config.resolve_attempts, config.resolve_backoff());
        let name = name.to_lowercase();

        let mut handle = self.resolver.lookup(&name);
        let mut attempt = 0;
        while handle.is_none() && attempt < attempts {
            attempt += 1;
            log::debug!("Region {:?} unresolved, attempt {}/{}", name, attempt, attempts);
            self.resolver.request(&name);
            match stop.recv_timeout(backoff) {
                Err(RecvTimeoutError::Timeout) => {}
                // Resolved elsewhere (cancelled) while backing off.
                _ => return,
            }
            handle = self.resolver.lookup(&name);
        }

        let Some(handle) = handle else {
            self.resolve_generation(
                generation,
                TeleportPhase::Failed,
                Err(TeleportError::UnresolvedName { name }),
            );
            return;
        };

        let (position, look_at) = match self.lock_active().as_ref() {
            Some(active) if active.generation == generation => {
                (active.session.position, active.session.look_at)
            }
            _ => return,
        };
        log::info!("Region {:?} resolved to {:#x}", name, handle);
        let request = self.location_request(handle, position, look_at);
        if self.send_request(generation, vec![request]) {
            self.await_deadline(generation, stop);
        }
    }

    fn on_start(&self, circuit: &Arc<Circuit>) {
        let update = {
            let mut active = self.lock_active();
            let Some(active) = active.as_mut().filter(|a| a.origin.id() == circuit.id()) else {
                return;
            };
            if active.session.phase != TeleportPhase::Requested {
                log::debug!("TeleportStart ignored in {:?}", active.session.phase);
                return;
            }
            active.session.phase = TeleportPhase::Started;
            active.session.status_message = "Teleport started".to_string();
            TeleportUpdate {
                phase: TeleportPhase::Started,
                status: TeleportStatus::Start,
                message: active.session.status_message.clone(),
            }
        };
        log::info!("Teleport started");
        self.notify(&update);
    }

    fn on_progress(&self, circuit: &Arc<Circuit>, text: String) {
        let update = {
            let mut active = self.lock_active();
            let Some(active) = active.as_mut().filter(|a| a.origin.id() == circuit.id()) else {
                return;
            };
            if !active.session.phase.awaiting_simulator() {
                log::debug!("TeleportProgress ignored in {:?}", active.session.phase);
                return;
            }
            active.session.phase = TeleportPhase::InProgress;
            active.session.status_message = text;
            TeleportUpdate {
                phase: TeleportPhase::InProgress,
                status: TeleportStatus::Progress,
                message: active.session.status_message.clone(),
            }
        };
        log::info!("Teleport progress: {}", update.message);
        self.notify(&update);
    }

    fn on_failed(&self, circuit: &Arc<Circuit>, reason: String) {
        let active = {
            let mut guard = self.lock_active();
            match guard.as_ref() {
                Some(active)
                    if active.origin.id() == circuit.id()
                        && active.session.phase.awaiting_simulator() =>
                {
                    guard.take()
                }
                _ => return,
            }
        };
        if let Some(active) = active {
            self.finalize(active, TeleportPhase::Failed, Err(TeleportError::Rejected(reason)));
        }
    }

    fn on_finish(self: &Arc<Self>, circuit: &Arc<Circuit>, message: &Message) {
        let destination = parse_finish(message);
        let generation = {
            let mut active = self.lock_active();
            let Some(active) = active.as_mut().filter(|a| a.origin.id() == circuit.id()) else {
                return;
            };
            if !active.session.phase.awaiting_simulator() {
                log::debug!("TeleportFinish ignored in {:?}", active.session.phase);
                return;
            }
            active.session.phase = TeleportPhase::Connecting;
            active.session.status_message = "Connecting to destination".to_string();
            active.generation
        };

        let (endpoint, circuit_code, region_handle) = match destination {
            Ok(destination) => destination,
            Err(e) => {
                self.resolve_generation(
                    generation,
                    TeleportPhase::Failed,
                    Err(TeleportError::ConnectFailed {
                        reason: format!("{e:#}"),
                    }),
                );
                return;
            }
        };
        log::info!(
            "Teleport finish: region {:#x} at {} code {}",
            region_handle,
            endpoint,
            circuit_code
        );

        let coordinator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("gridlink-teleport-connect".into())
            .spawn(move || coordinator.connect_destination(generation, endpoint, circuit_code));
        if let Err(e) = spawned {
            self.resolve_generation(
                generation,
                TeleportPhase::Failed,
                Err(TeleportError::ConnectFailed {
                    reason: e.to_string(),
                }),
            );
        }
    }

    fn connect_destination(&self, generation: u64, endpoint: SocketAddr, circuit_code: u32) {
        let connect_failed = |reason: String| {
            self.resolve_generation(
                generation,
                TeleportPhase::Failed,
                Err(TeleportError::ConnectFailed { reason }),
            );
        };

        let pending = match self.registry.begin_connect(endpoint, circuit_code) {
            Ok(pending) => pending,
            Err(e) => return connect_failed(e.to_string()),
        };
        {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(active) if active.generation == generation => {
                    active.destination = Some(Arc::clone(pending.circuit()));
                }
                _ => {
                    drop(active);
                    self.registry.disconnect(pending.circuit());
                    return;
                }
            }
        }

        let circuit = match self.registry.finish_connect(pending) {
            Ok(circuit) => circuit,
            Err(e) => return connect_failed(e.to_string()),
        };

        // Claim the terminal transition before touching the current circuit.
        let active = {
            let mut guard = self.lock_active();
            match guard.as_ref() {
                Some(active) if active.generation == generation => guard.take(),
                _ => None,
            }
        };
        let Some(active) = active else {
            // Resolved (timed out or cancelled) while connecting; the resolver
            // has already closed the destination.
            return;
        };

        if let Err(e) = self.registry.promote(&circuit) {
            self.finalize(
                active,
                TeleportPhase::Failed,
                Err(TeleportError::ConnectFailed {
                    reason: e.to_string(),
                }),
            );
            return;
        }

        let identity = self.registry.identity();
        let complete = Message::new(MessageType::CompleteAgentMovement).with_block(
            Block::new("AgentData")
                .with("AgentID", FieldValue::Uuid(identity.agent_id))
                .with("SessionID", FieldValue::Uuid(identity.session_id))
                .with("CircuitCode", FieldValue::U32(circuit.circuit_code())),
        );
        if let Err(e) = self.transport.send(&circuit, complete, true) {
            log::warn!("CompleteAgentMovement on {} failed: {}", circuit, e);
        }
        self.finalize(active, TeleportPhase::Finished, Ok(()));
    }

    fn expire(&self, generation: u64) -> bool {
        self.resolve_generation(generation, TeleportPhase::TimedOut, Err(TeleportError::TimedOut))
    }

    /// Resolves the teleport if `generation` is still active.
    fn resolve_generation(
        &self,
        generation: u64,
        phase: TeleportPhase,
        result: Result<(), TeleportError>,
    ) -> bool {
        let active = {
            let mut guard = self.lock_active();
            match guard.as_ref() {
                Some(active) if active.generation == generation => guard.take(),
                _ => None,
            }
        };
        match active {
            Some(active) => {
                self.finalize(active, phase, result);
                true
            }
            None => false,
        }
    }

    /// Terminal transition. Runs once per teleport, after the session has
    /// been taken out of `active`.
    fn finalize(
        &self,
        mut active: ActiveTeleport,
        phase: TeleportPhase,
        result: Result<(), TeleportError>,
    ) {
        active.stop.take();
        if result.is_err() {
            if let Some(destination) = active.destination.take() {
                if !destination.is_current() {
                    self.registry.disconnect(&destination);
                }
            }
        }
        *self.last_phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;

        let (status, message) = match &result {
            Ok(()) => (TeleportStatus::Finished, "Teleport finished".to_string()),
            Err(e) => (TeleportStatus::Failed, e.to_string()),
        };
        match &result {
            Ok(()) => log::info!("Teleport {} finished", active.generation),
            Err(e) => log::warn!("Teleport {} failed: {}", active.generation, e),
        }

        active.session.phase = phase;
        active.session.status_message = message.clone();
        active.session.result = Some(result.clone());

        self.notify(&TeleportUpdate {
            phase,
            status,
            message: message.clone(),
        });
        active.sink.deliver(TeleportOutcome {
            circuit: self.registry.current(),
            message,
            status,
            phase,
            error: result.err(),
        });
    }

    fn notify(&self, update: &TeleportUpdate) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(update);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveTeleport>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_finish(message: &Message) -> anyhow::Result<(SocketAddr, u32, u64)> {
    let info = message.block("Info")?;
    let ip = info.ip_addr("SimIP")?;
    let port = info.ip_port("SimPort")?;
    if port == 0 {
        anyhow::bail!("destination port is zero");
    }
    Ok((
        SocketAddr::V4(SocketAddrV4::new(ip, port)),
        info.u32("CircuitCode")?,
        info.u64("RegionHandle")?,
    ))
}

fn lure_request(identity: AgentIdentity, lure_id: Uuid) -> Message {
    Message::new(MessageType::TeleportLureRequest).with_block(
        Block::new("Info")
            .with("AgentID", FieldValue::Uuid(identity.agent_id))
            .with("SessionID", FieldValue::Uuid(identity.session_id))
            .with("LureID", FieldValue::Uuid(lure_id))
            .with("TeleportFlags", FieldValue::U32(TELEPORT_FLAGS_VIA_LURE)),
    )
}

fn lure_reply(identity: AgentIdentity, agent: &AgentState, requester: Uuid, dialog: u8) -> Message {
    Message::new(MessageType::ImprovedInstantMessage)
        .with_block(identity.agent_data())
        .with_block(
            Block::new("MessageBlock")
                .with("FromGroup", FieldValue::Bool(false))
                .with("ToAgentID", FieldValue::Uuid(requester))
                .with("ParentEstateID", FieldValue::U32(0))
                .with("RegionID", FieldValue::Uuid(Uuid::nil()))
                .with("Position", FieldValue::Vector3(agent.position))
                .with("Offline", FieldValue::U8(0))
                .with("Dialog", FieldValue::U8(dialog))
                .with("ID", FieldValue::Uuid(identity.agent_id))
                .with("Timestamp", FieldValue::U32(0))
                .with("FromAgentName", FieldValue::text(&agent.name))
                .with("Message", FieldValue::text(""))
                .with("BinaryBucket", FieldValue::Bytes(Vec::new())),
        )
}
