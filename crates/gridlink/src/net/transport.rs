use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::circuit::{Circuit, CircuitId, CircuitState, CloseReason};
use super::message::{Block, FieldValue, Message};
use super::protocol::{MAX_APPENDED_ACKS, MAX_PACKET_SIZE, Packet, RECV_BUFFER_SIZE};
use super::stats::PacketLossSimulation;
use super::template::MessageType;
use super::tracking::{DeliveryOutcome, PendingAck, TrackError};
use crate::agent::AgentIdentity;
use crate::config::ClientConfig;
use crate::dispatch::CallbackDispatcher;
use crate::error::{DeliveryFailure, SendError};

#[derive(Debug, Clone)]
pub enum TransportEvent {
    CircuitClosed {
        circuit: CircuitId,
        remote: SocketAddr,
        reason: CloseReason,
    },
    DeliveryFailed(DeliveryFailure),
}

/// Resolves once the peer acks a reliable send, or it is given up on.
#[derive(Debug)]
pub struct DeliveryTicket {
    sequence: u32,
    rx: Receiver<DeliveryOutcome>,
}

impl DeliveryTicket {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Blocks up to `timeout`. `None` means no outcome yet.
    pub fn wait(&self, timeout: Duration) -> Option<DeliveryOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                Some(DeliveryOutcome::Closed(CloseReason::Shutdown))
            }
        }
    }
}

struct TransportInner {
    config: ClientConfig,
    dispatcher: Arc<CallbackDispatcher>,
    circuits: RwLock<HashMap<CircuitId, Arc<Circuit>>>,
    events: Mutex<VecDeque<TransportEvent>>,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    loss: PacketLossSimulation,
}

/// Drives every open circuit: sequencing, acks, resends and the per-circuit
/// receive threads that feed the dispatcher.
#[derive(Clone)]
pub struct ReliableTransport {
    inner: Arc<TransportInner>,
}

impl ReliableTransport {
    pub fn new(config: ClientConfig, dispatcher: Arc<CallbackDispatcher>) -> Self {
        let loss = config.loss_simulation.clone().unwrap_or_default();
        let transport = Self {
            inner: Arc::new(TransportInner {
                config,
                dispatcher,
                circuits: RwLock::new(HashMap::new()),
                events: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(true),
                workers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                loss,
            }),
        };

        let sweeper = transport.clone();
        match thread::Builder::new()
            .name("gridlink-sweep".into())
            .spawn(move || sweeper.sweep_loop())
        {
            Ok(handle) => transport.track_worker(handle),
            Err(e) => log::error!("Failed to start resend sweep: {}", e),
        }
        transport
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.inner.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Binds a socket for `remote` and starts its receive thread. No
    /// handshake is performed here.
    pub fn open_circuit(
        &self,
        remote: SocketAddr,
        circuit_code: u32,
        identity: AgentIdentity,
    ) -> io::Result<Arc<Circuit>> {
        if !self.is_running() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is shut down",
            ));
        }

        let id = CircuitId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let circuit = Arc::new(Circuit::open(
            id,
            remote,
            circuit_code,
            identity,
            &self.inner.config,
        )?);
        self.inner
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&circuit));

        let transport = self.clone();
        let receiving = Arc::clone(&circuit);
        let handle = thread::Builder::new()
            .name(format!("gridlink-recv-{}", id.0))
            .spawn(move || transport.receive_loop(receiving));
        match handle {
            Ok(handle) => self.track_worker(handle),
            Err(e) => {
                self.close_circuit(&circuit, CloseReason::Io(e.kind()));
                return Err(e);
            }
        }

        log::info!("Opened {} from {}", circuit, circuit.local_addr());
        Ok(circuit)
    }

    pub fn circuit(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.inner
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    pub fn circuits(&self) -> Vec<Arc<Circuit>> {
        let mut circuits: Vec<_> = self
            .inner
            .circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        circuits.sort_by_key(|circuit| circuit.id());
        circuits
    }

    /// Sends `message` on `circuit` and returns its sequence number. Reliable
    /// sends are retransmitted by the sweep until acked or out of retries.
    pub fn send(
        &self,
        circuit: &Circuit,
        message: Message,
        reliable: bool,
    ) -> Result<u32, SendError> {
        let mut message = message;
        message.reliable = reliable;
        self.transmit(circuit, message, true, None)
    }

    /// Reliable send whose outcome can be awaited.
    pub fn send_tracked(
        &self,
        circuit: &Circuit,
        message: Message,
    ) -> Result<DeliveryTicket, SendError> {
        let mut message = message;
        message.reliable = true;
        let (tx, rx) = mpsc::channel();
        let sequence = self.transmit(circuit, message, true, Some(tx))?;
        Ok(DeliveryTicket { sequence, rx })
    }

    /// Blocking iterator over fresh inbound messages on `circuit`. Acks,
    /// dedup, pings and peer closes are handled before a message is yielded.
    /// Ends when the circuit closes or the transport shuts down.
    pub fn poll_incoming<'a>(&'a self, circuit: &'a Arc<Circuit>) -> Incoming<'a> {
        Incoming {
            transport: self,
            circuit,
            ready: VecDeque::new(),
            buf: vec![0u8; RECV_BUFFER_SIZE],
        }
    }

    /// Politely closes a circuit: tells the simulator, then closes locally.
    pub fn disconnect(&self, circuit: &Circuit) {
        if circuit.is_alive() {
            if let Err(e) = self.send(circuit, Message::new(MessageType::CloseCircuit), false) {
                log::debug!("CloseCircuit on {} not sent: {}", circuit, e);
            }
        }
        self.close_circuit(circuit, CloseReason::Requested);
    }

    /// Closes `circuit` locally. Pending reliable sends resolve as closed.
    /// Returns false if it was already closed.
    pub fn close_circuit(&self, circuit: &Circuit, reason: CloseReason) -> bool {
        if !circuit.mark_closed() {
            return false;
        }
        circuit.set_current(false);
        self.inner
            .circuits
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&circuit.id());

        let drained = circuit.lock().acks.drain();
        for mut pending in drained {
            pending.notify(DeliveryOutcome::Closed(reason));
        }

        match reason {
            CloseReason::Requested | CloseReason::Retired | CloseReason::Shutdown => {
                log::info!("Closed {}: {}", circuit, reason);
            }
            CloseReason::SequenceCorrupted => {
                log::error!("Closed {}: {}", circuit, reason);
            }
            _ => log::warn!("Closed {}: {}", circuit, reason),
        }
        self.push_event(TransportEvent::CircuitClosed {
            circuit: circuit.id(),
            remote: circuit.remote_addr(),
            reason,
        });
        true
    }

    /// Schedules `circuit` to be closed by the sweep after `linger`.
    pub fn retire(&self, circuit: &Circuit, linger: Duration) {
        circuit.lock().retire_at = Some(Instant::now() + linger);
        log::debug!("{} retires in {:?}", circuit, linger);
    }

    /// Cancels a pending `retire`.
    pub fn unretire(&self, circuit: &Circuit) {
        if circuit.lock().retire_at.take().is_some() {
            log::debug!("{} no longer retiring", circuit);
        }
    }

    pub fn drain_events(&self) -> Vec<TransportEvent> {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Stops the sweep and every receive thread and closes all circuits.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        for circuit in self.circuits() {
            self.close_circuit(&circuit, CloseReason::Shutdown);
        }

        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let me = thread::current().id();
        for handle in workers {
            // shutdown may be reached from a handler on a receive thread
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                log::warn!("Transport worker panicked during shutdown");
            }
        }
    }

    fn track_worker(&self, handle: JoinHandle<()>) {
        let mut workers = self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
    }

    fn push_event(&self, event: TransportEvent) {
        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    fn transmit(
        &self,
        circuit: &Circuit,
        message: Message,
        piggyback: bool,
        ticket: Option<mpsc::Sender<DeliveryOutcome>>,
    ) -> Result<u32, SendError> {
        if !circuit.is_alive() {
            return Err(SendError::CircuitClosed(circuit.id()));
        }
        let mut state = circuit.lock();
        let result = self.transmit_locked(circuit, &mut state, message, piggyback, ticket);
        drop(state);

        if let Err(SendError::SequenceCorrupted(sequence)) = &result {
            log::error!("Sequence {} reused on {} while still pending", sequence, circuit);
            self.close_circuit(circuit, CloseReason::SequenceCorrupted);
        }
        if let Err(SendError::Io(e)) = &result {
            if e.kind() == io::ErrorKind::ConnectionRefused {
                self.close_circuit(circuit, CloseReason::Refused);
            }
        }
        result
    }

    /// Encodes, sequences and sends one message. The sequence is consumed
    /// only once the frame is known to encode.
    fn transmit_locked(
        &self,
        circuit: &Circuit,
        state: &mut CircuitState,
        message: Message,
        piggyback: bool,
        ticket: Option<mpsc::Sender<DeliveryOutcome>>,
    ) -> Result<u32, SendError> {
        let sequence = state.peek_sequence();
        let reliable = message.reliable;
        let packet = Packet::new(sequence, message);
        let frame = packet.serialize()?;
        if frame.len() > MAX_PACKET_SIZE {
            return Err(SendError::TooLarge(frame.len()));
        }

        if reliable {
            let now = Instant::now();
            state
                .acks
                .track(PendingAck {
                    sequence,
                    message: packet.message.clone(),
                    frame: frame.clone(),
                    first_sent: now,
                    last_sent: now,
                    retries: 0,
                    ticket,
                })
                .map_err(|e| match e {
                    TrackError::Collision(seq) => SendError::SequenceCorrupted(seq),
                    TrackError::Backlog(n) => SendError::Backlog(n),
                })?;
        }
        state.commit_sequence();

        let room = (MAX_PACKET_SIZE - frame.len()).saturating_sub(1) / 4;
        let limit = room
            .min(self.inner.config.max_appended_acks)
            .min(MAX_APPENDED_ACKS);
        let data = if piggyback && limit > 0 && !state.outbound_acks.is_empty() {
            let acks = state.outbound_acks.take(limit);
            state.stats.acks_sent += acks.len() as u64;
            packet.with_acks(acks).serialize()?
        } else {
            frame
        };

        self.write_frame(circuit, state, &data)?;
        Ok(sequence)
    }

    fn write_frame(
        &self,
        circuit: &Circuit,
        state: &mut CircuitState,
        data: &[u8],
    ) -> io::Result<()> {
        state.stats.record_send(data.len());
        if self.inner.loss.should_drop() {
            state.stats.packets_dropped += 1;
            log::trace!("Simulated loss of {} bytes on {}", data.len(), circuit);
            return Ok(());
        }
        circuit.socket().send(data)?;
        Ok(())
    }

    /// Processes one inbound datagram and returns the messages to dispatch.
    fn handle_datagram(&self, circuit: &Circuit, data: &[u8]) -> Vec<Message> {
        let packet = match Packet::deserialize(data) {
            Ok(packet) => packet,
            Err(e) => {
                circuit.lock().stats.malformed_received += 1;
                log::debug!("Dropped {}-byte frame on {}: {}", data.len(), circuit, e);
                return Vec::new();
            }
        };

        let now = Instant::now();
        let mut state = circuit.lock();
        state.stats.record_receive(data.len());
        state.last_receive = now;

        for &sequence in &packet.acks {
            self.complete(circuit, &mut state, sequence, now);
        }
        if packet.message.kind == MessageType::PacketAck {
            for block in packet.message.blocks_named("Packets") {
                if let Ok(sequence) = block.u32("ID") {
                    self.complete(circuit, &mut state, sequence, now);
                }
            }
        }

        let sequence = packet.sequence();
        if packet.is_reliable() {
            // Ack duplicates too; our earlier ack may have been lost.
            state.outbound_acks.push(sequence, now);
        }
        if !state.seen.record_received(sequence) {
            state.stats.duplicates_received += 1;
            log::debug!("Duplicate {} #{} on {}", packet.message, sequence, circuit);
            return Vec::new();
        }

        let message = packet.message;
        match message.kind {
            MessageType::PacketAck => Vec::new(),
            MessageType::StartPingCheck => {
                if let Ok(ping_id) = message.block("PingID").and_then(|b| b.u8("PingID")) {
                    let reply = Message::new(MessageType::CompletePingCheck)
                        .with_block(Block::new("PingID").with("PingID", FieldValue::U8(ping_id)));
                    if let Err(e) = self.transmit_locked(circuit, &mut state, reply, true, None) {
                        log::debug!("Ping reply on {} failed: {}", circuit, e);
                    }
                }
                vec![message]
            }
            MessageType::CloseCircuit => {
                drop(state);
                self.close_circuit(circuit, CloseReason::PeerClosed);
                Vec::new()
            }
            _ => vec![message],
        }
    }

    fn complete(&self, circuit: &Circuit, state: &mut CircuitState, sequence: u32, now: Instant) {
        match state.acks.acknowledge(sequence, now) {
            Some(mut pending) => {
                state.stats.rtt_ms = state.acks.srtt();
                state.stats.rtt_variance = state.acks.rtt_var();
                pending.notify(DeliveryOutcome::Acked);
            }
            None => log::trace!("Ack for unknown #{} on {}", sequence, circuit),
        }
    }

    fn receive_loop(self, circuit: Arc<Circuit>) {
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        for message in self.poll_incoming(&circuit) {
            dispatcher.dispatch(&message, &circuit);
        }
        log::debug!("Receive loop for {} stopped", circuit);
    }

    fn sweep_loop(self) {
        let interval = self.inner.config.resend_interval();
        while self.is_running() {
            thread::sleep(interval);
            let now = Instant::now();
            for circuit in self.circuits() {
                self.service(&circuit, now);
            }
        }
    }

    /// One sweep over a circuit: retirement, inactivity, resends and acks.
    fn service(&self, circuit: &Circuit, now: Instant) {
        let config = &self.inner.config;
        let mut state = circuit.lock();

        if state.retire_at.is_some_and(|at| at <= now) {
            drop(state);
            self.close_circuit(circuit, CloseReason::Retired);
            return;
        }
        if now.duration_since(state.last_receive) > config.circuit_timeout() {
            drop(state);
            self.close_circuit(circuit, CloseReason::TimedOut);
            return;
        }

        let (resends, expired) =
            state
                .acks
                .collect_resends(now, config.resend_timeout(), config.max_resends);
        let mut write_error = None;
        for (sequence, frame) in resends {
            log::debug!("Resending #{} on {}", sequence, circuit);
            state.stats.packets_resent += 1;
            if let Err(e) = self.write_frame(circuit, &mut state, &frame) {
                write_error = Some(e);
                break;
            }
        }

        let mut failures = Vec::with_capacity(expired.len());
        for mut pending in expired {
            let failure = DeliveryFailure {
                circuit: circuit.id(),
                sequence: pending.sequence,
                kind: pending.message.kind,
                attempts: pending.attempts(),
            };
            state.stats.delivery_failures += 1;
            pending.notify(DeliveryOutcome::Failed(failure.clone()));
            failures.push(failure);
        }

        if write_error.is_none()
            && state
                .outbound_acks
                .is_due(now, config.ack_flush_delay(), config.max_appended_acks)
        {
            let acks = state.outbound_acks.take(MAX_APPENDED_ACKS);
            let mut message = Message::new(MessageType::PacketAck);
            for sequence in &acks {
                message = message
                    .with_block(Block::new("Packets").with("ID", FieldValue::U32(*sequence)));
            }
            state.stats.acks_sent += acks.len() as u64;
            if let Err(e) = self.transmit_locked(circuit, &mut state, message, false, None) {
                log::debug!("Ack flush on {} failed: {}", circuit, e);
            }
        }
        drop(state);

        for failure in failures {
            log::warn!("Delivery failed: {}", failure);
            self.push_event(TransportEvent::DeliveryFailed(failure));
        }
        if let Some(e) = write_error {
            let reason = match e.kind() {
                io::ErrorKind::ConnectionRefused => CloseReason::Refused,
                kind => CloseReason::Io(kind),
            };
            self.close_circuit(circuit, reason);
        }
    }
}

/// Iterator returned by [`ReliableTransport::poll_incoming`].
pub struct Incoming<'a> {
    transport: &'a ReliableTransport,
    circuit: &'a Arc<Circuit>,
    ready: VecDeque<Message>,
    buf: Vec<u8>,
}

impl Iterator for Incoming<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        loop {
            if let Some(message) = self.ready.pop_front() {
                return Some(message);
            }
            if !self.circuit.is_alive() || !self.transport.is_running() {
                return None;
            }

            match self.circuit.socket().recv(&mut self.buf) {
                Ok(size) => {
                    let messages = self.transport.handle_datagram(self.circuit, &self.buf[..size]);
                    self.ready.extend(messages);
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted
                    ) => {}
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    self.transport.close_circuit(self.circuit, CloseReason::Refused);
                    return None;
                }
                Err(e) => {
                    self.transport
                        .close_circuit(self.circuit, CloseReason::Io(e.kind()));
                    return None;
                }
            }
        }
    }
}
