#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glam::Vec3;
use gridlink::{Block, ClientConfig, FieldValue, Message, MessageType, Packet};
use uuid::Uuid;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Short timers so retransmission and deadlines play out in tests.
pub fn fast_config() -> ClientConfig {
    ClientConfig {
        resend_interval_ms: 20,
        resend_timeout_ms: 100,
        max_resends: 2,
        ack_flush_delay_ms: 10,
        connect_timeout_ms: 1000,
        teleport_timeout_ms: 1500,
        resolve_attempts: 3,
        resolve_backoff_ms: 20,
        previous_circuit_linger_ms: 200,
        recv_poll_ms: 10,
        ..ClientConfig::default()
    }
}

pub fn wait_until(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(timeout_ms) {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// An address nothing is listening on.
pub fn closed_port() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

type Responder = Box<dyn Fn(&Packet) -> Vec<Message> + Send>;

struct SimInner {
    socket: UdpSocket,
    running: AtomicBool,
    auto_ack: AtomicBool,
    client: Mutex<Option<SocketAddr>>,
    sequence: AtomicU32,
    received: Mutex<Vec<Packet>>,
    responders: Mutex<HashMap<MessageType, Responder>>,
}

impl SimInner {
    fn run(&self) {
        let mut buf = [0u8; 4096];
        while self.running.load(Ordering::SeqCst) {
            let (size, from) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => continue,
            };
            *self.client.lock().unwrap() = Some(from);
            let Ok(packet) = Packet::deserialize(&buf[..size]) else {
                continue;
            };

            let responses = self
                .responders
                .lock()
                .unwrap()
                .get(&packet.message.kind)
                .map(|respond| respond(&packet))
                .unwrap_or_default();
            let ack = packet.is_reliable() && self.auto_ack.load(Ordering::SeqCst);
            let sequence = packet.sequence();
            // Logged before acking so the client never sees an ack for a
            // packet the log does not hold yet.
            self.received.lock().unwrap().push(packet);
            if ack {
                self.send_message(ack_message(&[sequence]));
            }
            for message in responses {
                self.send_message(message);
            }
        }
    }

    fn send_message(&self, message: Message) -> u32 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let data = Packet::new(sequence, message).serialize().unwrap();
        self.send_raw(&data);
        sequence
    }

    fn send_raw(&self, data: &[u8]) {
        if let Some(addr) = *self.client.lock().unwrap() {
            let _ = self.socket.send_to(data, addr);
        }
    }
}

/// Scripted simulator on a loopback socket. Acks reliable frames unless told
/// otherwise and answers registered message types with canned replies.
pub struct FakeSimulator {
    inner: Arc<SimInner>,
    handle: Option<JoinHandle<()>>,
}

impl FakeSimulator {
    pub fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(5)))
            .unwrap();
        let inner = Arc::new(SimInner {
            socket,
            running: AtomicBool::new(true),
            auto_ack: AtomicBool::new(true),
            client: Mutex::new(None),
            sequence: AtomicU32::new(1),
            received: Mutex::new(Vec::new()),
            responders: Mutex::new(HashMap::new()),
        });
        let runner = Arc::clone(&inner);
        let handle = thread::spawn(move || runner.run());
        Self {
            inner,
            handle: Some(handle),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.socket.local_addr().unwrap()
    }

    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_client(&self, addr: SocketAddr) {
        *self.inner.client.lock().unwrap() = Some(addr);
    }

    pub fn respond<F>(&self, kind: MessageType, respond: F)
    where
        F: Fn(&Packet) -> Vec<Message> + Send + 'static,
    {
        self.inner
            .responders
            .lock()
            .unwrap()
            .insert(kind, Box::new(respond));
    }

    /// Sends with a fresh sequence number and returns it.
    pub fn send(&self, message: Message) -> u32 {
        self.inner.send_message(message)
    }

    pub fn send_packet(&self, packet: &Packet) {
        self.inner.send_raw(&packet.serialize().unwrap());
    }

    pub fn send_raw(&self, data: &[u8]) {
        self.inner.send_raw(data);
    }

    pub fn received(&self, kind: MessageType) -> Vec<Packet> {
        self.inner
            .received
            .lock()
            .unwrap()
            .iter()
            .filter(|packet| packet.message.kind == kind)
            .cloned()
            .collect()
    }

    pub fn wait_for(&self, kind: MessageType, count: usize, timeout_ms: u64) -> Vec<Packet> {
        wait_until(timeout_ms, || self.received(kind).len() >= count);
        self.received(kind)
    }

    /// Every sequence number the client has acked, appended or standalone,
    /// in arrival order and with repeats.
    pub fn acks_received(&self) -> Vec<u32> {
        let received = self.inner.received.lock().unwrap();
        let mut acks = Vec::new();
        for packet in received.iter() {
            acks.extend_from_slice(&packet.acks);
            if packet.message.kind == MessageType::PacketAck {
                acks.extend(
                    packet
                        .message
                        .blocks_named("Packets")
                        .map(|block| block.u32("ID").unwrap()),
                );
            }
        }
        acks
    }
}

impl Drop for FakeSimulator {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn reliable(mut message: Message) -> Message {
    message.reliable = true;
    message
}

pub fn ack_message(sequences: &[u32]) -> Message {
    sequences.iter().fold(Message::new(MessageType::PacketAck), |message, &id| {
        message.with_block(Block::new("Packets").with("ID", FieldValue::U32(id)))
    })
}

pub fn chat(text: &str) -> Message {
    Message::new(MessageType::ChatFromSimulator).with_block(
        Block::new("ChatData")
            .with("FromName", FieldValue::text("Ruth"))
            .with("SourceID", FieldValue::Uuid(Uuid::new_v4()))
            .with("OwnerID", FieldValue::Uuid(Uuid::nil()))
            .with("SourceType", FieldValue::U8(1))
            .with("ChatType", FieldValue::U8(1))
            .with("Audible", FieldValue::U8(1))
            .with("Position", FieldValue::Vector3(Vec3::new(128.0, 128.0, 20.0)))
            .with("Message", FieldValue::text(text)),
    )
}

pub fn viewer_chat(text: &str) -> Message {
    Message::new(MessageType::ChatFromViewer)
        .with_block(
            Block::new("AgentData")
                .with("AgentID", FieldValue::Uuid(Uuid::new_v4()))
                .with("SessionID", FieldValue::Uuid(Uuid::new_v4())),
        )
        .with_block(
            Block::new("ChatData")
                .with("Message", FieldValue::text(text))
                .with("Type", FieldValue::U8(1))
                .with("Channel", FieldValue::I32(0)),
        )
}

pub fn teleport_start() -> Message {
    reliable(Message::new(MessageType::TeleportStart))
}

pub fn teleport_progress(text: &str) -> Message {
    reliable(
        Message::new(MessageType::TeleportProgress)
            .with_block(Block::new("Info").with("Message", FieldValue::text(text))),
    )
}

pub fn teleport_failed(reason: &str) -> Message {
    reliable(
        Message::new(MessageType::TeleportFailed)
            .with_block(Block::new("Info").with("Reason", FieldValue::text(reason))),
    )
}

pub fn teleport_finish(destination: SocketAddr, circuit_code: u32) -> Message {
    let ip = match destination {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(_) => Ipv4Addr::LOCALHOST,
    };
    reliable(
        Message::new(MessageType::TeleportFinish).with_block(
            Block::new("Info")
                .with("AgentID", FieldValue::Uuid(Uuid::nil()))
                .with("SimIP", FieldValue::IpAddr(ip))
                .with("SimPort", FieldValue::IpPort(destination.port()))
                .with("RegionHandle", FieldValue::U64(gridlink::region_handle_for_cell(1000, 1000)))
                .with("CircuitCode", FieldValue::U32(circuit_code)),
        ),
    )
}
