mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{FakeSimulator, chat, fast_config, reliable, viewer_chat, wait_until};
use gridlink::{
    AgentIdentity, Block, CallbackDispatcher, Circuit, ClientConfig, CloseReason, DeliveryOutcome,
    FieldValue, Message, MessageType, Packet, PacketLossSimulation, ReliableTransport, SendError,
    TransportEvent,
};

struct Harness {
    sim: FakeSimulator,
    transport: ReliableTransport,
    dispatcher: Arc<CallbackDispatcher>,
    circuit: Arc<Circuit>,
}

impl Harness {
    fn new(config: ClientConfig) -> Self {
        common::init_logger();
        let sim = FakeSimulator::start();
        let dispatcher = Arc::new(CallbackDispatcher::new());
        let transport = ReliableTransport::new(config, Arc::clone(&dispatcher));
        let circuit = transport
            .open_circuit(sim.addr(), 1, AgentIdentity::random())
            .unwrap();
        sim.set_client(circuit.local_addr());
        Self {
            sim,
            transport,
            dispatcher,
            circuit,
        }
    }

    /// Collects the text of every ChatFromSimulator dispatched.
    fn record_chat(&self) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        self.dispatcher
            .register(MessageType::ChatFromSimulator, move |message, _| {
                let text = message.block("ChatData")?.string("Message")?;
                sink.lock().unwrap().push(text);
                Ok(())
            });
        seen
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.transport.shutdown();
    }
}

#[test]
fn test_reliable_send_is_acked() {
    let h = Harness::new(fast_config());

    let sequence = h
        .transport
        .send(&h.circuit, viewer_chat("hello"), true)
        .unwrap();

    let frames = h.sim.wait_for(MessageType::ChatFromViewer, 1, 500);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].sequence(), sequence);
    assert!(frames[0].is_reliable());
    assert!(!frames[0].is_resent());

    assert!(wait_until(500, || h.circuit.pending_acks() == 0));
    let stats = h.circuit.stats();
    assert!(stats.packets_sent >= 1);
    assert_eq!(stats.packets_resent, 0);
}

#[test]
fn test_sequence_numbers_increase_per_send() {
    let h = Harness::new(fast_config());

    let first = h.transport.send(&h.circuit, viewer_chat("a"), false).unwrap();
    let second = h.transport.send(&h.circuit, viewer_chat("b"), true).unwrap();
    assert_eq!(second, first + 1);
}

#[test]
fn test_unacked_send_is_resent_then_reported() {
    let h = Harness::new(fast_config());
    h.sim.set_auto_ack(false);

    let ticket = h
        .transport
        .send_tracked(&h.circuit, viewer_chat("anyone there?"))
        .unwrap();

    match ticket.wait(Duration::from_secs(3)) {
        Some(DeliveryOutcome::Failed(failure)) => {
            assert_eq!(failure.sequence, ticket.sequence());
            assert_eq!(failure.kind, MessageType::ChatFromViewer);
            assert_eq!(failure.attempts, 3);
            assert_eq!(failure.circuit, h.circuit.id());
        }
        other => panic!("expected delivery failure, got {other:?}"),
    }

    let frames = h.sim.received(MessageType::ChatFromViewer);
    assert_eq!(frames.len(), 3);
    assert!(!frames[0].is_resent());
    for frame in &frames[1..] {
        assert!(frame.is_resent());
        assert_eq!(frame.sequence(), ticket.sequence());
    }
    assert_eq!(h.circuit.pending_acks(), 0);
    assert_eq!(h.circuit.stats().packets_resent, 2);

    let mut events = Vec::new();
    assert!(wait_until(500, || {
        events.extend(h.transport.drain_events());
        events.iter().any(|event| {
            matches!(event, TransportEvent::DeliveryFailed(f) if f.sequence == ticket.sequence())
        })
    }));
}

#[test]
fn test_late_ack_after_resend_clears_pending() {
    let h = Harness::new(fast_config());
    h.sim.set_auto_ack(false);

    let ticket = h
        .transport
        .send_tracked(&h.circuit, viewer_chat("slow peer"))
        .unwrap();
    let frames = h.sim.wait_for(MessageType::ChatFromViewer, 2, 500);
    assert!(frames[1].is_resent());

    h.sim.send(common::ack_message(&[ticket.sequence()]));
    assert_eq!(
        ticket.wait(Duration::from_secs(1)),
        Some(DeliveryOutcome::Acked)
    );
    assert_eq!(h.circuit.pending_acks(), 0);
}

#[test]
fn test_duplicate_dispatched_once_acked_twice() {
    let h = Harness::new(fast_config());
    let seen = h.record_chat();

    let packet = Packet::new(500, reliable(chat("only once")));
    h.sim.send_packet(&packet);
    h.sim.send_packet(&packet);

    assert!(wait_until(1000, || {
        h.sim.acks_received().iter().filter(|&&s| s == 500).count() >= 2
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(*seen.lock().unwrap(), vec!["only once".to_string()]);
    assert_eq!(h.circuit.stats().duplicates_received, 1);
}

#[test]
fn test_out_of_order_frames_are_dispatched_as_they_arrive() {
    let h = Harness::new(fast_config());
    let seen = h.record_chat();

    h.sim.send_packet(&Packet::new(10, chat("ten")));
    assert!(wait_until(500, || seen.lock().unwrap().len() == 1));
    h.sim.send_packet(&Packet::new(7, chat("seven")));
    assert!(wait_until(500, || seen.lock().unwrap().len() == 2));

    assert_eq!(*seen.lock().unwrap(), vec!["ten", "seven"]);
}

#[test]
fn test_ping_is_answered() {
    let h = Harness::new(fast_config());

    h.sim.send(
        Message::new(MessageType::StartPingCheck).with_block(
            Block::new("PingID")
                .with("PingID", FieldValue::U8(7))
                .with("OldestUnacked", FieldValue::U32(0)),
        ),
    );

    let replies = h.sim.wait_for(MessageType::CompletePingCheck, 1, 500);
    assert_eq!(replies.len(), 1);
    let ping_id = replies[0].message.block("PingID").unwrap().u8("PingID").unwrap();
    assert_eq!(ping_id, 7);
}

#[test]
fn test_peer_close() {
    let h = Harness::new(fast_config());

    h.sim.send(Message::new(MessageType::CloseCircuit));
    assert!(wait_until(500, || !h.circuit.is_alive()));

    let events = h.transport.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        TransportEvent::CircuitClosed { reason: CloseReason::PeerClosed, circuit, .. }
            if *circuit == h.circuit.id()
    )));
    assert!(matches!(
        h.transport.send(&h.circuit, viewer_chat("gone"), false),
        Err(SendError::CircuitClosed(_))
    ));
    assert!(h.transport.circuit(h.circuit.id()).is_none());
}

#[test]
fn test_garbage_is_dropped() {
    let h = Harness::new(fast_config());
    let seen = h.record_chat();

    h.sim.send_raw(&[0xFF; 3]);
    // unknown Low message 0x7F00
    h.sim.send_raw(&[0x00, 0, 0, 0, 1, 0xFF, 0xFF, 0x7F, 0x00]);
    // zero-coded body with an empty zero run
    h.sim.send_raw(&[0x04, 0, 0, 0, 2, 0xFF, 0x00, 0x00]);
    h.sim.send(chat("still here"));

    assert!(wait_until(500, || seen.lock().unwrap().len() == 1));
    assert_eq!(seen.lock().unwrap()[0], "still here");
    assert!(h.circuit.is_alive());
    assert_eq!(h.circuit.stats().malformed_received, 3);
}

#[test]
fn test_acks_piggyback_on_next_send() {
    let h = Harness::new(ClientConfig {
        ack_flush_delay_ms: 10_000,
        ..fast_config()
    });
    let seen = h.record_chat();

    let sequence = h.sim.send(reliable(chat("ack me")));
    assert!(wait_until(500, || seen.lock().unwrap().len() == 1));

    h.transport
        .send(&h.circuit, viewer_chat("reply"), false)
        .unwrap();
    let frames = h.sim.wait_for(MessageType::ChatFromViewer, 1, 500);
    assert_eq!(frames[0].acks, vec![sequence]);
}

#[test]
fn test_handler_failure_does_not_stop_receive_loop() {
    let h = Harness::new(fast_config());
    let calls = Arc::new(AtomicUsize::new(0));

    h.dispatcher
        .register(MessageType::ChatFromSimulator, |_, _| anyhow::bail!("broken handler"));
    h.dispatcher
        .register(MessageType::ChatFromSimulator, |_, _| panic!("worse handler"));
    let counter = Arc::clone(&calls);
    h.dispatcher
        .register(MessageType::ChatFromSimulator, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

    h.sim.send(chat("one"));
    h.sim.send(chat("two"));
    assert!(wait_until(500, || calls.load(Ordering::SeqCst) == 2));
    assert!(h.circuit.is_alive());
}

#[test]
fn test_simulated_loss_drops_outbound() {
    let h = Harness::new(ClientConfig {
        loss_simulation: Some(PacketLossSimulation::new(100.0)),
        ..fast_config()
    });

    h.transport
        .send(&h.circuit, viewer_chat("lost"), false)
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(h.sim.received(MessageType::ChatFromViewer).is_empty());
    assert_eq!(h.circuit.stats().packets_dropped, 1);
}

#[test]
fn test_shutdown_closes_circuits() {
    let h = Harness::new(fast_config());

    h.transport.shutdown();
    assert!(!h.circuit.is_alive());
    assert!(!h.transport.is_running());
    assert!(h.transport.circuits().is_empty());
    assert!(
        h.transport
            .open_circuit(h.sim.addr(), 2, AgentIdentity::random())
            .is_err()
    );
}
