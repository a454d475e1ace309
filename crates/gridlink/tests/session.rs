mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{FakeSimulator, closed_port, fast_config, reliable, wait_until};
use glam::Vec3;
use gridlink::{
    AgentIdentity, Block, CloseReason, ConnectError, FieldValue, Message, MessageType,
    RegionDirectory, Session, TransportEvent,
};
use uuid::Uuid;

fn new_session() -> Session {
    common::init_logger();
    Session::new(
        fast_config(),
        AgentIdentity::random(),
        Arc::new(RegionDirectory::new()),
    )
}

#[test]
fn test_login_handshake() {
    let sim = FakeSimulator::start();
    let session = new_session();
    let identity = session.identity();

    let circuit = session.login(sim.addr(), 777).unwrap();
    assert!(circuit.is_current());
    assert_eq!(session.current_circuit().unwrap().id(), circuit.id());
    assert_eq!(circuit.circuit_code(), 777);

    let handshake = &sim.received(MessageType::UseCircuitCode)[0];
    assert!(handshake.is_reliable());
    let block = handshake.message.block("CircuitCode").unwrap();
    assert_eq!(block.u32("Code").unwrap(), 777);
    assert_eq!(block.uuid("ID").unwrap(), identity.agent_id);
    assert_eq!(block.uuid("SessionID").unwrap(), identity.session_id);

    let complete = sim.wait_for(MessageType::CompleteAgentMovement, 1, 500);
    assert_eq!(complete.len(), 1);
    assert!(complete[0].is_reliable());
    assert!(wait_until(500, || circuit.pending_acks() == 0));
}

#[test]
fn test_agent_state_follows_simulator() {
    let sim = FakeSimulator::start();
    let session = new_session();
    let identity = session.identity();
    session.login(sim.addr(), 1).unwrap();

    sim.send(reliable(
        Message::new(MessageType::AgentMovementComplete)
            .with_block(identity.agent_data())
            .with_block(
                Block::new("Data")
                    .with("Position", FieldValue::Vector3(Vec3::new(10.0, 20.0, 30.0)))
                    .with("LookAt", FieldValue::Vector3(Vec3::X))
                    .with("RegionHandle", FieldValue::U64(0xABCD))
                    .with("Timestamp", FieldValue::U32(0)),
            ),
    ));
    sim.send(
        Message::new(MessageType::HealthMessage)
            .with_block(Block::new("HealthData").with("Health", FieldValue::F32(87.5))),
    );
    sim.send(
        Message::new(MessageType::MoneyBalanceReply).with_block(
            Block::new("MoneyData")
                .with("AgentID", FieldValue::Uuid(identity.agent_id))
                .with("TransactionID", FieldValue::Uuid(Uuid::nil()))
                .with("TransactionSuccess", FieldValue::Bool(true))
                .with("MoneyBalance", FieldValue::I32(1250))
                .with("SquareMetersCredit", FieldValue::I32(0))
                .with("SquareMetersCommitted", FieldValue::I32(0))
                .with("Description", FieldValue::text("")),
        ),
    );

    assert!(wait_until(1000, || session.agent_state().balance.is_some()));
    let state = session.agent_state();
    assert_eq!(state.position, Vec3::new(10.0, 20.0, 30.0));
    assert_eq!(state.look_at, Vec3::X);
    assert_eq!(state.region_handle, Some(0xABCD));
    assert_eq!(state.health, Some(87.5));
    assert_eq!(state.balance, Some(1250));
}

#[test]
fn test_balance_follows_summary_and_adjustments() {
    let sim = FakeSimulator::start();
    let session = new_session();
    let identity = session.identity();
    session.login(sim.addr(), 1).unwrap();

    let adjust = |delta| {
        reliable(
            Message::new(MessageType::AdjustBalance).with_block(
                Block::new("AgentData")
                    .with("AgentID", FieldValue::Uuid(identity.agent_id))
                    .with("Delta", FieldValue::I32(delta)),
            ),
        )
    };

    sim.send(
        Message::new(MessageType::MoneySummaryReply).with_block(
            Block::new("MoneyData")
                .with("RequestID", FieldValue::Uuid(Uuid::new_v4()))
                .with("AgentID", FieldValue::Uuid(identity.agent_id))
                .with("Balance", FieldValue::I32(500))
                .with("SquareMetersCredit", FieldValue::I32(0))
                .with("SquareMetersCommitted", FieldValue::I32(0))
                .with("CashFlowIn", FieldValue::I32(0))
                .with("CashFlowOut", FieldValue::I32(0))
                .with("CashFlowTotal", FieldValue::I32(0))
                .with("StartDate", FieldValue::text(""))
                .with("EndDate", FieldValue::text("")),
        ),
    );
    assert!(wait_until(1000, || session.agent_state().balance == Some(500)));

    sim.send(adjust(-120));
    assert!(wait_until(1000, || session.agent_state().balance == Some(380)));
    sim.send(adjust(20));
    assert!(wait_until(1000, || session.agent_state().balance == Some(400)));
}

#[test]
fn test_logout_closes_everything() {
    let sim = FakeSimulator::start();
    let session = new_session();
    session.login(sim.addr(), 1).unwrap();

    session.logout();

    let logout = sim.wait_for(MessageType::LogoutRequest, 1, 500);
    assert_eq!(
        logout[0].message.block("AgentData").unwrap().uuid("AgentID").unwrap(),
        session.identity().agent_id
    );
    assert_eq!(sim.wait_for(MessageType::CloseCircuit, 1, 500).len(), 1);
    assert!(!session.transport().is_running());
    assert!(session.current_circuit().is_none());
    assert!(session.registry().circuits().is_empty());
    assert!(session.login(sim.addr(), 2).is_err());
}

#[test]
fn test_login_times_out_without_ack() {
    let sim = FakeSimulator::start();
    sim.set_auto_ack(false);
    let session = new_session();

    let err = session.login(sim.addr(), 1).unwrap_err();
    assert!(matches!(err, ConnectError::Timeout), "{err:?}");
    assert!(session.current_circuit().is_none());
    assert!(session.registry().circuits().is_empty());
}

#[test]
fn test_login_to_closed_port_fails() {
    let session = new_session();
    let err = session.login(closed_port(), 1).unwrap_err();
    assert!(
        matches!(err, ConnectError::Refused(_) | ConnectError::Timeout),
        "{err:?}"
    );
    assert!(session.current_circuit().is_none());
}

#[test]
fn test_promote_retires_previous_circuit() {
    let first = FakeSimulator::start();
    let second = FakeSimulator::start();
    let session = new_session();
    let registry = session.registry();

    let a = registry.connect(first.addr(), 1).unwrap();
    let b = registry.connect(second.addr(), 2).unwrap();
    assert!(registry.current().is_none());
    assert_eq!(registry.neighbors().len(), 2);

    assert!(registry.promote(&a).unwrap().is_none());
    // Promoting the current circuit again is a no-op.
    assert!(registry.promote(&a).unwrap().is_none());
    let previous = registry.promote(&b).unwrap().unwrap();
    assert_eq!(previous.id(), a.id());
    assert!(b.is_current());
    assert!(!a.is_current());
    assert_eq!(registry.neighbors()[0].id(), a.id());

    assert!(wait_until(1000, || !a.is_alive()));
    let retired = session.drain_events().into_iter().any(|event| {
        matches!(
            event,
            TransportEvent::CircuitClosed { circuit, reason: CloseReason::Retired, .. }
                if circuit == a.id()
        )
    });
    assert!(retired);
    assert!(registry.neighbors().is_empty());
    assert_eq!(registry.current().unwrap().id(), b.id());
}

#[test]
fn test_promoting_back_cancels_retirement() {
    let first = FakeSimulator::start();
    let second = FakeSimulator::start();
    let session = new_session();
    let registry = session.registry();

    let a = registry.connect(first.addr(), 1).unwrap();
    let b = registry.connect(second.addr(), 2).unwrap();
    registry.promote(&a).unwrap();
    registry.promote(&b).unwrap();
    let previous = registry.promote(&a).unwrap().unwrap();
    assert_eq!(previous.id(), b.id());

    // Well past the 200ms linger.
    assert!(wait_until(1000, || !b.is_alive()));
    std::thread::sleep(std::time::Duration::from_millis(300));
    assert!(a.is_alive());
    assert!(a.is_current());
    assert_eq!(registry.current().unwrap().id(), a.id());
    let a_closed = session.drain_events().into_iter().any(|event| {
        matches!(event, TransportEvent::CircuitClosed { circuit, .. } if circuit == a.id())
    });
    assert!(!a_closed);
}

#[test]
fn test_promote_rejects_closed_circuit() {
    let sim = FakeSimulator::start();
    let session = new_session();
    let circuit = session.registry().connect(sim.addr(), 1).unwrap();
    session.registry().disconnect(&circuit);

    let err = session.registry().promote(&circuit).unwrap_err();
    assert!(matches!(err, ConnectError::Closed(id) if id == circuit.id()));
}

#[test]
fn test_session_handlers() {
    let sim = FakeSimulator::start();
    let session = new_session();
    session.login(sim.addr(), 1).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let id = session.register_handler(MessageType::ChatFromSimulator, move |message, _| {
        assert_eq!(
            message.block("ChatData")?.string("Message")?,
            "hello"
        );
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    sim.send(common::chat("hello"));
    assert!(wait_until(500, || count.load(Ordering::SeqCst) == 1));

    assert!(session.unregister_handler(id));
    sim.send(common::chat("hello"));
    std::thread::sleep(std::time::Duration::from_millis(100));
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_send_current() {
    let sim = FakeSimulator::start();
    let session = new_session();

    let chat = common::viewer_chat("before login");
    assert!(session.send_current(chat, false).is_err());

    session.login(sim.addr(), 1).unwrap();
    session
        .send_current(common::viewer_chat("after login"), true)
        .unwrap();
    let chats = sim.wait_for(MessageType::ChatFromViewer, 1, 500);
    assert_eq!(
        chats[0].message.block("ChatData").unwrap().string("Message").unwrap(),
        "after login"
    );
}
