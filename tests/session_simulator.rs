// MIT License

//! End-to-end tests running a [`Session`] against the built-in
//! [`Simulator`] over localhost TCP.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use telenot_gms::{
    ArmMode, ArmedState, CommandOutcome, ControlField, DecodedEvent, EventReceiver, FrameBuffer,
    GmsError, ReconnectPolicy, Session, SessionConfig, Simulator, SimulatorConfig, Snapshot,
    Telegram,
};

const WAIT: Duration = Duration::from_secs(10);

async fn start_simulator() -> Simulator {
    let config = SimulatorConfig {
        port: 0,
        status_interval_ms: 100,
        // Keep the periodic alarm cycle out of the way unless a test
        // configures it explicitly.
        alarm_interval_ms: 60_000,
        ..SimulatorConfig::default()
    };
    Simulator::bind(config).await.expect("bind simulator")
}

async fn connect(sim: &Simulator) -> Session {
    let addr = sim.local_addr();
    let config = SessionConfig::builder(addr.ip().to_string())
        .port(addr.port())
        .command_timeout(Duration::from_secs(2))
        .tick_interval(Duration::from_millis(50))
        .reconnect(ReconnectPolicy::disabled())
        .build();
    Session::connect(config).await.expect("connect to simulator")
}

async fn wait_until(session: &Session, check: impl Fn(&Snapshot) -> bool) -> Snapshot {
    timeout(WAIT, async {
        loop {
            let snapshot = session.snapshot().await;
            if check(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("timed out waiting for snapshot condition")
}

async fn wait_for_event(
    events: &mut EventReceiver,
    mut predicate: impl FnMut(&DecodedEvent) -> bool,
) -> DecodedEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn snapshot_converges_to_simulator_state() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;

    let snapshot = wait_until(&session, |s| {
        s.identification.is_some() && !s.areas.is_empty() && s.inputs.len() >= 32
    })
    .await;

    assert_eq!(snapshot.identification.as_deref(), Some("123456"));
    let area1 = snapshot.areas.iter().find(|a| a.index == 1).expect("area 1 present");
    assert_eq!(area1.armed_state, ArmedState::Disarmed);
    assert!(area1.ready_away);
    assert!(area1.ready_home);
    assert!(!area1.alarm);
    assert!(snapshot.inputs.iter().all(|i| !i.active));
    assert!(!snapshot.outputs.is_empty());

    session.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn arm_command_acknowledged_and_reflected() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;

    let outcome = session.arm(1, ArmMode::Away).await.expect("arm");
    assert_eq!(outcome, CommandOutcome::Acknowledged);
    wait_until(&session, |s| {
        s.areas.iter().any(|a| a.index == 1 && a.armed_state == ArmedState::ArmedAway)
    })
    .await;

    let outcome = session.disarm(1).await.expect("disarm");
    assert_eq!(outcome, CommandOutcome::Acknowledged);
    wait_until(&session, |s| {
        s.areas.iter().any(|a| a.index == 1 && a.armed_state == ArmedState::Disarmed)
    })
    .await;

    session.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn output_command_acknowledged_and_reflected() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;

    let outcome = session.set_output(0x0508, true).await.expect("set output");
    assert_eq!(outcome, CommandOutcome::Acknowledged);
    assert_eq!(sim.topology().lock().await.output(0x0508), Some(true));
    wait_until(&session, |s| s.outputs.iter().any(|o| o.address == 0x0508 && o.active)).await;

    session.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn input_activity_propagates() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;
    wait_until(&session, |s| s.inputs.len() >= 32).await;

    let mut events = session.events();
    sim.topology().lock().await.set_input(3, true);

    let event = wait_for_event(&mut events, |e| {
        matches!(e, DecodedEvent::InputChanged { address: 0x0003, active: true, .. })
    })
    .await;
    match event {
        DecodedEvent::InputChanged { label, .. } => assert_eq!(label, "Meldergruppe 4"),
        other => panic!("unexpected event: {other:?}"),
    }

    session.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn alarm_cycle_raises_and_clears() {
    let config = SimulatorConfig {
        port: 0,
        status_interval_ms: 100,
        alarm_interval_ms: 500,
        alarm_hold_ms: 200,
        ..SimulatorConfig::default()
    };
    let sim = Simulator::bind(config).await.expect("bind simulator");
    let session = connect(&sim).await;
    let mut events = session.events();

    wait_for_event(&mut events, |e| matches!(e, DecodedEvent::AlarmRaised { area: 1 })).await;
    wait_for_event(&mut events, |e| matches!(e, DecodedEvent::AlarmCleared { area: 1 })).await;
    wait_until(&session, |s| s.areas.iter().any(|a| a.index == 1 && !a.alarm)).await;

    session.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn simulator_accepts_multiple_clients() {
    let sim = start_simulator().await;
    let first = connect(&sim).await;
    let second = connect(&sim).await;

    wait_until(&first, |s| s.identification.is_some()).await;
    wait_until(&second, |s| s.identification.is_some()).await;

    sim.topology().lock().await.set_input(5, true);
    wait_until(&first, |s| s.inputs.iter().any(|i| i.address == 5 && i.active)).await;
    wait_until(&second, |s| s.inputs.iter().any(|i| i.address == 5 && i.active)).await;

    first.disconnect().await;
    second.disconnect().await;
    sim.shutdown().await;
}

#[tokio::test]
async fn disconnect_marks_model_stale_and_fails_commands() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;
    wait_until(&session, |s| !s.areas.is_empty() && !s.inputs.is_empty()).await;

    let mut events = session.events();
    sim.shutdown().await;
    wait_for_event(&mut events, |e| matches!(e, DecodedEvent::Disconnected)).await;

    let snapshot = session.snapshot().await;
    assert!(snapshot.areas.iter().all(|a| a.stale));
    assert!(snapshot.inputs.iter().all(|i| i.stale));

    match session.arm(1, ArmMode::Away).await {
        Err(GmsError::Disconnected) => {}
        other => panic!("expected Disconnected, got {other:?}"),
    }

    session.disconnect().await;
}

#[tokio::test]
async fn second_command_for_same_target_is_busy() {
    // A listener that accepts and then never answers: the first command
    // stays pending until the correlator times it out, and a second
    // command for the same area must fail fast with Busy.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let hold = tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.expect("accept");
        sleep(Duration::from_secs(30)).await;
    });

    let config = SessionConfig::builder("127.0.0.1")
        .port(addr.port())
        .command_timeout(Duration::from_secs(1))
        .tick_interval(Duration::from_millis(50))
        .reconnect(ReconnectPolicy::disabled())
        .build();
    let session = Session::connect(config).await.expect("connect");

    let first = session.arm(1, ArmMode::Away);
    let second = async {
        sleep(Duration::from_millis(200)).await;
        session.arm(1, ArmMode::Home).await
    };
    let (first_res, second_res) = tokio::join!(first, second);

    assert!(matches!(second_res, Err(GmsError::Busy { .. })));
    assert_eq!(first_res.expect("first command resolves"), CommandOutcome::TimedOut);

    session.disconnect().await;
    hold.abort();
}

#[tokio::test]
async fn nak_resolves_the_first_command_on_the_wire() {
    // A scripted panel: wait until both commands (four telegrams) are in
    // flight, NAK the first, then acknowledge the second. The rejection
    // must land on the command that hit the wire first.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let panel = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut frames = FrameBuffer::new();
        let mut buf = [0u8; 1024];
        let mut received = 0;
        while received < 4 {
            let n = stream.read(&mut buf).await.expect("read");
            assert!(n > 0, "client closed early");
            frames.extend(&buf[..n]);
            while let Some(telegram) = frames.next_telegram() {
                assert!(matches!(
                    telegram.control,
                    ControlField::SendNorm | ControlField::SendNdat
                ));
                received += 1;
            }
        }
        stream.write_all(&Telegram::confirm_nak().encode()).await.expect("write nak");
        stream.write_all(&Telegram::confirm_ack().encode()).await.expect("write ack");
        stream.write_all(&Telegram::confirm_ack().encode()).await.expect("write ack");
        sleep(Duration::from_millis(200)).await;
    });

    let config = SessionConfig::builder("127.0.0.1")
        .port(addr.port())
        .command_timeout(Duration::from_secs(5))
        .tick_interval(Duration::from_millis(50))
        .reconnect(ReconnectPolicy::disabled())
        .build();
    let session = Session::connect(config).await.expect("connect");

    let first = session.arm(1, ArmMode::Away);
    let second = async {
        sleep(Duration::from_millis(100)).await;
        session.set_output(0x0508, true).await
    };
    let (first_res, second_res) = tokio::join!(first, second);

    assert_eq!(first_res.expect("first resolves"), CommandOutcome::Rejected);
    assert_eq!(second_res.expect("second resolves"), CommandOutcome::Acknowledged);

    session.disconnect().await;
    panel.await.expect("panel task");
}

#[tokio::test]
async fn pending_command_resolves_disconnected_on_connection_loss() {
    // The panel never answers and drops the socket while the command is
    // still in flight; the awaiting caller must see Disconnected, not a
    // timeout.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let panel = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        sleep(Duration::from_millis(300)).await;
        drop(stream);
    });

    let config = SessionConfig::builder("127.0.0.1")
        .port(addr.port())
        .command_timeout(Duration::from_secs(5))
        .tick_interval(Duration::from_millis(50))
        .reconnect(ReconnectPolicy::disabled())
        .build();
    let session = Session::connect(config).await.expect("connect");
    let mut events = session.events();

    let outcome = session.arm(1, ArmMode::Away).await.expect("command resolves");
    assert_eq!(outcome, CommandOutcome::Disconnected);
    wait_for_event(&mut events, |e| matches!(e, DecodedEvent::Disconnected)).await;

    panel.await.expect("panel task");
    session.disconnect().await;
}

#[tokio::test]
async fn invalid_area_rejected_locally() {
    let sim = start_simulator().await;
    let session = connect(&sim).await;

    match session.arm(0, ArmMode::Away).await {
        Err(GmsError::InvalidArea { area: 0, .. }) => {}
        other => panic!("expected InvalidArea, got {other:?}"),
    }
    match session.arm(200, ArmMode::Away).await {
        Err(GmsError::InvalidArea { area: 200, .. }) => {}
        other => panic!("expected InvalidArea, got {other:?}"),
    }

    session.disconnect().await;
    sim.shutdown().await;
}
