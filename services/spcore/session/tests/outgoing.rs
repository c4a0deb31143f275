//! Loopback tests for controllers this side dials.

mod common;

use common::*;
use spcore_session::{ControllerConfig, FleetManager, SessionError};
use spcore_wire::{
    ConfigChange, ConfigRecord, DeviceActionRequest, DeviceActionType, Event, EventFlow,
    MessageKind, SpCoreMessage, MAX_BODY_LENGTH,
};
use std::collections::HashSet;
use std::time::Duration;
use tokio::net::TcpListener;

fn schedules(name: &str) -> ConfigChange {
    ConfigChange {
        schedules: vec![ConfigRecord::named(10, name)],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_dial_identify_and_correlate() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    let controller = fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port).with_password("pw"), observer)
        .unwrap();
    let mut sim = SimController::accept(&listener).await;

    // The dialing side identifies first.
    let hello = sim.next().await;
    assert_eq!(hello.kind(), MessageKind::Identification);
    let hello = hello.identification.unwrap();
    assert_eq!(hello.id(), "");
    assert_eq!(hello.password(), "pw");
    assert_eq!(hello.max_body_length(), MAX_BODY_LENGTH);
    assert!(!controller.is_online());

    sim.identify("panel-1", None, MAX_BODY_LENGTH).await;
    assert_eq!(next_seen(&mut seen).await, Seen::Online);
    assert!(controller.is_online());
    let identification = controller.identification().unwrap();
    assert_eq!(identification.id(), "panel-1");
    assert_eq!(identification.protocol_version(), "0.1");

    let first = controller.send_config_change(schedules("weekdays")).unwrap();
    let second = controller.send_config_change(schedules("weekends")).unwrap();
    assert_eq!((first, second), (1, 2));

    let received = sim.next().await.config_change.unwrap();
    assert_eq!(received.request_id(), first);
    assert_eq!(received.schedules[0].name(), "weekdays");
    assert_eq!(sim.next().await.config_change.unwrap().request_id(), second);

    // Results arrive out of order.
    sim.send(SpCoreMessage::config_change_result(second, Some("bad schedule".into())))
        .await;
    sim.send(SpCoreMessage::config_change_result(first, None)).await;
    assert_eq!(
        next_seen(&mut seen).await,
        Seen::ConfigResult { request_id: second, success: false }
    );
    assert_eq!(
        next_seen(&mut seen).await,
        Seen::ConfigResult { request_id: first, success: true }
    );

    let action = controller
        .send_device_action(DeviceActionRequest {
            action_type: Some(DeviceActionType::DoorMomentaryUnlock as i32),
            device_id: Some(42),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(sim.next().await.device_action_request.unwrap().device_id(), 42);
    sim.send(SpCoreMessage::device_action_result(action, None)).await;
    assert_eq!(
        next_seen(&mut seen).await,
        Seen::ActionResult { request_id: action, device_id: 42 }
    );

    fleet.shutdown().await;
    sim.expect_closed().await;
}

#[tokio::test]
async fn test_event_stream_and_acknowledgement() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    let controller = fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port), observer)
        .unwrap();
    let mut sim = SimController::accept(&listener).await;
    sim.next().await;
    sim.identify(MAC, None, MAX_BODY_LENGTH).await;
    assert_eq!(next_seen(&mut seen).await, Seen::Online);

    controller.start_event_stream().unwrap();
    let control = sim.next().await.event_flow_control.unwrap();
    assert_eq!(control.flow(), EventFlow::StartContinuous);

    // Empty batches are not reported.
    sim.send(SpCoreMessage::event_batch(Vec::new())).await;
    sim.send(SpCoreMessage::event_batch(vec![
        Event { unid: Some(7), ..Default::default() },
        Event { unid: Some(8), ..Default::default() },
    ]))
    .await;
    assert_eq!(next_seen(&mut seen).await, Seen::Events(vec![7, 8]));

    controller
        .acknowledge_events(&HashSet::from([8, 7]))
        .unwrap();
    let ack = sim.next().await.event_flow_control.unwrap();
    assert_eq!(ack.consume, vec![7, 8]);

    sim.send(SpCoreMessage::of_kind(MessageKind::DeviceStateRecord)).await;
    assert_eq!(
        next_seen(&mut seen).await,
        Seen::Unhandled(MessageKind::DeviceStateRecord)
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_oversize_request_rejected_before_queueing() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    let controller = fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port), observer)
        .unwrap();
    let mut sim = SimController::accept(&listener).await;
    sim.next().await;
    sim.identify(MAC, None, 128).await;
    assert_eq!(next_seen(&mut seen).await, Seen::Online);

    let result = controller.send_config_change(schedules(&"x".repeat(500)));
    assert!(matches!(result, Err(SessionError::Oversize { max: 128, .. })));

    // The connection is unaffected and the next request uses the next id.
    let id = controller.send_config_change(schedules("small")).unwrap();
    assert_eq!(sim.next().await.config_change.unwrap().request_id(), id);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_alternates_online_offline() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    let controller = fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port), observer)
        .unwrap();

    for _ in 0..2 {
        let mut sim = SimController::accept(&listener).await;
        assert_eq!(sim.next().await.kind(), MessageKind::Identification);
        sim.identify(MAC, None, MAX_BODY_LENGTH).await;
        assert_eq!(next_seen(&mut seen).await, Seen::Online);
        drop(sim);
        assert_eq!(next_seen(&mut seen).await, Seen::Offline);
        assert!(!controller.is_online());
    }

    fleet.shutdown().await;
    assert_quiet(&mut seen, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_terminate_drops_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port), observer)
        .unwrap();
    let mut sim = SimController::accept(&listener).await;
    sim.next().await;
    sim.identify(MAC, None, MAX_BODY_LENGTH).await;
    assert_eq!(next_seen(&mut seen).await, Seen::Online);

    sim.send(SpCoreMessage::terminate(spcore_wire::TerminationReason::Shutdown))
        .await;
    assert_eq!(next_seen(&mut seen).await, Seen::Offline);
    sim.expect_closed().await;

    let sessions = fleet.sessions();
    let last_error = sessions[0].session().and_then(|s| s.last_error()).unwrap();
    assert!(last_error.contains("terminated"), "{}", last_error);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_controller_records_error() {
    // Bind then drop to obtain a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let fleet = FleetManager::start(fleet_config(false), None).await.unwrap();
    let (observer, mut seen) = recorder();

    let controller = fleet
        .add(ControllerConfig::outgoing("127.0.0.1", port), observer)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(!controller.is_online());
    let session = fleet.sessions()[0].session().unwrap();
    assert!(session.last_error().is_some());
    assert_quiet(&mut seen, Duration::from_millis(100)).await;

    controller.stop().await;
    assert!(controller.is_stopping());
    assert!(matches!(
        controller.start_event_stream(),
        Err(SessionError::Stopped)
    ));
    fleet.shutdown().await;
}
