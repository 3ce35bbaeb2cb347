//! End-to-end stage behavior over the simulated controller.

use probe_stage::mock::{MockTransport, WireEvent};
use probe_stage::{
    AxisId, DriverError, HomeDirection, MotorEventKind, StageConfiguration, StageManager,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> StageConfiguration {
    let mut config = StageConfiguration::default();
    config.move_timeout = Duration::from_secs(2);
    for axis_config in config.axes.values_mut() {
        axis_config.status_poll_interval = Duration::from_millis(2);
    }
    config
}

fn mock_stage(move_ms: u64) -> (StageManager, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new().with_move_duration(Duration::from_millis(move_ms)));
    let manager = StageManager::with_transport(test_config(), mock.clone() as Arc<dyn Transport>);
    (manager, mock)
}

fn writes_containing(events: &[WireEvent], needle: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, WireEvent::Write(w) if w.contains(needle)))
        .count()
}

#[tokio::test]
async fn out_of_limits_move_never_touches_the_wire() {
    let (stage, mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();
    mock.clear_events();

    // X is configured with limits (-24940, 20000).
    let err = stage
        .move_single_axis(AxisId::X, 25_000.0, false, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::LimitViolation { .. }));
    assert!(mock.events().is_empty());
}

#[tokio::test]
async fn absolute_move_emits_started_then_completed() {
    let (stage, _mock) = mock_stage(10);
    stage.initialize(&[AxisId::X]).await.unwrap();
    let mut events = stage.subscribe_events();

    let ok = stage
        .move_single_axis(AxisId::X, 1000.0, false, None, true)
        .await
        .unwrap();
    assert!(ok);

    let started = events.recv().await.unwrap();
    assert_eq!(started.kind, MotorEventKind::MoveStarted);
    assert_eq!(
        started.get("target_position").and_then(|v| v.as_f64()),
        Some(1000.0)
    );

    let completed = events.recv().await.unwrap();
    assert_eq!(completed.kind, MotorEventKind::MoveCompleted);
    assert_eq!(completed.get("success").and_then(|v| v.as_bool()), Some(true));
    let actual = completed
        .get("actual_position")
        .and_then(|v| v.as_f64())
        .unwrap();
    assert!((actual - 1000.0).abs() <= 1.0);

    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 1000.0).abs() <= 1.0);
}

#[tokio::test]
async fn relative_moves_accumulate_in_cached_positions() {
    let (stage, _mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();

    stage
        .move_single_axis(AxisId::X, 500.0, true, None, true)
        .await
        .unwrap();
    stage
        .move_single_axis(AxisId::X, -200.0, true, None, true)
        .await
        .unwrap();

    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 300.0).abs() <= 1.0);
}

#[tokio::test]
async fn concurrent_axis_moves_never_interleave_round_trips() {
    let (stage, mock) = mock_stage(30);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();
    mock.clear_events();

    let (rx, ry) = tokio::join!(
        stage.move_single_axis(AxisId::X, 1000.0, false, None, true),
        stage.move_single_axis(AxisId::Y, 2000.0, false, None, true),
    );
    assert!(rx.unwrap());
    assert!(ry.unwrap());

    // Every query's write must be immediately followed by its response:
    // nothing from the other axis may slip inside the round trip.
    let events = mock.events();
    for (i, event) in events.iter().enumerate() {
        if let WireEvent::Write(w) = event {
            if w.ends_with('?') {
                assert!(
                    matches!(events.get(i + 1), Some(WireEvent::Read(_))),
                    "query '{w}' at index {i} was not followed by its response: {events:?}"
                );
            }
        }
    }
    // Both move commands made it out exactly once.
    assert_eq!(writes_containing(&events, "1MVA"), 1);
    assert_eq!(writes_containing(&events, "2MVA"), 1);
}

#[tokio::test]
async fn move_xy_reports_success_only_when_both_legs_complete() {
    let (stage, _mock) = mock_stage(10);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();

    assert!(stage.move_xy(750.0, -500.0, true).await.unwrap());
    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 750.0).abs() <= 1.0);
    assert!((positions[&AxisId::Y] + 500.0).abs() <= 1.0);
}

#[tokio::test]
async fn move_xy_partial_failure_leaves_committed_axis_in_place() {
    let (stage, mock) = mock_stage(10);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();

    mock.fail_next_send_containing("2MVR");
    let err = stage.move_xy(750.0, -500.0, true).await.unwrap_err();
    assert!(matches!(err, DriverError::Transport(_)));

    // The X leg was already committed and is reflected in the aggregate.
    stage
        .wait_for_all_moves_complete(Duration::from_secs(1))
        .await;
    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 750.0).abs() <= 1.0);
    assert!(positions[&AxisId::Y].abs() <= 1.0);
}

#[tokio::test]
async fn move_xy_leg_timeout_still_reflects_the_completed_leg() {
    let mock = Arc::new(
        MockTransport::new()
            .with_move_duration(Duration::from_millis(10))
            .with_axis_move_duration(2, Duration::from_secs(60)),
    );
    let mut config = test_config();
    config.move_timeout = Duration::from_millis(100);
    let stage = StageManager::with_transport(config, mock.clone() as Arc<dyn Transport>);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();

    let err = stage.move_xy(750.0, -500.0, true).await.unwrap_err();
    assert!(matches!(
        err,
        DriverError::MoveTimeout { axis: AxisId::Y, .. }
    ));

    // X finished its leg; the aggregate reflects it. Y never arrived and,
    // with no auto-stop on timeout, still reads back near its start.
    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 750.0).abs() <= 1.0);
    assert!(positions[&AxisId::Y].abs() <= 1.0);
}

#[tokio::test]
async fn homing_zeroes_the_axis_and_survives_a_lost_confirmation_read() {
    let (stage, mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();
    let mut events = stage.subscribe_events();

    mock.fail_next_query_containing("1POS?");
    stage
        .home_axis(AxisId::X, HomeDirection::Negative)
        .await
        .unwrap();

    let status = stage.get_status().await;
    assert_eq!(status.homed.get(&AxisId::X), Some(&true));
    assert!(status.last_positions[&AxisId::X].abs() <= 1.0);

    // MoveStarted{operation=homing} then Homed.
    let started = events.recv().await.unwrap();
    assert_eq!(started.kind, MotorEventKind::MoveStarted);
    assert_eq!(
        started.get("operation").and_then(|v| v.as_str()),
        Some("homing")
    );
    let homed = events.recv().await.unwrap();
    assert_eq!(homed.kind, MotorEventKind::Homed);
}

#[tokio::test]
async fn z_limit_survey_parks_y_at_its_upper_bound_first() {
    let (stage, mock) = mock_stage(5);
    stage.initialize(&[AxisId::Y, AxisId::Z]).await.unwrap();
    mock.clear_events();

    stage.home_to_limits(AxisId::Z).await.unwrap();

    let events = mock.events();
    let y_park = events.iter().position(
        |e| matches!(e, WireEvent::Write(w) if w.starts_with("2MVA")),
    );
    let first_z = events.iter().position(
        |e| matches!(e, WireEvent::Write(w) if w.starts_with('3')),
    );
    let (y_park, first_z) = (y_park.unwrap(), first_z.unwrap());
    assert!(
        y_park < first_z,
        "Y park (index {y_park}) must precede any Z command (index {first_z})"
    );
    // Y's park target is its configured upper limit, 20000um = 20mm.
    assert_eq!(writes_containing(&events, "2MVA20.000000"), 1);
}

#[tokio::test]
async fn home_to_limits_rewrites_the_configured_soft_limits() {
    let (stage, _mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();

    // Default mock travel is -30mm..25mm: zeroed at the negative switch,
    // the positive switch sits 55mm = 55000um away.
    let (lo, hi) = stage.home_to_limits(AxisId::X).await.unwrap();
    assert_eq!(lo, 0.0);
    assert!((hi - 55_000.0).abs() <= 1.0);

    let config = stage.configuration().await;
    assert_eq!(config.axis(AxisId::X).unwrap().position_limits, (lo, hi));

    // The rewritten limits are live: the old floor is now out of bounds.
    let err = stage
        .move_single_axis(AxisId::X, -1000.0, false, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::LimitViolation { .. }));
}

#[tokio::test]
async fn operations_on_uninitialized_axes_fail_typed() {
    let (stage, _mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();

    let err = stage
        .move_single_axis(AxisId::Y, 10.0, false, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NotInitialized(AxisId::Y)));

    let err = stage
        .home_axis(AxisId::Y, HomeDirection::Negative)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NotInitialized(AxisId::Y)));
}

#[tokio::test]
async fn uninitialized_axes_report_default_zero_positions() {
    let (stage, _mock) = mock_stage(5);
    stage.initialize(&[AxisId::X]).await.unwrap();

    let positions = stage.get_all_positions().await;
    assert_eq!(positions.len(), AxisId::DRIVABLE.len());
    assert_eq!(positions[&AxisId::Y], 0.0);
    assert_eq!(positions[&AxisId::ChipRotation], 0.0);
}

#[tokio::test]
async fn failed_axis_is_excluded_from_the_live_set() {
    let (stage, mock) = mock_stage(5);
    mock.fail_next_send_containing("2SM3");

    let err = stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap_err();
    assert_eq!(err.failed.len(), 1);
    assert_eq!(err.failed[0].0, AxisId::Y);

    // X connected and works; Y is not half-initialized.
    assert!(stage
        .move_single_axis(AxisId::X, 100.0, false, None, true)
        .await
        .unwrap());
    assert!(matches!(
        stage
            .move_single_axis(AxisId::Y, 100.0, false, None, true)
            .await,
        Err(DriverError::NotInitialized(AxisId::Y))
    ));
}

#[tokio::test]
async fn emergency_stop_broadcasts_and_halts_every_axis() {
    let (stage, mock) = mock_stage(10_000);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();

    stage
        .move_single_axis(AxisId::X, 5000.0, false, None, false)
        .await
        .unwrap();
    mock.clear_events();

    stage.emergency_stop().await;

    let events = mock.events();
    assert_eq!(writes_containing(&events, "0EST"), 1);
    assert!(writes_containing(&events, "1STP") >= 1);
    assert!(!stage.is_any_axis_moving().await);
}

#[tokio::test]
async fn emergency_stop_tolerates_a_dead_transport() {
    let (stage, mock) = mock_stage(10_000);
    stage.initialize(&[AxisId::X]).await.unwrap();

    mock.set_offline(true);
    // Must return without panicking or hanging even though nothing on the
    // wire succeeds.
    stage.emergency_stop().await;
}

#[tokio::test]
async fn timed_out_move_fires_error_but_sends_no_stop() {
    let mock = Arc::new(MockTransport::new().with_move_duration(Duration::from_secs(60)));
    let mut config = test_config();
    config.move_timeout = Duration::from_millis(60);
    let stage = StageManager::with_transport(config, mock.clone() as Arc<dyn Transport>);
    stage.initialize(&[AxisId::X]).await.unwrap();
    let mut events = stage.subscribe_events();
    mock.clear_events();

    let err = stage
        .move_single_axis(AxisId::X, 1000.0, false, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::MoveTimeout { .. }));
    assert_eq!(writes_containing(&mock.events(), "STP"), 0);

    let started = events.recv().await.unwrap();
    assert_eq!(started.kind, MotorEventKind::MoveStarted);
    let error_event = events.recv().await.unwrap();
    assert_eq!(error_event.kind, MotorEventKind::Error);
}

#[tokio::test]
async fn initial_targets_require_homing_first() {
    let mut config = test_config();
    if let Some(x) = config.axes.get_mut(&AxisId::X) {
        x.initial_target = Some(1500.0);
    }
    let mock = Arc::new(MockTransport::new().with_move_duration(Duration::from_millis(5)));
    let stage = StageManager::with_transport(config, mock.clone() as Arc<dyn Transport>);
    stage.initialize(&[AxisId::X]).await.unwrap();

    let err = stage.apply_initial_targets().await.unwrap_err();
    assert!(matches!(err, DriverError::NotHomed { axis: AxisId::X }));

    stage
        .home_axis(AxisId::X, HomeDirection::Negative)
        .await
        .unwrap();
    assert!(stage.apply_initial_targets().await.unwrap());

    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::X] - 1500.0).abs() <= 1.0);
}

#[tokio::test]
async fn wait_for_all_moves_complete_observes_the_full_set() {
    let (stage, _mock) = mock_stage(50);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();

    stage
        .move_single_axis(AxisId::X, 500.0, false, None, false)
        .await
        .unwrap();
    assert!(stage.is_any_axis_moving().await);
    assert!(
        stage
            .wait_for_all_moves_complete(Duration::from_secs(2))
            .await
    );
    assert!(!stage.is_any_axis_moving().await);
}

#[tokio::test]
async fn disconnect_all_clears_the_live_set() {
    let (stage, _mock) = mock_stage(5);
    stage.initialize(&[AxisId::X, AxisId::Y]).await.unwrap();
    assert!(stage.get_status().await.connected);

    stage.disconnect_all().await;
    let status = stage.get_status().await;
    assert!(!status.connected);
    assert!(status.initialized_axes.is_empty());
    assert!(matches!(
        stage.get_position(AxisId::X).await,
        Err(DriverError::NotInitialized(AxisId::X))
    ));
}

#[tokio::test]
async fn rotary_axes_speak_degrees_end_to_end() {
    let (stage, mock) = mock_stage(5);
    stage.initialize(&[AxisId::FiberRotation]).await.unwrap();
    mock.clear_events();

    stage
        .move_single_axis(AxisId::FiberRotation, 45.0, false, None, true)
        .await
        .unwrap();
    // Degrees pass through to the wire unscaled (axis 4).
    assert_eq!(writes_containing(&mock.events(), "4MVA45.000000"), 1);

    let positions = stage.get_all_positions().await;
    assert!((positions[&AxisId::FiberRotation] - 45.0).abs() <= 1.0);
}
