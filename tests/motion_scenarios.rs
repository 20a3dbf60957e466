//! Motion controller end to end: simulation fallback, hardware moves,
//! polling and serialized access.

use stage_control::config::AxisConfig;
use stage_control::prelude::*;
use stage_control::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::timeout;

async fn offline_stage() -> (Arc<StageMotionController>, EventBus) {
    let config = StageConfig::default();
    let events = EventBus::default();
    let connection = Arc::new(
        ConnectionManager::from_config(
            &config,
            Arc::new(OfflineBackend::default()),
            Arc::new(SimulatedStage::new()),
            events.clone(),
        )
        .unwrap(),
    );
    let (state, _) = connection.connect().await;
    assert_eq!(state, ConnectionState::Simulation);

    let motion = StageMotionController::from_config(&config, connection, events.clone()).unwrap();
    (Arc::new(motion), events)
}

async fn hardware_stage(
    config: &StageConfig,
    hardware: Arc<SimulatedStage>,
) -> (Arc<StageMotionController>, EventBus) {
    let events = EventBus::default();
    let connection = Arc::new(
        ConnectionManager::from_config(
            config,
            hardware,
            Arc::new(SimulatedStage::new()),
            events.clone(),
        )
        .unwrap(),
    );
    let (state, _) = connection.connect().await;
    assert_eq!(state, ConnectionState::Connected);

    let motion = StageMotionController::from_config(config, connection, events.clone()).unwrap();
    (Arc::new(motion), events)
}

fn hardware() -> Arc<SimulatedStage> {
    Arc::new(SimulatedStage::builder().reports_simulated(false).build())
}

#[tokio::test]
async fn relative_move_in_simulation_mode() {
    let (motion, events) = offline_stage().await;
    let mut rx = events.subscribe();

    let position = motion.move_relative(Axis::Z, 5.0).await.unwrap();
    assert_eq!(position, 5.0);
    assert_eq!(motion.position(Axis::Z), Some(5.0));

    match rx.try_recv().unwrap() {
        StageEvent::PositionChanged { axis, position } => {
            assert_eq!(axis, Axis::Z);
            assert_eq!(position, 5.0);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn absolute_and_multi_axis_moves() {
    let (motion, _events) = offline_stage().await;

    motion.move_absolute(Axis::X, 120.0).await.unwrap();
    motion.move_absolute(Axis::X, -80.0).await.unwrap();
    assert_eq!(motion.position(Axis::X), Some(-80.0));

    motion.set_multi_axis(10.0, 20.0, 30.0).await.unwrap();
    let positions = motion.positions();
    assert_eq!(positions[&Axis::X].current, 10.0);
    assert_eq!(positions[&Axis::Y].current, 20.0);
    assert_eq!(positions[&Axis::Z].current, 30.0);
    assert!(positions.values().all(AxisPosition::is_settled));

    motion.reset_axis(Axis::Y).await.unwrap();
    assert_eq!(motion.position(Axis::Y), Some(0.0));
    motion.reset_axis(AxisSelector::All).await.unwrap();
    assert!(motion.positions().values().all(|p| p.current == 0.0));
}

#[tokio::test]
async fn travel_range_rejects_without_moving() {
    let mut config = StageConfig::default();
    config.axes = vec![AxisConfig {
        travel: Some([-50.0, 50.0]),
        ..AxisConfig::new(Axis::Z)
    }];
    let hw = hardware();
    let (motion, _events) = hardware_stage(&config, hw.clone()).await;

    motion.move_absolute(Axis::Z, 45.0).await.unwrap();
    let err = motion.move_relative(Axis::Z, 10.0).await.unwrap_err();
    assert!(matches!(
        err,
        StageError::Validation(ValidationError::OutOfTravel { .. })
    ));
    assert_eq!(motion.position(Axis::Z), Some(45.0));
    assert_eq!(hw.move_count(), 1);

    // X is not configured on this stage.
    let err = motion.move_relative(Axis::X, 1.0).await.unwrap_err();
    assert!(matches!(
        err,
        StageError::Validation(ValidationError::UnknownAxis(Axis::X))
    ));
}

#[tokio::test]
async fn hardware_limit_surfaces_as_movement_error() {
    let hw = Arc::new(
        SimulatedStage::builder()
            .reports_simulated(false)
            .limit(Axis::Y, -10.0, 10.0)
            .build(),
    );
    let (motion, _events) = hardware_stage(&StageConfig::default(), hw).await;

    motion.move_relative(Axis::Y, 8.0).await.unwrap();
    let err = motion.move_relative(Axis::Y, 5.0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Movement);
    assert!(err.to_string().contains("hardware limit"));

    let y = motion.positions()[&Axis::Y];
    assert_eq!(y.current, 8.0);
    assert!(!y.is_settled());
}

#[tokio::test]
async fn concurrent_moves_are_serialized() {
    let hw = Arc::new(
        SimulatedStage::builder()
            .reports_simulated(false)
            .motion_speed(2000.0)
            .build(),
    );
    let (motion, _events) = hardware_stage(&StageConfig::default(), hw.clone()).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let motion = Arc::clone(&motion);
            tokio::spawn(async move { motion.move_relative(Axis::X, 5.0).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(motion.position(Axis::X), Some(40.0));
    assert_eq!(hw.position_now(Axis::X), 40.0);
    assert_eq!(hw.move_count(), 8);
}

#[tokio::test]
async fn polling_picks_up_manual_repositioning() {
    let hw = hardware();
    let (motion, events) = hardware_stage(&StageConfig::default(), hw.clone()).await;
    let mut rx = events.subscribe();

    let poller = motion.start_polling(Duration::from_millis(20)).unwrap();
    hw.set_position(Axis::Y, 12.5);

    let event = timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(event @ StageEvent::PositionChanged { .. }) = rx.recv().await {
                return event;
            }
        }
    })
    .await
    .expect("poller never reported the change");
    assert!(matches!(
        event,
        StageEvent::PositionChanged {
            axis: Axis::Y,
            position
        } if position == 12.5
    ));
    assert_eq!(motion.position(Axis::Y), Some(12.5));

    poller.cancel().await;
    hw.set_position(Axis::Y, -3.0);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(motion.position(Axis::Y), Some(12.5));
}

#[tokio::test]
async fn simulation_mode_never_touches_hardware() {
    let hw = Arc::new(
        SimulatedStage::builder()
            .reports_simulated(false)
            .faults(FaultPlan::none().always_fail_connect())
            .build(),
    );
    let events = EventBus::default();
    let connection = Arc::new(
        ConnectionManager::from_config(
            &StageConfig::default(),
            hw.clone(),
            Arc::new(SimulatedStage::new()),
            events.clone(),
        )
        .unwrap(),
    );
    connection.connect().await;
    let motion =
        StageMotionController::from_config(&StageConfig::default(), connection, events).unwrap();

    motion.move_relative(Axis::Z, 3.0).await.unwrap();
    assert_eq!(motion.position(Axis::Z), Some(3.0));
    assert_eq!(hw.move_count(), 0);
    assert_eq!(hw.position_now(Axis::Z), 0.0);

    // Simulated backends have nothing to reconcile.
    assert!(motion.refresh().await.unwrap().is_empty());
}
