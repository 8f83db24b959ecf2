//! Sweep controller state machine against the simulated sourcemeter.

mod common;

use common::{
    abort_plan, mock_controller, params, plan, CancelOnTrigger, RecordingSink,
    RejectReverseConfiguration,
};
use sheet_daq::controller::{ControllerState, SweepController};
use sheet_daq::error::SweepError;
use sheet_daq::instrument::MockSourceMeter;
use sheet_daq::measurement::Direction;
use sheet_daq::plan::{SweepParameters, MAX_POINT_COUNT, MAX_STEP_DELAY_S};
use sheet_daq::sink::SweepEvent;
use sheet_daq::timeout::{TimeoutEstimator, MAX_SWEEP_TIMEOUT};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn test_single_sweep_returns_every_point() {
    let (mock, controller) = mock_controller(Duration::from_millis(10));
    assert_eq!(controller.state(), ControllerState::Idle);

    controller.configure(plan(11)).await.unwrap();
    assert_eq!(controller.state(), ControllerState::Configured);

    let data = controller.run_sweep().await.unwrap();
    assert_eq!(data.len(), 11);
    assert_eq!(data.direction(), Direction::Forward);
    assert_eq!(data.samples()[0].independent, -1.0);
    assert_eq!(data.samples()[10].independent, 1.0);
    assert!((data.samples()[10].dependent - 1e-3).abs() < 1e-12);
    assert_eq!(controller.state(), ControllerState::Configured);
    assert_eq!(
        mock.call_log()
            .iter()
            .filter(|c| c.starts_with("fetch"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_sweep_without_plan_is_not_configured() {
    let (_mock, controller) = mock_controller(Duration::ZERO);
    assert!(matches!(
        controller.run_sweep().await,
        Err(SweepError::NotConfigured)
    ));
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[tokio::test]
async fn test_configure_failure_keeps_previous_plan() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    let good = plan(5);
    controller.configure(good.clone()).await.unwrap();

    mock.reject_next_configuration();
    let result = controller.configure(plan(7)).await;
    assert!(matches!(result, Err(SweepError::DeviceConfig(_))));
    assert_eq!(controller.state(), ControllerState::Configured);
    assert_eq!(mock.applied_plan(), Some(good));

    // Still usable with the restored plan
    assert_eq!(controller.run_sweep().await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_configure_failure_from_idle_stays_idle() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    mock.reject_next_configuration();
    assert!(controller.configure(plan(5)).await.is_err());
    assert_eq!(controller.state(), ControllerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_second_request_while_sweeping_is_busy() {
    let (_mock, controller) = mock_controller(Duration::from_millis(10));
    controller.configure(plan(21)).await.unwrap();

    let task = controller.start_sweep().unwrap();
    assert!(matches!(
        controller.configure(plan(5)).await,
        Err(SweepError::DeviceBusy)
    ));
    assert!(matches!(
        controller.start_sweep().map(|_| ()),
        Err(SweepError::DeviceBusy)
    ));

    assert_eq!(task.join().await.unwrap().len(), 21);
    assert!(controller.configure(plan(5)).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_requires_reconfiguration() {
    let (mock, controller) = mock_controller(Duration::from_millis(1));
    let plan = plan(21);
    let expected_wait = controller.estimator().estimate_plan(&plan);
    controller.configure(plan.clone()).await.unwrap();

    mock.hang_next_sweep();
    match controller.run_sweep().await {
        Err(SweepError::SweepTimeout { waited }) => assert_eq!(waited, expected_wait),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(mock.abort_count(), 1);
    assert!(matches!(
        controller.run_sweep().await,
        Err(SweepError::NotConfigured)
    ));

    controller.configure(plan).await.unwrap();
    assert_eq!(controller.run_sweep().await.unwrap().len(), 21);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_returns_to_configured_and_discards_samples() {
    let (mock, controller) = mock_controller(Duration::from_millis(10));
    controller.configure(plan(21)).await.unwrap();

    let task = controller.start_sweep().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.cancel();
    assert!(matches!(task.join().await, Err(SweepError::Cancelled)));
    assert_eq!(controller.state(), ControllerState::Configured);
    assert_eq!(mock.abort_count(), 1);
    assert!(!mock.call_log().iter().any(|c| c.starts_with("fetch")));

    // Re-triggering works without a new configure
    assert_eq!(controller.run_sweep().await.unwrap().len(), 21);
}

#[tokio::test(start_paused = true)]
async fn test_canceller_handle_cancels_from_elsewhere() {
    let (_mock, controller) = mock_controller(Duration::from_millis(10));
    controller.configure(plan(21)).await.unwrap();

    let task = controller.start_sweep().unwrap();
    let canceller = task.canceller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    assert!(matches!(task.join().await, Err(SweepError::Cancelled)));
}

#[tokio::test]
async fn test_abort_policy_trip_at_point_five_of_ten() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    controller.configure(abort_plan(10)).await.unwrap();
    mock.trip_compliance_at(4);

    match controller.run_sweep().await {
        Err(SweepError::ComplianceTripped {
            tripped_at,
            point_count,
            partial,
        }) => {
            assert_eq!(tripped_at, 5);
            assert_eq!(point_count, 10);
            assert_eq!(partial.len(), 5);
            assert!(partial.samples()[4].saturated);
            assert!(partial.samples()[..4].iter().all(|s| !s.saturated));
        }
        other => panic!("expected compliance trip, got {:?}", other),
    }
    assert_eq!(controller.state(), ControllerState::Configured);
}

#[tokio::test]
async fn test_continue_policy_marks_saturated_point() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    controller.configure(plan(10)).await.unwrap();
    mock.trip_compliance_at(4);

    let data = controller.run_sweep().await.unwrap();
    assert_eq!(data.len(), 10);
    assert_eq!(data.saturated_count(), 1);
    assert!(data.samples()[4].saturated);
    assert_eq!(data.samples()[4].dependent.abs(), 1e-2);
}

#[tokio::test]
async fn test_short_fetch_is_incomplete() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    controller.configure(plan(10)).await.unwrap();
    mock.truncate_next_fetch(7);

    match controller.run_sweep().await {
        Err(SweepError::IncompleteSweepData {
            expected,
            received,
            partial,
        }) => {
            assert_eq!((expected, received), (10, 7));
            assert_eq!(partial.len(), 7);
        }
        other => panic!("expected incomplete data, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dual_sweep_reverse_is_exact_swap() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    let forward_plan = plan(9);

    let outcome = controller.run_dual_sweep(forward_plan.clone()).await.unwrap();
    let reverse = outcome.reverse.unwrap();

    assert_eq!(outcome.forward.direction(), Direction::Forward);
    assert_eq!(reverse.direction(), Direction::Reverse);
    assert_eq!(outcome.forward.samples()[0].independent, forward_plan.start());
    assert_eq!(reverse.samples()[0].independent, forward_plan.end());
    assert_eq!(reverse.samples()[8].independent, forward_plan.start());

    let applied = mock.applied_plan().unwrap();
    assert_eq!(applied.start(), forward_plan.end());
    assert_eq!(applied.end(), forward_plan.start());
    assert!(applied.is_reverse_of(&forward_plan));

    // Reverse configure strictly after the forward fetch
    let log = mock.call_log();
    let forward_fetch = log.iter().position(|c| c.starts_with("fetch")).unwrap();
    let reverse_configure = log.iter().rposition(|c| c.starts_with("configure")).unwrap();
    assert!(reverse_configure > forward_fetch);
}

#[tokio::test]
async fn test_dual_sweep_forward_failure_skips_reverse() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    mock.reject_next_configuration();

    let result = controller.run_dual_sweep(plan(9)).await;
    assert!(matches!(result, Err(SweepError::DeviceConfig(_))));
    assert!(!mock.call_log().iter().any(|c| c == "trigger"));
}

#[tokio::test]
async fn test_dual_sweep_reverse_failure_keeps_forward() {
    let mock = MockSourceMeter::new();
    let sink = Arc::new(RejectReverseConfiguration { mock: mock.clone() });
    let controller = SweepController::with_sink(mock.clone(), TimeoutEstimator::default(), sink);

    let outcome = controller.run_dual_sweep(plan(9)).await.unwrap();
    assert_eq!(outcome.forward.len(), 9);
    assert!(matches!(outcome.reverse, Err(SweepError::DeviceConfig(_))));
    // Forward plan restored after the rejected reverse configuration
    assert_eq!(mock.applied_plan(), Some(plan(9)));
    assert_eq!(controller.state(), ControllerState::Configured);
}

#[tokio::test(start_paused = true)]
async fn test_dual_sweep_cancelled_in_reverse_keeps_forward() {
    let mock = MockSourceMeter::new().with_point_time(Duration::from_millis(10));
    let sink = CancelOnTrigger::new(Direction::Reverse);
    let controller =
        SweepController::with_sink(mock.clone(), TimeoutEstimator::default(), sink.clone());

    let task = controller.start_dual_sweep(plan(9)).unwrap();
    sink.arm(task.canceller());
    let outcome = task.join().await.unwrap();

    assert_eq!(outcome.forward.len(), 9);
    assert_eq!(outcome.forward.direction(), Direction::Forward);
    assert!(matches!(outcome.reverse, Err(SweepError::Cancelled)));
    assert_eq!(mock.abort_count(), 1);
    assert_eq!(
        mock.call_log()
            .iter()
            .filter(|c| c.starts_with("fetch"))
            .count(),
        1
    );
    assert_eq!(controller.state(), ControllerState::Configured);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_configuration_never_triggers() {
    let mock = MockSourceMeter::new().with_configure_time(Duration::from_millis(200));
    let controller = SweepController::new(mock.clone(), TimeoutEstimator::default());

    let task = controller.start_planned_sweep(plan(9)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.cancel();
    assert!(matches!(task.join().await, Err(SweepError::Cancelled)));

    assert!(!mock.call_log().iter().any(|c| c == "trigger"));
    assert_eq!(controller.state(), ControllerState::Configured);
    assert_eq!(controller.run_sweep().await.unwrap().len(), 9);
}

#[tokio::test]
async fn test_planned_sweep_configures_then_sweeps() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    let data = controller
        .start_planned_sweep(plan(7))
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(data.len(), 7);
    assert_eq!(mock.applied_plan(), Some(plan(7)));
}

#[tokio::test(start_paused = true)]
async fn test_longest_plan_deadline_is_capped() {
    let mock = MockSourceMeter::new();
    let sink = RecordingSink::new();
    let controller = SweepController::with_sink(mock, TimeoutEstimator::default(), sink.clone());
    let longest = SweepParameters {
        point_count: MAX_POINT_COUNT as i64,
        step_delay: MAX_STEP_DELAY_S,
        ..params(2)
    }
    .validate()
    .unwrap();

    controller.configure(longest).await.unwrap();
    assert_eq!(controller.run_sweep().await.unwrap().len(), MAX_POINT_COUNT);
    assert!(sink.events().iter().any(|event| matches!(
        event,
        SweepEvent::Triggered { timeout, .. } if *timeout == MAX_SWEEP_TIMEOUT
    )));
}

#[tokio::test]
async fn test_close_twice_is_noop() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    controller.configure(plan(5)).await.unwrap();

    controller.close().await;
    controller.close().await;
    assert_eq!(controller.state(), ControllerState::Closed);
    assert!(mock.is_closed());
    assert_eq!(mock.close_count(), 1);
    assert!(matches!(
        controller.configure(plan(5)).await,
        Err(SweepError::SessionClosed)
    ));
    assert!(matches!(
        controller.run_sweep().await,
        Err(SweepError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_sweep_in_flight() {
    let (mock, controller) = mock_controller(Duration::from_millis(10));
    controller.configure(plan(21)).await.unwrap();

    let task = controller.start_sweep().unwrap();
    controller.close().await;
    assert!(matches!(task.join().await, Err(SweepError::Cancelled)));
    assert_eq!(controller.state(), ControllerState::Closed);
    assert!(mock.is_closed());
}

#[tokio::test]
async fn test_scoped_session_closes_on_error() {
    let (mock, controller) = mock_controller(Duration::ZERO);
    mock.reject_next_configuration();

    let result = controller
        .scoped(|c| async move {
            c.configure(plan(5)).await?;
            c.run_sweep().await
        })
        .await;
    assert!(matches!(result, Err(SweepError::DeviceConfig(_))));
    assert!(mock.is_closed());
}

#[tokio::test]
async fn test_state_changes_and_events_are_published() {
    let mock = MockSourceMeter::new();
    let sink = RecordingSink::new();
    let controller = SweepController::with_sink(mock, TimeoutEstimator::default(), sink.clone());
    let mut states = controller.subscribe();

    controller.configure(plan(5)).await.unwrap();
    assert!(states.has_changed().unwrap());
    assert_eq!(*states.borrow_and_update(), ControllerState::Configured);

    controller.run_sweep().await.unwrap();
    controller.close().await;
    assert_eq!(*states.borrow_and_update(), ControllerState::Closed);

    let events = sink.events();
    assert!(matches!(events[0], SweepEvent::Configured(_)));
    assert!(matches!(
        events[1],
        SweepEvent::Triggered {
            direction: Direction::Forward,
            point_count: 5,
            ..
        }
    ));
    assert!(matches!(events[2], SweepEvent::Fetched { samples: 5, .. }));
    assert_eq!(events.last(), Some(&SweepEvent::Closed));
}
