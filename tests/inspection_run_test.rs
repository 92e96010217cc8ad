//! End-to-end inspection runs against the in-process doubles.

use dust_patrol::config::Settings;
use dust_patrol::error::RunRejected;
use dust_patrol::inspection::{
    InspectionOrchestrator, PointQueue, PointStatus, PointStore, RunOptions, RunOutcome, RunState,
};
use dust_patrol::mock::{MemorySink, MockSensor, ScriptedRobot};
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    orchestrator: InspectionOrchestrator,
    robot: Arc<ScriptedRobot>,
    sensor: Arc<MockSensor>,
    sink: Arc<MemorySink>,
    queue: Arc<PointQueue>,
}

fn rig_with(settings: &Settings, robot: ScriptedRobot, sensor: MockSensor, sink: MemorySink, points: &[&str]) -> Rig {
    let robot = Arc::new(robot);
    let sensor = Arc::new(sensor);
    let sink = Arc::new(sink);
    let queue: Arc<PointQueue> = Arc::new(points.iter().copied().collect());
    let orchestrator = InspectionOrchestrator::new(
        settings,
        robot.clone(),
        sensor.clone(),
        sink.clone(),
        queue.clone(),
    );
    Rig {
        orchestrator,
        robot,
        sensor,
        sink,
        queue,
    }
}

fn rig(robot: ScriptedRobot, sensor: MockSensor, sink: MemorySink, points: &[&str]) -> Rig {
    rig_with(&Settings::default(), robot, sensor, sink, points)
}

fn two_points() -> ScriptedRobot {
    ScriptedRobot::with_pages(vec![vec!["P1", "P2"]])
}

#[tokio::test(start_paused = true)]
async fn clean_points_are_measured_once_and_saved() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::new(), &["P1", "P2"]);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.points.len(), 2);
    for result in &report.points {
        assert_eq!(
            result.status,
            PointStatus::Measured {
                attempts: 1,
                alarm_high: false
            }
        );
    }
    assert_eq!(rig.sink.saved().len(), 2);
    assert_eq!(report.persisted, 2);
    assert!(rig.orchestrator.buffer().is_empty());
    assert!(rig.queue.is_empty());
    assert_eq!(rig.sensor.cycles(), 2);
    assert_eq!(rig.orchestrator.run_state(), RunState::Idle);
}

#[tokio::test(start_paused = true)]
async fn command_sequence_for_one_point() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::new(), &["P2"]);

    rig.orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(
        rig.robot.sent(),
        vec!["goHome", "Peanut", "clickBackButton", "Direct", "getFullUI", "P2", "Go", "getFullUI"]
    );
}

#[tokio::test(start_paused = true)]
async fn dirty_point_uses_every_attempt_and_raises_alarm() {
    let rig = rig(two_points(), MockSensor::steady(150), MemorySink::new(), &["P1"]);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(
        report.points[0].status,
        PointStatus::Measured {
            attempts: 3,
            alarm_high: true
        }
    );
    let saved = rig.sink.saved();
    assert_eq!(saved.len(), 3);
    assert!(saved.iter().all(|r| r.alarm_high));
    assert_eq!(
        saved.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[tokio::test(start_paused = true)]
async fn recovery_after_high_reading_stops_early() {
    let rig = rig(
        two_points(),
        MockSensor::scripted([Some(150), Some(40)]),
        MemorySink::new(),
        &["P1"],
    );

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(
        report.points[0].status,
        PointStatus::Measured {
            attempts: 2,
            alarm_high: false
        }
    );
    assert_eq!(report.readings.len(), 2);
    assert!(report.readings[0].alarm_high);
    assert!(!report.readings[1].alarm_high);
    assert_eq!(rig.sensor.cycles(), 2);
}

#[tokio::test(start_paused = true)]
async fn sensor_failures_leave_point_without_reading() {
    let rig = rig(two_points(), MockSensor::failing(), MemorySink::new(), &["P1"]);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.points[0].status, PointStatus::NoReading);
    assert_eq!(rig.sensor.cycles(), 3);
    assert!(rig.sink.saved().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_arrival_abandons_point() {
    let rig = rig(
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1", "P2"],
    );

    let handle = rig.orchestrator.start(RunOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(rig.orchestrator.run_state(), RunState::Running);
    handle.cancel();
    let report = handle.join().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.points.len(), 1);
    assert_eq!(report.points[0].status, PointStatus::Abandoned);
    assert_eq!(rig.sensor.cycles(), 0);
    // the abandoned point is not requeued, the untouched one stays
    assert_eq!(rig.queue.list(), vec!["P2"]);
    assert_eq!(rig.orchestrator.run_state(), RunState::Idle);
}

#[tokio::test(start_paused = true)]
async fn stop_through_orchestrator_cancels_active_run() {
    let rig = rig(
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );

    let handle = rig.orchestrator.start(RunOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rig.orchestrator.stop());
    assert_eq!(rig.orchestrator.run_state(), RunState::StopRequested);

    let report = handle.join().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert!(!rig.orchestrator.stop());
    let last = rig.orchestrator.last_report().unwrap();
    assert_eq!(last.run_id, report.run_id);
}

#[tokio::test(start_paused = true)]
async fn refused_save_is_buffered_then_flushed() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::failing_first(1), &["P1"]);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.persisted, 0);
    assert_eq!(report.buffered, 1);
    assert_eq!(report.flush.flushed, 1);
    assert_eq!(report.flush.still_buffered, 0);
    assert_eq!(rig.sink.saved().len(), 1);
    assert!(rig.orchestrator.buffer().is_empty());
}

#[tokio::test(start_paused = true)]
async fn buffered_readings_survive_until_a_later_run() {
    let sink = MemorySink::new();
    sink.set_failing(true);
    let rig = rig(two_points(), MockSensor::steady(50), sink, &["P1"]);

    let first = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();
    assert_eq!(first.flush.still_buffered, 1);
    assert_eq!(rig.orchestrator.buffer().len(), 1);

    rig.sink.set_failing(false);
    rig.queue.append("P2".into());
    let second = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(second.persisted, 1);
    assert_eq!(second.flush.flushed, 1);
    let points: Vec<String> = rig.sink.saved().into_iter().map(|r| r.point).collect();
    assert_eq!(points, vec!["P2", "P1"]);
    assert!(rig.orchestrator.buffer().is_empty());
}

#[tokio::test(start_paused = true)]
async fn points_appended_mid_run_are_processed() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::new(), &["P1"]);

    let handle = rig.orchestrator.start(RunOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    rig.queue.append("P2".into());
    let report = handle.join().await.unwrap();

    let visited: Vec<&str> = report.points.iter().map(|p| p.point.as_str()).collect();
    assert_eq!(visited, vec!["P1", "P2"]);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_running() {
    let rig = rig(
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );

    let handle = rig.orchestrator.start(RunOptions::default()).unwrap();
    assert!(matches!(
        rig.orchestrator.start(RunOptions::default()),
        Err(RunRejected::AlreadyRunning)
    ));
    handle.cancel();
    handle.join().await.unwrap();

    rig.queue.append("P1".into());
    let again = rig.orchestrator.start(RunOptions::default());
    assert!(again.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_exactly_one() {
    let mut settings = Settings::default();
    settings.navigation.settle_delay_ms = 0;
    settings.navigation.arrival_poll_interval_ms = 20;
    settings.navigation.arrival_max_polls = u32::MAX;
    let rig = rig_with(
        &settings,
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let attempts = (0..8).map(|_| {
        let orchestrator = rig.orchestrator.clone();
        let barrier = barrier.clone();
        tokio::spawn(async move {
            barrier.wait().await;
            orchestrator.start(RunOptions::default())
        })
    });
    let results: Vec<_> = futures::future::join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(RunRejected::AlreadyRunning)))
        .count();
    assert_eq!(rejected, 7);

    let handle = results.into_iter().find_map(Result::ok).unwrap();
    handle.cancel();
    let report = handle.join().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn transient_disconnects_are_ridden_out() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::new(), &["P1"]);
    rig.robot.fail_next(2);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(matches!(report.points[0].status, PointStatus::Measured { .. }));
    assert_eq!(rig.robot.sent().first().map(String::as_str), Some("goHome"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_robot_fails_navigation_and_finishes() {
    let rig = rig(two_points(), MockSensor::steady(50), MemorySink::new(), &["P1"]);
    rig.robot.set_connected(false);

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.points[0].status, PointStatus::NavigationFailed);
    assert_eq!(rig.sensor.cycles(), 0);
    assert!(rig.robot.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn missing_arrival_marker_measures_after_ceiling() {
    let mut settings = Settings::default();
    settings.navigation.arrival_max_polls = 5;
    let rig = rig_with(
        &settings,
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );

    let report = rig
        .orchestrator
        .start(RunOptions::default())
        .unwrap()
        .join()
        .await
        .unwrap();

    assert!(matches!(report.points[0].status, PointStatus::Measured { .. }));
    let dumps = rig.robot.sent().iter().filter(|c| *c == "getFullUI").count();
    // one to find the point, five arrival polls
    assert_eq!(dumps, 6);
}

#[tokio::test(start_paused = true)]
async fn finished_run_handle_cannot_cancel_the_next_run() {
    let rig = rig(
        two_points().arrives_after(Some(1)),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );
    let first = rig.orchestrator.start(RunOptions::default()).unwrap();
    // the handle outlives its run
    assert!(rig.orchestrator.wait_idle(Duration::from_secs(600)).await);

    rig.queue.append("P2".into());
    let second = rig.orchestrator.start(RunOptions::default()).unwrap();
    first.cancel();
    assert_eq!(rig.orchestrator.run_state(), RunState::Running);

    assert!(rig.orchestrator.stop());
    assert_eq!(rig.orchestrator.run_state(), RunState::StopRequested);
    let report = second.join().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(first.join().await.unwrap().outcome, RunOutcome::Completed);
}

#[tokio::test(start_paused = true)]
async fn repeated_stop_is_accepted_until_the_run_ends() {
    let rig = rig(
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );

    let handle = rig.orchestrator.start(RunOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rig.orchestrator.stop());
    assert!(rig.orchestrator.stop());

    handle.join().await.unwrap();
    assert!(!rig.orchestrator.stop());
}

#[tokio::test(start_paused = true)]
async fn wait_idle_follows_a_detached_run() {
    let rig = rig(
        two_points().arrives_after(None),
        MockSensor::steady(50),
        MemorySink::new(),
        &["P1"],
    );
    assert!(rig.orchestrator.wait_idle(Duration::ZERO).await);

    drop(rig.orchestrator.start(RunOptions::default()).unwrap());
    assert!(!rig.orchestrator.wait_idle(Duration::from_secs(10)).await);

    assert!(rig.orchestrator.stop());
    assert!(rig.orchestrator.wait_idle(Duration::from_secs(10)).await);
    assert_eq!(rig.orchestrator.run_state(), RunState::Idle);
    let last = rig.orchestrator.last_report().unwrap();
    assert_eq!(last.outcome, RunOutcome::Cancelled);
}
