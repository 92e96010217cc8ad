//! Operator-visible log lines for retries, search misses and the offline buffer.

use async_trait::async_trait;
use dust_patrol::measurement::{AttemptRecorder, Channel, MeasurementRetrier, Reading};
use dust_patrol::mock::{MemorySink, MockSensor, ScriptedRobot};
use dust_patrol::persistence::OfflineBuffer;
use dust_patrol::robot::{TextLabelParser, UiLocator};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

struct Discard;

#[async_trait]
impl AttemptRecorder for Discard {
    async fn record(&self, _reading: &Reading) {}
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn over_limit_attempts_are_logged_with_point() {
    let retrier = MeasurementRetrier::new(
        Arc::new(MockSensor::scripted([Some(500), None, Some(20)])),
        Channel::Um05,
        Duration::from_secs(2),
    );

    let reading = retrier
        .measure_with_retry("CR14_R3", 3, 100, &Discard, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(reading.attempt, 3);
    assert!(logs_contain("Reading exceeded UCL"));
    assert!(logs_contain("Measurement failed"));
    assert!(logs_contain("Reading within limit"));
    assert!(logs_contain("CR14_R3"));
}

#[tokio::test(start_paused = true)]
#[traced_test]
async fn search_miss_is_reported() {
    let locator = UiLocator::new(
        Arc::new(ScriptedRobot::with_pages(vec![vec!["A"], vec!["B"]])),
        Arc::new(TextLabelParser),
        3,
    );

    assert!(!locator.find_and_activate("CR99_R1").await);
    assert!(logs_contain("Element not found after both scroll passes"));
}

#[tokio::test]
#[traced_test]
async fn flush_failures_are_logged_and_kept() {
    let sink = MemorySink::new();
    sink.set_failing(true);
    let buffer = OfflineBuffer::new();
    let retrier = MeasurementRetrier::new(Arc::new(MockSensor::steady(10)), Channel::Um05, Duration::ZERO);

    struct Buffering<'a>(&'a OfflineBuffer);

    #[async_trait]
    impl AttemptRecorder for Buffering<'_> {
        async fn record(&self, reading: &Reading) {
            self.0.push(reading.clone());
        }
    }

    retrier
        .measure_with_retry("CR14_R4", 1, 100, &Buffering(&buffer), &CancellationToken::new())
        .await
        .unwrap();
    let report = buffer.flush(&sink).await;

    assert_eq!(report.still_buffered, 1);
    assert_eq!(buffer.len(), 1);
    assert!(logs_contain("Still unable to store reading"));
}
