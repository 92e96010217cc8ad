//! Readings and the bounded-retry measurement policy.
//!
//! A point is measured up to `max_retries` times. The first attempt whose
//! primary channel is within the upper control limit (UCL) is accepted; if
//! none is, the last successful attempt is returned with `alarm_high` set.
//! Every reading, accepted or not, is handed to an [`AttemptRecorder`] as
//! soon as it exists.

use crate::sensor::session::ParticleSensor;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Particle-size bucket reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// 0.1 µm
    Um01,
    /// 0.2 µm
    Um02,
    /// 0.3 µm
    Um03,
    /// 0.5 µm
    Um05,
    /// 0.7 µm
    Um07,
    /// 1.0 µm
    Um10,
}

impl Channel {
    /// Every channel, smallest size first.
    pub const ALL: [Channel; 6] = [
        Channel::Um01,
        Channel::Um02,
        Channel::Um03,
        Channel::Um05,
        Channel::Um07,
        Channel::Um10,
    ];

    /// Column and config name of the channel.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Um01 => "um01",
            Channel::Um02 => "um02",
            Channel::Um03 => "um03",
            Channel::Um05 => "um05",
            Channel::Um07 => "um07",
            Channel::Um10 => "um10",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts for every channel of one completed sensor record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleCounts {
    pub um01: u32,
    pub um02: u32,
    pub um03: u32,
    pub um05: u32,
    pub um07: u32,
    pub um10: u32,
}

impl ParticleCounts {
    /// Same count on every channel. Mostly useful for simulations.
    pub fn uniform(value: u32) -> Self {
        Self {
            um01: value,
            um02: value,
            um03: value,
            um05: value,
            um07: value,
            um10: value,
        }
    }

    /// Count on one channel.
    pub fn get(&self, channel: Channel) -> u32 {
        match channel {
            Channel::Um01 => self.um01,
            Channel::Um02 => self.um02,
            Channel::Um03 => self.um03,
            Channel::Um05 => self.um05,
            Channel::Um07 => self.um07,
            Channel::Um10 => self.um10,
        }
    }

    /// Overwrites one channel.
    pub fn set(&mut self, channel: Channel, value: u32) {
        let slot = match channel {
            Channel::Um01 => &mut self.um01,
            Channel::Um02 => &mut self.um02,
            Channel::Um03 => &mut self.um03,
            Channel::Um05 => &mut self.um05,
            Channel::Um07 => &mut self.um07,
            Channel::Um10 => &mut self.um10,
        };
        *slot = value;
    }
}

/// One measurement attempt at one point. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Local time the cycle returned.
    pub measured_at: DateTime<Local>,
    /// Cleanroom the sensor is installed in.
    pub room: String,
    /// Area within the room.
    pub area: String,
    /// Point label the robot was sent to.
    pub point: String,
    /// Attempt number, counting from 1.
    pub attempt: u32,
    /// Counts on every channel.
    pub counts: ParticleCounts,
    /// The counter reported a completed sampling run.
    pub running_state: bool,
    /// The primary channel exceeded the UCL.
    pub alarm_high: bool,
}

/// Where each attempt's reading goes as soon as it exists.
#[async_trait]
pub trait AttemptRecorder: Send + Sync {
    /// Called once per attempt, accepted or not. Must not fail the cycle.
    async fn record(&self, reading: &Reading);
}

/// Why [`MeasurementRetrier::measure_with_retry`] stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    OverLimit,
}

/// Bounded-retry wrapper around a particle sensor.
pub struct MeasurementRetrier {
    sensor: Arc<dyn ParticleSensor>,
    primary: Channel,
    retry_delay: Duration,
    room: String,
    area: String,
}

impl MeasurementRetrier {
    /// Retrier judging readings on `primary`, pausing `retry_delay`
    /// between attempts.
    pub fn new(sensor: Arc<dyn ParticleSensor>, primary: Channel, retry_delay: Duration) -> Self {
        Self {
            sensor,
            primary,
            retry_delay,
            room: String::new(),
            area: String::new(),
        }
    }

    /// Location metadata stamped on every reading.
    pub fn with_location(mut self, room: impl Into<String>, area: impl Into<String>) -> Self {
        self.room = room.into();
        self.area = area.into();
        self
    }

    /// Measures `point` at most `max_retries` times.
    ///
    /// Stops at the first reading whose primary channel is `<= ucl`. A sensor
    /// failure counts as an attempt and yields no reading. Cancellation is
    /// checked before every attempt and interrupts the pause between them.
    ///
    /// Returns the accepted reading, or the last one produced when every
    /// reading exceeded the limit. `None` means no attempt produced a reading.
    pub async fn measure_with_retry(
        &self,
        point: &str,
        max_retries: u32,
        ucl: u32,
        recorder: &dyn AttemptRecorder,
        cancel: &CancellationToken,
    ) -> Option<Reading> {
        let mut last = None;

        for attempt in 1..=max_retries {
            if cancel.is_cancelled() {
                info!(point, attempt, "Measurement cancelled");
                break;
            }
            info!(point, attempt, max_retries, "Starting measurement");

            match self.sensor.start_measurement_cycle().await {
                Ok(counts) => {
                    let value = counts.get(self.primary);
                    let verdict = if value <= ucl {
                        Verdict::Accepted
                    } else {
                        Verdict::OverLimit
                    };
                    let reading = Reading {
                        measured_at: Local::now(),
                        room: self.room.clone(),
                        area: self.area.clone(),
                        point: point.to_string(),
                        attempt,
                        counts,
                        running_state: true,
                        alarm_high: verdict == Verdict::OverLimit,
                    };
                    recorder.record(&reading).await;

                    if verdict == Verdict::Accepted {
                        info!(point, attempt, value, ucl, channel = %self.primary, "Reading within limit");
                        return Some(reading);
                    }
                    warn!(point, attempt, value, ucl, channel = %self.primary, "Reading exceeded UCL");
                    last = Some(reading);
                }
                Err(err) => {
                    warn!(point, attempt, error = %err, "Measurement failed");
                }
            }

            if attempt < max_retries {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.retry_delay) => {}
                }
            }
        }

        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockSensor;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Reading>>);

    #[async_trait]
    impl AttemptRecorder for Collect {
        async fn record(&self, reading: &Reading) {
            self.0.lock().unwrap().push(reading.clone());
        }
    }

    fn retrier(sensor: Arc<MockSensor>) -> MeasurementRetrier {
        MeasurementRetrier::new(sensor, Channel::Um05, Duration::from_secs(2))
            .with_location("CR11", "1K")
    }

    #[tokio::test(start_paused = true)]
    async fn accepts_first_reading_within_limit() {
        let sensor = Arc::new(MockSensor::steady(50));
        let recorder = Collect::default();
        let cancel = CancellationToken::new();

        let reading = retrier(sensor.clone())
            .measure_with_retry("P1", 3, 100, &recorder, &cancel)
            .await
            .unwrap();

        assert_eq!(reading.attempt, 1);
        assert!(!reading.alarm_high);
        assert_eq!(reading.room, "CR11");
        assert_eq!(sensor.cycles(), 1);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_and_flags_last_reading() {
        let sensor = Arc::new(MockSensor::steady(150));
        let recorder = Collect::default();
        let cancel = CancellationToken::new();

        let reading = retrier(sensor.clone())
            .measure_with_retry("P1", 3, 100, &recorder, &cancel)
            .await
            .unwrap();

        assert_eq!(reading.attempt, 3);
        assert!(reading.alarm_high);
        assert_eq!(sensor.cycles(), 3);
        let recorded = recorder.0.lock().unwrap();
        let attempts: Vec<u32> = recorded.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_as_soon_as_a_reading_is_within_limit() {
        let sensor = Arc::new(MockSensor::scripted([Some(150), Some(90), Some(10)]));
        let recorder = Collect::default();
        let cancel = CancellationToken::new();

        let reading = retrier(sensor.clone())
            .measure_with_retry("P1", 5, 100, &recorder, &cancel)
            .await
            .unwrap();

        assert_eq!(reading.attempt, 2);
        assert_eq!(sensor.cycles(), 2);
        assert!(recorder.0.lock().unwrap()[0].alarm_high);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_failures_count_as_attempts() {
        let sensor = Arc::new(MockSensor::scripted([None, None, Some(40)]));
        let recorder = Collect::default();
        let cancel = CancellationToken::new();

        let reading = retrier(sensor.clone())
            .measure_with_retry("P1", 3, 100, &recorder, &cancel)
            .await
            .unwrap();

        assert_eq!(reading.attempt, 3);
        assert_eq!(recorder.0.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_failures_produce_nothing() {
        let sensor = Arc::new(MockSensor::failing());
        let recorder = Collect::default();
        let cancel = CancellationToken::new();

        let result = retrier(sensor.clone())
            .measure_with_retry("P1", 3, 100, &recorder, &cancel)
            .await;

        assert!(result.is_none());
        assert_eq!(sensor.cycles(), 3);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_next_attempt() {
        let sensor = Arc::new(MockSensor::steady(150));
        let recorder = Collect::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = retrier(sensor.clone())
            .measure_with_retry("P1", 3, 100, &recorder, &cancel)
            .await;

        assert!(result.is_none());
        assert_eq!(sensor.cycles(), 0);
    }

    #[test]
    fn channel_names_match_serde() {
        for channel in Channel::ALL {
            let json = serde_json::to_string(&channel).unwrap();
            assert_eq!(json, format!("\"{}\"", channel.as_str()));
        }
    }

    #[test]
    fn counts_get_and_set() {
        let mut counts = ParticleCounts::default();
        counts.set(Channel::Um07, 12);
        assert_eq!(counts.get(Channel::Um07), 12);
        assert_eq!(counts.get(Channel::Um05), 0);
    }
}
