//! The inspection run.
//!
//! One run walks the point queue: navigate to the point, wait for arrival,
//! measure with retries, persist every attempt and buffer whatever the sink
//! refuses. Cancellation is cooperative and observed before every robot
//! command, every arrival poll and every measurement attempt.

use crate::config::{MeasurementConfig, NavigationConfig, Settings};
use crate::error::{PatrolError, RunRejected};
use crate::error_recovery::{retry_transport, RetryPolicy, StepError};
use crate::inspection::queue::PointStore;
use crate::inspection::state::{RunLock, RunState, RunStateCell};
use crate::measurement::{AttemptRecorder, MeasurementRetrier, Reading};
use crate::persistence::{FlushReport, OfflineBuffer, ResultSink};
use crate::robot::channel::RobotLink;
use crate::robot::locator::UiLocator;
use crate::robot::protocol::Command;
use crate::robot::ui_tree::{TextLabelParser, UiTreeParser};
use crate::sensor::session::ParticleSensor;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Options for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Send readings to the result sink. Without it readings only appear in
    /// the run report.
    pub persist: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { persist: true }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The queue was drained.
    Completed,
    /// A stop request was observed at a checkpoint.
    Cancelled,
}

/// What happened to one dequeued point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PointStatus {
    /// Measured; `attempts` is the attempt number of the returned reading.
    Measured { attempts: u32, alarm_high: bool },
    /// The point label never showed up on screen.
    NotFound,
    /// The robot could not be driven through the menu.
    NavigationFailed,
    /// Every measurement attempt failed.
    NoReading,
    /// Cancelled while this point was in progress.
    Abandoned,
}

/// A dequeued point and what became of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointResult {
    /// Point label as queued.
    pub point: String,
    /// Result of visiting it.
    #[serde(flatten)]
    pub status: PointStatus,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Identifier assigned at start.
    pub run_id: Uuid,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Wall-clock start.
    pub started_at: DateTime<Local>,
    /// Wall-clock end, after the final flush.
    pub finished_at: DateTime<Local>,
    /// Every dequeued point in visiting order.
    pub points: Vec<PointResult>,
    /// Every attempt's reading, in the order produced.
    pub readings: Vec<Reading>,
    /// Attempts the sink accepted on the first try.
    pub persisted: usize,
    /// Attempts the sink refused, sent to the offline buffer.
    pub buffered: usize,
    /// End-of-run flush of the offline buffer.
    pub flush: FlushReport,
}

/// Handle to a started run.
///
/// Dropping the handle detaches the run; it keeps going until the queue
/// drains or [`InspectionOrchestrator::stop`] is called.
pub struct RunHandle {
    run_id: Uuid,
    inner: Arc<Inner>,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    /// Identifier of this run, as logged and reported.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Requests cancellation; takes effect at the next checkpoint.
    ///
    /// A no-op once this run has finished, even if another run is active.
    pub fn cancel(&self) {
        let active = locked(&self.inner.active);
        match active.as_ref() {
            Some(run) if run.run_id == self.run_id => {
                self.inner.state.request_stop();
                run.token.cancel();
            }
            _ => debug!(run_id = %self.run_id, "Run already finished, nothing to cancel"),
        }
    }

    /// Waits for the run to end. A panic in the run body becomes
    /// [`PatrolError::RunAborted`]; the single-flight lock is released either way.
    pub async fn join(self) -> Result<RunReport, PatrolError> {
        self.task
            .await
            .map_err(|e| PatrolError::RunAborted(e.to_string()))
    }
}

/// Sends every attempt to the sink and buffers refusals.
struct RunRecorder {
    sink: Arc<dyn ResultSink>,
    buffer: Arc<OfflineBuffer>,
    persist: bool,
    readings: Mutex<Vec<Reading>>,
    persisted: AtomicUsize,
    buffered: AtomicUsize,
}

#[async_trait]
impl AttemptRecorder for RunRecorder {
    async fn record(&self, reading: &Reading) {
        locked(&self.readings).push(reading.clone());
        if !self.persist {
            return;
        }
        match self.sink.save(std::slice::from_ref(reading)).await {
            Ok(()) => {
                self.persisted.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(point = %reading.point, attempt = reading.attempt, error = %err, "Persistence failed, buffering reading");
                self.buffer.push(reading.clone());
                self.buffered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

/// The run currently holding the single-flight slot.
struct ActiveRun {
    run_id: Uuid,
    token: CancellationToken,
}

/// Held by the run task. On drop, whether the body returned or panicked,
/// the active slot is cleared before the lock is released. Idle waiters
/// are woken last.
struct RunTenure {
    inner: Arc<Inner>,
    run_id: Uuid,
    lock: Option<RunLock>,
}

impl RunTenure {
    fn mark_stopped(&self) {
        if let Some(lock) = &self.lock {
            lock.mark_stopped();
        }
    }
}

impl Drop for RunTenure {
    fn drop(&mut self) {
        {
            let mut active = locked(&self.inner.active);
            if active.as_ref().is_some_and(|run| run.run_id == self.run_id) {
                *active = None;
            }
        }
        self.lock.take();
        self.inner.idle.send_replace(true);
    }
}

struct Inner {
    link: Arc<dyn RobotLink>,
    locator: UiLocator,
    retrier: MeasurementRetrier,
    sink: Arc<dyn ResultSink>,
    queue: Arc<dyn PointStore>,
    buffer: Arc<OfflineBuffer>,
    state: Arc<RunStateCell>,
    navigation: NavigationConfig,
    measurement: MeasurementConfig,
    active: Mutex<Option<ActiveRun>>,
    idle: watch::Sender<bool>,
    last_report: Mutex<Option<RunReport>>,
}

/// Single-flight inspection engine.
#[derive(Clone)]
pub struct InspectionOrchestrator {
    inner: Arc<Inner>,
}

impl InspectionOrchestrator {
    /// Engine using the agent's text dump format.
    pub fn new(
        settings: &Settings,
        link: Arc<dyn RobotLink>,
        sensor: Arc<dyn ParticleSensor>,
        sink: Arc<dyn ResultSink>,
        queue: Arc<dyn PointStore>,
    ) -> Self {
        Self::with_parser(settings, link, sensor, sink, queue, Arc::new(TextLabelParser))
    }

    /// Engine with a custom UI tree parser.
    pub fn with_parser(
        settings: &Settings,
        link: Arc<dyn RobotLink>,
        sensor: Arc<dyn ParticleSensor>,
        sink: Arc<dyn ResultSink>,
        queue: Arc<dyn PointStore>,
        parser: Arc<dyn UiTreeParser>,
    ) -> Self {
        let locator = UiLocator::new(link.clone(), parser, settings.navigation.scroll_cap)
            .with_settle_delay(settings.navigation.settle_delay());
        let retrier = MeasurementRetrier::new(
            sensor,
            settings.sensor.primary_channel,
            settings.measurement.retry_delay(),
        )
        .with_location(settings.sensor.room.clone(), settings.sensor.area.clone());

        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                link,
                locator,
                retrier,
                sink,
                queue,
                buffer: Arc::new(OfflineBuffer::new()),
                state: RunStateCell::new(),
                navigation: settings.navigation.clone(),
                measurement: settings.measurement.clone(),
                active: Mutex::new(None),
                idle,
                last_report: Mutex::new(None),
            }),
        }
    }

    /// Starts a run in the background.
    ///
    /// Rejected when a run is already active or the queue is empty.
    pub fn start(&self, options: RunOptions) -> Result<RunHandle, RunRejected> {
        let mut active = locked(&self.inner.active);
        let lock = self
            .inner
            .state
            .try_acquire()
            .ok_or(RunRejected::AlreadyRunning)?;
        if self.inner.queue.is_empty() {
            return Err(RunRejected::QueueEmpty);
        }

        let run_id = Uuid::new_v4();
        let token = CancellationToken::new();
        *active = Some(ActiveRun {
            run_id,
            token: token.clone(),
        });
        self.inner.idle.send_replace(false);
        drop(active);
        info!(%run_id, persist = options.persist, queued = self.inner.queue.len(), "Inspection run started");

        let tenure = RunTenure {
            inner: Arc::clone(&self.inner),
            run_id,
            lock: Some(lock),
        };
        let task = tokio::spawn(
            async move {
                let inner = Arc::clone(&tenure.inner);
                let report = inner.run(run_id, options, &token).await;
                if report.outcome == RunOutcome::Cancelled {
                    tenure.mark_stopped();
                }
                *locked(&inner.last_report) = Some(report.clone());
                drop(tenure);
                report
            }
            .instrument(info_span!("run", %run_id)),
        );

        Ok(RunHandle {
            run_id,
            inner: Arc::clone(&self.inner),
            task,
        })
    }

    /// Requests cancellation of the active run. False if none is running.
    ///
    /// Repeating the request while the run is still winding down is
    /// accepted and cancels the same token again.
    pub fn stop(&self) -> bool {
        let active = locked(&self.inner.active);
        let Some(run) = active.as_ref() else {
            return false;
        };
        let stopping = self.inner.state.request_stop()
            || self.inner.state.get() == RunState::StopRequested;
        if !stopping {
            return false;
        }
        run.token.cancel();
        info!(run_id = %run.run_id, "Stop requested");
        true
    }

    /// Waits until no run holds the single-flight slot. False if `limit`
    /// passed first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let mut idle = self.inner.idle.subscribe();
        let settled = tokio::time::timeout(limit, idle.wait_for(|idle| *idle))
            .await
            .map(|waited| waited.is_ok());
        matches!(settled, Ok(true))
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.inner.state.get()
    }

    /// Report of the most recently finished run.
    pub fn last_report(&self) -> Option<RunReport> {
        locked(&self.inner.last_report).clone()
    }

    /// The shared point queue.
    pub fn queue(&self) -> &Arc<dyn PointStore> {
        &self.inner.queue
    }

    /// Readings waiting for the sink to come back.
    pub fn buffer(&self) -> &Arc<OfflineBuffer> {
        &self.inner.buffer
    }

    /// The result sink.
    pub fn sink(&self) -> &Arc<dyn ResultSink> {
        &self.inner.sink
    }

    /// The robot link.
    pub fn link(&self) -> &Arc<dyn RobotLink> {
        &self.inner.link
    }
}

impl Inner {
    async fn run(&self, run_id: Uuid, options: RunOptions, cancel: &CancellationToken) -> RunReport {
        let started_at = Local::now();
        let recorder = RunRecorder {
            sink: self.sink.clone(),
            buffer: self.buffer.clone(),
            persist: options.persist,
            readings: Mutex::new(Vec::new()),
            persisted: AtomicUsize::new(0),
            buffered: AtomicUsize::new(0),
        };
        let mut points = Vec::new();

        if self.preamble(cancel).await.is_ok() {
            while !cancel.is_cancelled() {
                let Some(point) = self.queue.pop() else {
                    break;
                };
                let status = self.process_point(&point, &recorder, cancel).await;
                info!(point = %point, ?status, "Point finished");
                let abandoned = status == PointStatus::Abandoned;
                points.push(PointResult { point, status });
                if abandoned {
                    break;
                }
            }
        }

        let flush = if options.persist {
            let report = self.buffer.flush(self.sink.as_ref()).await;
            if report.still_buffered > 0 {
                error!(still_buffered = report.still_buffered, "Readings remain unsaved after flush");
            }
            report
        } else {
            FlushReport::default()
        };

        let outcome = if cancel.is_cancelled() {
            RunOutcome::Cancelled
        } else {
            RunOutcome::Completed
        };
        info!(?outcome, points = points.len(), "Inspection run finished");

        let readings = std::mem::take(&mut *locked(&recorder.readings));
        RunReport {
            run_id,
            outcome,
            started_at,
            finished_at: Local::now(),
            points,
            readings,
            persisted: recorder.persisted.load(Ordering::SeqCst),
            buffered: recorder.buffered.load(Ordering::SeqCst),
            flush,
        }
    }

    /// Returns to the launcher and opens the robot app. Only cancellation
    /// aborts the run here; a failed step is logged and the run goes on.
    async fn preamble(&self, cancel: &CancellationToken) -> Result<(), StepError> {
        for command in [&self.navigation.home_command, &self.navigation.app_command] {
            match self.step(command, cancel).await {
                Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                Err(StepError::Failed(err)) => {
                    warn!(command = %command, error = %err, "Preamble step failed");
                }
                Ok(()) => {}
            }
        }
        Ok(())
    }

    async fn process_point(
        &self,
        point: &str,
        recorder: &RunRecorder,
        cancel: &CancellationToken,
    ) -> PointStatus {
        for command in &self.navigation.menu_commands {
            match self.step(command, cancel).await {
                Ok(()) => {}
                Err(StepError::Cancelled) => return PointStatus::Abandoned,
                Err(StepError::Failed(err)) => {
                    warn!(point, command = %command, error = %err, "Menu navigation failed, skipping point");
                    return PointStatus::NavigationFailed;
                }
            }
        }

        if !self.locator.find_and_activate_until(point, cancel).await {
            if cancel.is_cancelled() {
                return PointStatus::Abandoned;
            }
            info!(point, "Point not found on screen, dropping it");
            return PointStatus::NotFound;
        }

        match self.step(&self.navigation.go_command, cancel).await {
            Ok(()) => {}
            Err(StepError::Cancelled) => return PointStatus::Abandoned,
            Err(StepError::Failed(err)) => {
                warn!(point, error = %err, "Go command failed, skipping point");
                return PointStatus::NavigationFailed;
            }
        }

        if !self.await_arrival(point, cancel).await {
            return PointStatus::Abandoned;
        }

        let reading = self
            .retrier
            .measure_with_retry(
                point,
                self.measurement.max_retries,
                self.measurement.ucl_limit,
                recorder,
                cancel,
            )
            .await;

        match reading {
            Some(reading) => PointStatus::Measured {
                attempts: reading.attempt,
                alarm_high: reading.alarm_high,
            },
            None if cancel.is_cancelled() => PointStatus::Abandoned,
            None => PointStatus::NoReading,
        }
    }

    /// Polls for the arrival marker. Hitting the ceiling counts as arrival.
    /// Returns false only when cancelled.
    async fn await_arrival(&self, point: &str, cancel: &CancellationToken) -> bool {
        let interval = self.navigation.arrival_poll_interval();
        if !pause(interval, cancel).await {
            return false;
        }

        for poll in 1..=self.navigation.arrival_max_polls {
            if cancel.is_cancelled() {
                return false;
            }
            if self.locator.is_present(&self.navigation.arrival_marker).await {
                info!(point, polls = poll, "Robot arrived");
                return true;
            }
            if !pause(interval, cancel).await {
                return false;
            }
        }

        warn!(point, max_polls = self.navigation.arrival_max_polls, "Arrival marker never appeared, measuring anyway");
        true
    }

    /// One robot command, retried through disconnects, then the settle delay.
    async fn step(&self, command: &str, cancel: &CancellationToken) -> Result<(), StepError> {
        let policy = RetryPolicy::for_navigation(&self.navigation);
        let link = &self.link;
        let request = Command::new(command);
        retry_transport(&policy, cancel, command, || {
            let request = &request;
            async move { link.send(request).await }
        })
        .await?;

        if pause(self.navigation.settle_delay(), cancel).await {
            Ok(())
        } else {
            Err(StepError::Cancelled)
        }
    }
}

/// Sleeps unless cancelled first. False when cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
