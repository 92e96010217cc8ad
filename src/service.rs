//! Operator-facing control surface.
//!
//! Queue management, run control and connectivity checks, mapped directly
//! onto the orchestrator and its collaborators. Transport layers (HTTP, CLI)
//! sit on top of this and add no protocol logic of their own.

use crate::error::RunRejected;
use crate::inspection::{InspectionOrchestrator, RunOptions, RunReport, RunState};
use crate::sensor::session::ParticleSensor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Reachability of the three external links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityReport {
    /// The agent answered a probe.
    pub robot: bool,
    /// The counter accepted a TCP connection.
    pub sensor: bool,
    /// The sink answered a trivial query.
    pub sink: bool,
}

/// Snapshot for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Run slot state.
    pub state: RunState,
    /// Points still waiting in the queue.
    pub queued: usize,
    /// Readings waiting in the offline buffer.
    pub buffered: usize,
    /// Report of the most recent finished run.
    pub last_run: Option<RunReport>,
}

/// Cloneable front for one orchestrator and the sensor it measures with.
#[derive(Clone)]
pub struct PatrolService {
    orchestrator: InspectionOrchestrator,
    sensor: Arc<dyn ParticleSensor>,
}

impl PatrolService {
    /// Wraps an orchestrator.
    pub fn new(orchestrator: InspectionOrchestrator, sensor: Arc<dyn ParticleSensor>) -> Self {
        Self {
            orchestrator,
            sensor,
        }
    }

    /// The wrapped orchestrator.
    pub fn orchestrator(&self) -> &InspectionOrchestrator {
        &self.orchestrator
    }

    /// Appends one point and returns the queue as it stands afterwards.
    pub fn append_point(&self, point: String) -> Vec<String> {
        info!(point = %point, "Point queued");
        let queue = self.orchestrator.queue();
        queue.append(point);
        queue.list()
    }

    /// Batch form of [`append_point`](Self::append_point); order is kept.
    pub fn append_points(&self, points: Vec<String>) -> Vec<String> {
        info!(count = points.len(), "Points queued");
        let queue = self.orchestrator.queue();
        queue.append_all(points);
        queue.list()
    }

    /// Queued points, next first.
    pub fn list_points(&self) -> Vec<String> {
        self.orchestrator.queue().list()
    }

    /// Empties the queue and returns how many points were dropped.
    pub fn clear_points(&self) -> usize {
        let dropped = self.orchestrator.queue().clear();
        info!(dropped, "Point queue cleared");
        dropped
    }

    /// Starts a run and detaches from it. Progress is visible through
    /// [`status`](Self::status).
    pub fn start_run(&self, options: RunOptions) -> Result<Uuid, RunRejected> {
        let handle = self.orchestrator.start(options)?;
        Ok(handle.run_id())
    }

    /// Asks the active run to stop. False when nothing is running.
    pub fn stop_run(&self) -> bool {
        self.orchestrator.stop()
    }

    /// Stops any active run and waits up to `grace` for it to wind down,
    /// end-of-run flush included. False when the run was still going.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.stop_run() {
            info!(grace_secs = grace.as_secs(), "Waiting for the active run to finish");
        }
        let idle = self.orchestrator.wait_idle(grace).await;
        if !idle {
            warn!(grace_secs = grace.as_secs(), "Run did not finish within the shutdown grace period");
        }
        idle
    }

    /// Snapshot of the run state and both queues.
    pub fn status(&self) -> StatusReport {
        StatusReport {
            state: self.orchestrator.run_state(),
            queued: self.orchestrator.queue().len(),
            buffered: self.orchestrator.buffer().len(),
            last_run: self.orchestrator.last_report(),
        }
    }

    /// Probes the robot, the sensor and the sink concurrently.
    pub async fn connectivity(&self) -> ConnectivityReport {
        let (robot, sensor, sink) = tokio::join!(
            self.orchestrator.link().is_connected(),
            self.sensor.is_connected(),
            self.orchestrator.sink().is_available(),
        );
        ConnectivityReport {
            robot,
            sensor,
            sink,
        }
    }
}
