//! In-process doubles for the robot, the sensor and the result sink.
//!
//! Used by the test suites and by `serve --simulate`. Each double logs what
//! it was asked to do and supports failure injection.

use crate::error::{ChannelError, PersistenceError, SensorError};
use crate::measurement::{ParticleCounts, Reading};
use crate::persistence::ResultSink;
use crate::robot::channel::RobotLink;
use crate::robot::protocol::{self, Command};
use crate::sensor::session::ParticleSensor;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Arrival marker and go button label used by the default navigation.
const DEFAULT_GO: &str = "Go";

#[derive(Debug)]
struct Screen {
    pages: Vec<Vec<String>>,
    /// Every scroll succeeds and every page is empty.
    endless: bool,
    position: usize,
    driving: bool,
    polls_while_driving: u32,
}

/// A robot agent whose screen is a list of scrollable pages.
///
/// Sending the go label starts a drive. While driving, UI dumps show nothing
/// until `arrives_after` dumps have been served, then show the go label again.
#[derive(Debug)]
pub struct ScriptedRobot {
    screen: Mutex<Screen>,
    sent: Mutex<Vec<String>>,
    connected: AtomicBool,
    fail_next: AtomicU32,
    go_label: String,
    arrives_after: Option<u32>,
}

impl ScriptedRobot {
    /// Robot whose list screen shows `pages`, one scroll step per page.
    pub fn with_pages<S: Into<String>>(pages: Vec<Vec<S>>) -> Self {
        let pages = pages
            .into_iter()
            .map(|page| page.into_iter().map(Into::into).collect())
            .collect();
        Self::from_screen(Screen {
            pages,
            endless: false,
            position: 0,
            driving: false,
            polls_while_driving: 0,
        })
    }

    /// A list that never ends and never contains anything.
    pub fn endless() -> Self {
        Self::from_screen(Screen {
            pages: vec![Vec::new()],
            endless: true,
            position: 0,
            driving: false,
            polls_while_driving: 0,
        })
    }

    fn from_screen(screen: Screen) -> Self {
        Self {
            screen: Mutex::new(screen),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            go_label: DEFAULT_GO.to_string(),
            arrives_after: Some(1),
        }
    }

    /// Begin on `page` instead of the first one.
    pub fn starting_at(self, page: usize) -> Self {
        locked(&self.screen).position = page;
        self
    }

    /// Number of dumps after "go" before the marker shows. `None` never arrives.
    pub fn arrives_after(mut self, polls: Option<u32>) -> Self {
        self.arrives_after = polls;
        self
    }

    /// While false every command fails with `Disconnected`.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// The next `n` requests fail as if the agent had dropped.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Every delivered command, in order.
    pub fn sent(&self) -> Vec<String> {
        locked(&self.sent).clone()
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn dump(&self, screen: &mut Screen) -> String {
        let labels: Vec<&str> = if screen.driving {
            screen.polls_while_driving += 1;
            match self.arrives_after {
                Some(n) if screen.polls_while_driving >= n => vec![self.go_label.as_str()],
                _ => Vec::new(),
            }
        } else {
            screen
                .pages
                .get(screen.position)
                .map(|page| page.iter().map(String::as_str).collect())
                .unwrap_or_default()
        };

        let mut out = String::from("Class: android.widget.FrameLayout, Text: null, ID: root\n");
        for label in labels {
            out.push_str(&format!(
                "Class: android.widget.TextView, Text: {label}, ID: item\n"
            ));
        }
        out
    }

    fn scroll(&self, screen: &mut Screen, forward: bool, name: &str) -> String {
        let moved = if screen.endless {
            true
        } else if forward && screen.position + 1 < screen.pages.len() {
            screen.position += 1;
            true
        } else if !forward && screen.position > 0 {
            screen.position -= 1;
            true
        } else {
            false
        };
        if moved {
            format!("Scroll {name} completed successfully")
        } else {
            format!("{} node found", protocol::NO_SCROLL_MARKER)
        }
    }
}

#[async_trait]
impl RobotLink for ScriptedRobot {
    async fn send(&self, command: &Command) -> Result<String, ChannelError> {
        if !self.connected.load(Ordering::SeqCst) || self.take_failure() {
            return Err(ChannelError::Disconnected);
        }
        locked(&self.sent).push(command.text().to_string());

        let mut screen = locked(&self.screen);
        let reply = match command.text() {
            protocol::PING => protocol::PONG.to_string(),
            protocol::FULL_UI => self.dump(&mut screen),
            protocol::SCROLL_FORWARD => self.scroll(&mut screen, true, protocol::SCROLL_FORWARD),
            protocol::SCROLL_BACKWARD => self.scroll(&mut screen, false, protocol::SCROLL_BACKWARD),
            text => {
                if text == self.go_label {
                    screen.driving = true;
                    screen.polls_while_driving = 0;
                } else {
                    screen.driving = false;
                }
                format!("Command executed: {text}")
            }
        };
        Ok(reply)
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Particle sensor returning scripted primary values.
///
/// A scripted `None` is a failed cycle. Once the script runs out the
/// fallback repeats forever.
#[derive(Debug)]
pub struct MockSensor {
    script: Mutex<VecDeque<Option<u32>>>,
    fallback: Option<u32>,
    cycles: AtomicU32,
    connected: AtomicBool,
    dwell: Duration,
}

impl MockSensor {
    /// Every cycle reads `value` on all channels.
    pub fn steady(value: u32) -> Self {
        Self::build(VecDeque::new(), Some(value))
    }

    /// One entry per cycle; `None` is a failed cycle. The last entry repeats.
    pub fn scripted(values: impl IntoIterator<Item = Option<u32>>) -> Self {
        let script: VecDeque<Option<u32>> = values.into_iter().collect();
        let fallback = script.back().copied().flatten();
        Self::build(script, fallback)
    }

    /// Every cycle fails.
    pub fn failing() -> Self {
        Self::build(VecDeque::new(), None)
    }

    fn build(script: VecDeque<Option<u32>>, fallback: Option<u32>) -> Self {
        Self {
            script: Mutex::new(script),
            fallback,
            cycles: AtomicU32::new(0),
            connected: AtomicBool::new(true),
            dwell: Duration::ZERO,
        }
    }

    /// Simulated integration time per cycle.
    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell = dwell;
        self
    }

    /// Controls the reachability check only; cycles still run.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Cycles started so far.
    pub fn cycles(&self) -> u32 {
        self.cycles.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ParticleSensor for MockSensor {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn start_measurement_cycle(&self) -> Result<ParticleCounts, SensorError> {
        self.cycles.fetch_add(1, Ordering::SeqCst);
        if !self.dwell.is_zero() {
            tokio::time::sleep(self.dwell).await;
        }
        let next = locked(&self.script).pop_front().unwrap_or(self.fallback);
        next.map(ParticleCounts::uniform)
            .ok_or(SensorError::NoCompletedRecord)
    }
}

/// Result sink keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    saved: Mutex<Vec<Reading>>,
    fail_next: AtomicU32,
    failing: AtomicBool,
    save_calls: AtomicU32,
}

impl MemorySink {
    /// Sink that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// The first `n` saves fail, later ones succeed.
    pub fn failing_first(n: u32) -> Self {
        let sink = Self::default();
        sink.fail_next.store(n, Ordering::SeqCst);
        sink
    }

    /// Every save fails until [`set_failing(false)`](Self::set_failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything stored so far, in save order.
    pub fn saved(&self) -> Vec<Reading> {
        locked(&self.saved).clone()
    }

    /// Save calls, failed ones included.
    pub fn save_calls(&self) -> u32 {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    async fn save(&self, readings: &[Reading]) -> Result<(), PersistenceError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("memory sink refused".into()));
        }
        locked(&self.saved).extend_from_slice(readings);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.failing.load(Ordering::SeqCst)
    }
}
