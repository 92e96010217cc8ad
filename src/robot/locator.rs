//! Scroll-and-search over the robot's on-screen lists.
//!
//! Elements are addressable only by label, and destination lists can be
//! longer than one screen. The search checks the current position, then scrolls
//! forward at most `scroll_cap` pages, then backward at most `scroll_cap`
//! pages, checking after every step. A scroll the agent reports as impossible
//! ends that direction early. Worst case is `2 * scroll_cap + 1` UI dumps.

use crate::robot::channel::RobotLink;
use crate::robot::protocol::{self, Command};
use crate::robot::ui_tree::UiTreeParser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn command(self) -> Command {
        match self {
            Direction::Forward => Command::scroll_forward(),
            Direction::Backward => Command::scroll_backward(),
        }
    }
}

/// Finds (and optionally clicks) named UI elements.
pub struct UiLocator {
    link: Arc<dyn RobotLink>,
    parser: Arc<dyn UiTreeParser>,
    scroll_cap: u32,
    settle: Duration,
}

impl UiLocator {
    /// Locator that scrolls at most `scroll_cap` steps each way.
    pub fn new(link: Arc<dyn RobotLink>, parser: Arc<dyn UiTreeParser>, scroll_cap: u32) -> Self {
        Self {
            link,
            parser,
            scroll_cap,
            settle: Duration::ZERO,
        }
    }

    /// Pause after each scroll and after a click, letting the screen redraw.
    pub fn with_settle_delay(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Whether `name` is a visible label right now. A failed dump reads as absent.
    pub async fn is_present(&self, name: &str) -> bool {
        match self.link.send(&Command::full_ui()).await {
            Ok(dump) => self.parser.parse(&dump).contains(name),
            Err(err) => {
                debug!(element = name, error = %err, "UI dump unavailable");
                false
            }
        }
    }

    /// Scrolls until `name` is visible and clicks it.
    ///
    /// Returns `false` when both scroll passes are exhausted. That is an
    /// expected outcome, not an error.
    pub async fn find_and_activate(&self, name: &str) -> bool {
        self.find_and_activate_until(name, &CancellationToken::new())
            .await
    }

    /// Like [`find_and_activate`](Self::find_and_activate), but gives up at
    /// the next step once `cancel` fires.
    pub async fn find_and_activate_until(&self, name: &str, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        if self.is_present(name).await {
            return self.activate(name).await;
        }

        for direction in [Direction::Forward, Direction::Backward] {
            if let Some(found) = self.search(name, direction, cancel).await {
                return found;
            }
        }

        info!(element = name, scroll_cap = self.scroll_cap, "Element not found after both scroll passes");
        false
    }

    /// One bounded pass. `Some` ends the whole search, `None` means keep going.
    async fn search(
        &self,
        name: &str,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> Option<bool> {
        for step in 0..self.scroll_cap {
            if cancel.is_cancelled() {
                return Some(false);
            }
            match self.link.send(&direction.command()).await {
                Ok(reply) if protocol::is_scroll_exhausted(&reply) => {
                    debug!(element = name, ?direction, step, "No further scroll possible");
                    return None;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(element = name, ?direction, error = %err, "Scroll failed");
                    return None;
                }
            }
            self.pause().await;

            if self.is_present(name).await {
                debug!(element = name, ?direction, step, "Element found after scrolling");
                return Some(self.activate(name).await);
            }
        }
        None
    }

    async fn activate(&self, name: &str) -> bool {
        match self.link.send(&Command::activate(name)).await {
            Ok(_) => {
                self.pause().await;
                true
            }
            Err(err) => {
                warn!(element = name, error = %err, "Click failed");
                false
            }
        }
    }

    async fn pause(&self) {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedRobot;
    use crate::robot::ui_tree::TextLabelParser;

    fn locator(robot: &Arc<ScriptedRobot>, cap: u32) -> UiLocator {
        UiLocator::new(robot.clone(), Arc::new(TextLabelParser), cap)
    }

    #[tokio::test]
    async fn clicks_element_on_first_screen() {
        let robot = Arc::new(ScriptedRobot::with_pages(vec![vec!["P1", "P2"]]));
        assert!(locator(&robot, 10).find_and_activate("P2").await);
        assert_eq!(robot.sent(), vec!["getFullUI", "P2"]);
    }

    #[tokio::test]
    async fn scrolls_forward_to_find_element() {
        let robot = Arc::new(ScriptedRobot::with_pages(vec![
            vec!["P1"],
            vec!["P2"],
            vec!["P3"],
        ]));
        assert!(locator(&robot, 10).find_and_activate("P3").await);
        assert_eq!(
            robot.sent(),
            vec!["getFullUI", "scrollDown", "getFullUI", "scrollDown", "getFullUI", "P3"]
        );
    }

    #[tokio::test]
    async fn scrolls_backward_when_list_starts_mid_way() {
        let robot = Arc::new(
            ScriptedRobot::with_pages(vec![vec!["P1"], vec!["P2"], vec!["P3"]]).starting_at(2),
        );
        assert!(locator(&robot, 10).find_and_activate("P1").await);
        let sent = robot.sent();
        assert_eq!(sent.last().map(String::as_str), Some("P1"));
        assert_eq!(sent.iter().filter(|c| *c == "scrollUp").count(), 2);
    }

    #[tokio::test]
    async fn missing_element_is_bounded() {
        // endless list: every scroll succeeds, nothing ever matches
        let robot = Arc::new(ScriptedRobot::endless());
        let cap = 4;
        assert!(!locator(&robot, cap).find_and_activate("nowhere").await);

        let sent = robot.sent();
        let dumps = sent.iter().filter(|c| *c == "getFullUI").count() as u32;
        let scrolls = sent.iter().filter(|c| c.starts_with("scroll")).count() as u32;
        assert_eq!(dumps, 2 * cap + 1);
        assert_eq!(scrolls, 2 * cap);
        assert!(!sent.iter().any(|c| c == "nowhere"));
    }

    #[tokio::test]
    async fn exhausted_scroll_ends_pass_early() {
        let robot = Arc::new(ScriptedRobot::with_pages(vec![vec!["P1"]]));
        assert!(!locator(&robot, 10).find_and_activate("P9").await);
        assert_eq!(
            robot.sent(),
            vec!["getFullUI", "scrollDown", "scrollUp"]
        );
    }

    #[tokio::test]
    async fn disconnected_robot_is_not_found() {
        let robot = Arc::new(ScriptedRobot::with_pages(vec![vec!["P1"]]));
        robot.set_connected(false);
        let loc = locator(&robot, 10);
        assert!(!loc.is_present("P1").await);
        assert!(!loc.find_and_activate("P1").await);
    }

    #[tokio::test]
    async fn cancelled_search_sends_nothing() {
        let robot = Arc::new(ScriptedRobot::with_pages(vec![vec!["P1"]]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!locator(&robot, 10).find_and_activate_until("P1", &cancel).await);
        assert!(robot.sent().is_empty());
    }
}
