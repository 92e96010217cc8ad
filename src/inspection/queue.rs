//! The point queue shared between operators and the run.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ordered store of points waiting to be inspected.
///
/// Duplicates are allowed and processed independently. `pop` is destructive:
/// a point handed out is never returned to the store.
pub trait PointStore: Send + Sync {
    /// Adds a point at the back.
    fn append(&self, point: String);
    /// Adds points at the back, keeping their order.
    fn append_all(&self, points: Vec<String>);
    /// Takes the next point.
    fn pop(&self) -> Option<String>;
    /// Next point without taking it.
    fn peek(&self) -> Option<String>;
    /// Copy of the queue, next first.
    fn list(&self) -> Vec<String>;
    /// Removes everything, returning how many points were dropped.
    fn clear(&self) -> usize;
    /// Points waiting.
    fn len(&self) -> usize;

    /// True when nothing is waiting.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory FIFO [`PointStore`].
#[derive(Debug, Default)]
pub struct PointQueue {
    points: Mutex<VecDeque<String>>,
}

impl PointQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn points(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.points.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Into<String>> FromIterator<S> for PointQueue {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            points: Mutex::new(iter.into_iter().map(Into::into).collect()),
        }
    }
}

impl PointStore for PointQueue {
    fn append(&self, point: String) {
        self.points().push_back(point);
    }

    fn append_all(&self, points: Vec<String>) {
        self.points().extend(points);
    }

    fn pop(&self) -> Option<String> {
        self.points().pop_front()
    }

    fn peek(&self) -> Option<String> {
        self.points().front().cloned()
    }

    fn list(&self) -> Vec<String> {
        self.points().iter().cloned().collect()
    }

    fn clear(&self) -> usize {
        let mut points = self.points();
        let dropped = points.len();
        points.clear();
        dropped
    }

    fn len(&self) -> usize {
        self.points().len()
    }
}
