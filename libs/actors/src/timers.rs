//! Per-object timer list
//!
//! Timers are ordered by id. A due timer produces one `TimerFired` message
//! per check; the owner pushes it into its own mailbox. `check` also returns
//! how long the worker may sleep before the next deadline.

use plant_config::defaults;
use plant_types::{Priority, TimerId};
use std::time::{Duration, Instant};
use tracing::debug;

/// Shortest interval a timer may be ordered with
pub const MIN_QUANTUM: Duration = Duration::from_millis(defaults::timers::MIN_QUANTUM_MS);

#[derive(Debug, Clone)]
struct TimerEntry {
    id: TimerId,
    interval: Duration,
    /// Remaining fires; `None` fires until cancelled
    ticks: Option<u32>,
    priority: Priority,
    deadline: Instant,
}

/// Result of one timer check
#[derive(Debug, Default)]
pub struct TimerCheck {
    pub due: Vec<(TimerId, Priority)>,
    /// Time until the next deadline; `None` when no timers are left
    pub sleep: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct TimerList {
    timers: Vec<TimerEntry>,
}

impl TimerList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Order, update or cancel (zero interval) a timer.
    ///
    /// Returns the effective interval: clamped to [`MIN_QUANTUM`], or zero
    /// when the timer was cancelled. `Some(0)` ticks is treated as a single
    /// fire.
    pub fn ask(
        &mut self,
        id: TimerId,
        interval: Duration,
        ticks: Option<u32>,
        priority: Priority,
        now: Instant,
    ) -> Duration {
        if interval.is_zero() {
            self.remove(id);
            return Duration::ZERO;
        }

        let interval = interval.max(MIN_QUANTUM);
        let entry = TimerEntry {
            id,
            interval,
            ticks: ticks.map(|n| n.max(1)),
            priority,
            deadline: now + interval,
        };

        match self.timers.iter_mut().find(|t| t.id == id) {
            Some(existing) => *existing = entry,
            None => self.timers.push(entry),
        }
        debug!(timer = %id, interval_ms = interval.as_millis() as u64, ?ticks, "Timer ordered");
        interval
    }

    pub fn remove(&mut self, id: TimerId) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| t.id != id);
        before != self.timers.len()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
    }

    /// Collect due timers, re-arm or retire them, and compute the sleep
    /// until the nearest remaining deadline.
    pub fn check(&mut self, now: Instant) -> TimerCheck {
        let mut due = Vec::new();

        for timer in self.timers.iter_mut() {
            if timer.deadline > now {
                continue;
            }
            due.push((timer.id, timer.priority));
            if let Some(ticks) = timer.ticks.as_mut() {
                *ticks = ticks.saturating_sub(1);
            }
            timer.deadline += timer.interval;
            if timer.deadline <= now {
                // missed periods are not replayed
                timer.deadline = now + timer.interval;
            }
        }
        self.timers.retain(|t| t.ticks != Some(0));

        let sleep = self
            .timers
            .iter()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min();

        TimerCheck { due, sleep }
    }
}
