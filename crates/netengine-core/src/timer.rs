//! Timer state owned by an engine context.
//!
//! Expiry processing belongs to the event loop. The context only needs to
//! hold the timer lists, hand out identifiers, and drop everything on
//! teardown.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

/// Identifier assigned to a scheduled timer. Never reused within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Which list a timer lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires on the event-loop thread as part of the tick.
    Sync,
    /// Fires from the asynchronous timer queue.
    Async,
}

/// A scheduled timer.
#[derive(Debug, Clone)]
pub struct Timer {
    pub id: TimerId,
    /// `None` when the delay reaches past what the clock can represent;
    /// such a timer never expires on its own.
    pub deadline: Option<Instant>,
    pub kind: TimerKind,
}

/// Lifecycle contract for the timer subsystem.
pub trait TimerSubsystem {
    /// Schedule a timer `delay` from now.
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId;

    /// Remove a pending timer. Returns `false` if it was not found.
    fn cancel(&mut self, id: TimerId) -> bool;

    /// Number of pending timers across both lists.
    fn len(&self) -> usize;

    /// Whether no timers are pending.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the subsystem runs in low-resolution mode.
    fn low_resolution(&self) -> bool;

    /// Drop every synchronous and asynchronous timer. Returns the number
    /// dropped.
    fn destroy_all(&mut self) -> usize;
}

/// Default timer store: one list per timer kind.
#[derive(Debug, Default)]
pub struct TimerStore {
    sync_timers: Vec<Timer>,
    async_timers: Vec<Timer>,
    last_identifier: u64,
    low_resolution: bool,
}

impl TimerStore {
    pub fn new(low_resolution: bool) -> Self {
        Self {
            low_resolution,
            ..Self::default()
        }
    }

    /// The most recently assigned identifier (0 before the first schedule).
    pub fn last_identifier(&self) -> u64 {
        self.last_identifier
    }

    /// Earliest deadline across both lists.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sync_timers
            .iter()
            .chain(&self.async_timers)
            .filter_map(|t| t.deadline)
            .min()
    }

    fn list_mut(&mut self, kind: TimerKind) -> &mut Vec<Timer> {
        match kind {
            TimerKind::Sync => &mut self.sync_timers,
            TimerKind::Async => &mut self.async_timers,
        }
    }
}

impl TimerSubsystem for TimerStore {
    fn schedule(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.last_identifier += 1;
        let id = TimerId(self.last_identifier);
        let deadline = Instant::now().checked_add(delay);
        if deadline.is_none() {
            debug!(%id, ?delay, "timer delay beyond clock range; it will not expire");
        }
        self.list_mut(kind).push(Timer { id, deadline, kind });
        id
    }

    fn cancel(&mut self, id: TimerId) -> bool {
        for kind in [TimerKind::Sync, TimerKind::Async] {
            let list = self.list_mut(kind);
            if let Some(pos) = list.iter().position(|t| t.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    fn len(&self) -> usize {
        self.sync_timers.len() + self.async_timers.len()
    }

    fn low_resolution(&self) -> bool {
        self.low_resolution
    }

    fn destroy_all(&mut self) -> usize {
        let sync = self.sync_timers.len();
        let asynchronous = self.async_timers.len();
        self.sync_timers.clear();
        self.async_timers.clear();
        debug!(sync, asynchronous, "timers destroyed");
        sync + asynchronous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_increase() {
        let mut timers = TimerStore::new(false);
        assert_eq!(timers.last_identifier(), 0);
        let a = timers.schedule(Duration::from_millis(10), TimerKind::Sync);
        let b = timers.schedule(Duration::from_millis(10), TimerKind::Async);
        assert_eq!(a, TimerId(1));
        assert_eq!(b, TimerId(2));
        assert_eq!(timers.last_identifier(), 2);
    }

    #[test]
    fn test_cancel_searches_both_lists() {
        let mut timers = TimerStore::new(false);
        let a = timers.schedule(Duration::from_secs(1), TimerKind::Sync);
        let b = timers.schedule(Duration::from_secs(1), TimerKind::Async);

        assert!(timers.cancel(b));
        assert!(!timers.cancel(b));
        assert!(timers.cancel(a));
        assert!(timers.is_empty());
    }

    #[test]
    fn test_ids_not_reused_after_cancel() {
        let mut timers = TimerStore::new(false);
        let a = timers.schedule(Duration::ZERO, TimerKind::Sync);
        timers.cancel(a);
        let b = timers.schedule(Duration::ZERO, TimerKind::Sync);
        assert_ne!(a, b);
    }

    #[test]
    fn test_destroy_all_counts_both_lists() {
        let mut timers = TimerStore::new(true);
        timers.schedule(Duration::from_secs(1), TimerKind::Sync);
        timers.schedule(Duration::from_secs(2), TimerKind::Sync);
        timers.schedule(Duration::from_secs(3), TimerKind::Async);

        assert_eq!(timers.len(), 3);
        assert_eq!(timers.destroy_all(), 3);
        assert!(timers.is_empty());
        assert_eq!(timers.destroy_all(), 0);
        assert!(timers.low_resolution());
    }

    #[test]
    fn test_next_deadline() {
        let mut timers = TimerStore::new(false);
        assert!(timers.next_deadline().is_none());
        timers.schedule(Duration::from_secs(60), TimerKind::Sync);
        timers.schedule(Duration::from_millis(5), TimerKind::Async);
        let next = timers.next_deadline().unwrap();
        assert!(next <= Instant::now() + Duration::from_millis(5));
    }

    #[test]
    fn test_unrepresentable_delay_never_expires() {
        let mut timers = TimerStore::new(false);
        let id = timers.schedule(Duration::MAX, TimerKind::Sync);
        assert_eq!(id, TimerId(1));
        assert_eq!(timers.len(), 1);
        assert!(timers.next_deadline().is_none());

        timers.schedule(Duration::from_secs(1), TimerKind::Async);
        assert!(timers.next_deadline().is_some());
        assert!(timers.cancel(id));
    }

    #[test]
    fn test_timer_id_display() {
        assert_eq!(TimerId(7).to_string(), "timer#7");
    }
}
