//! Deadline-ordered repeating timers
//!
//! Timers belong to widgets and fire as [`Event::Timer`] records on the
//! main queue. The list is kept sorted by deadline at all times so the
//! dispatcher can derive its poll timeout from the head entry.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::event::{Event, EventQueue, EventRecord};
use crate::widget::WidgetId;

#[derive(Debug, Clone)]
struct TimerEntry {
    owner: WidgetId,
    id: u32,
    interval: Duration,
    deadline: Instant,
    data: u64,
}

/// The process-wide timer list, owned by the core
#[derive(Debug, Default)]
pub struct TimerQueue {
    // sorted by deadline, earliest first
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    /// Create an empty queue
    pub fn new() -> TimerQueue {
        Default::default()
    }

    /// Schedule (or reschedule) the timer `(owner, id)`
    ///
    /// An existing entry with the same key is removed first, so the timer
    /// restarts from `now`. A zero interval is clamped to 1ms.
    pub fn append(
        &mut self,
        now: Instant,
        owner: WidgetId,
        id: u32,
        interval: Duration,
        data: u64,
    ) {
        let interval = interval.max(Duration::from_millis(1));
        self.entries
            .retain(|entry| !(entry.owner == owner && entry.id == id));
        let entry = TimerEntry {
            owner,
            id,
            interval,
            deadline: now + interval,
            data,
        };
        let at = self.insertion_point(entry.deadline);
        self.entries.insert(at, entry);
        trace!(?owner, id, ?interval, "timer scheduled");
    }

    /// Remove the timer `(owner, id)` if it exists
    pub fn remove(&mut self, owner: WidgetId, id: u32) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|entry| !(entry.owner == owner && entry.id == id));
        self.entries.len() != before
    }

    /// Purge every timer belonging to `owner`
    ///
    /// Called from the widget-destroyed hook; stale owners must never
    /// survive here.
    pub fn remove_widget(&mut self, owner: WidgetId) {
        self.entries.retain(|entry| entry.owner != owner);
    }

    /// Time until the earliest deadline, or `None` if no timer is armed
    ///
    /// An already-elapsed deadline yields a zero wait.
    pub fn min_wait(&self, now: Instant) -> Option<Duration> {
        self.entries
            .first()
            .map(|entry| entry.deadline.saturating_duration_since(now))
    }

    /// Fire every timer whose deadline has passed
    ///
    /// Each due entry queues exactly one [`Event::Timer`] record and is
    /// rescheduled from its *scheduled* deadline, skipping forward past
    /// missed periods so drift does not produce a catch-up burst. The list
    /// is sorted again afterwards.
    pub fn process(&mut self, now: Instant, queue: &mut EventQueue) {
        if self.entries.first().map(|e| e.deadline > now).unwrap_or(true) {
            return;
        }
        for entry in &mut self.entries {
            if entry.deadline > now {
                break;
            }
            queue.push(EventRecord {
                target: entry.owner,
                event: Event::Timer {
                    id: entry.id,
                    data: entry.data,
                },
            });
            let mut next = entry.deadline + entry.interval;
            if next <= now {
                next = now + entry.interval;
            }
            entry.deadline = next;
        }
        self.entries.sort_by_key(|entry| entry.deadline);
    }

    /// Number of armed timers
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timer is armed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insertion_point(&self, deadline: Instant) -> usize {
        self.entries
            .partition_point(|entry| entry.deadline <= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::widget::WidgetArena;

    fn sorted(queue: &TimerQueue) -> bool {
        queue
            .entries
            .windows(2)
            .all(|pair| pair[0].deadline <= pair[1].deadline)
    }

    #[test]
    fn append_replaces_same_key() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::from_millis(100), 0);
        timers.append(
            t0 + Duration::from_millis(10),
            w,
            1,
            Duration::from_millis(50),
            0,
        );
        assert_eq!(timers.len(), 1);
        // remaining wait is measured from the second append
        let wait = timers.min_wait(t0 + Duration::from_millis(10)).unwrap();
        assert_eq!(wait, Duration::from_millis(50));
    }

    #[test]
    fn zero_interval_clamps_to_one_ms() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::ZERO, 0);
        assert_eq!(timers.min_wait(t0), Some(Duration::from_millis(1)));
    }

    #[test]
    fn process_fires_once_and_keeps_list_sorted() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::from_millis(10), 7);
        timers.append(t0, w, 2, Duration::from_millis(500), 0);

        let later = t0 + Duration::from_millis(35);
        timers.process(later, &mut queue);

        assert_eq!(queue.len(), 1);
        assert!(matches!(
            queue.pop().unwrap().event,
            Event::Timer { id: 1, data: 7 }
        ));
        assert!(sorted(&timers));
        // new deadline is strictly in the future
        assert!(timers.min_wait(later).unwrap() > Duration::ZERO);
    }

    #[test]
    fn missed_periods_do_not_burst() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::from_millis(10), 0);

        // five periods late: one fire, rebased off `now`
        let later = t0 + Duration::from_millis(55);
        timers.process(later, &mut queue);
        assert_eq!(queue.len(), 1);
        assert_eq!(timers.min_wait(later), Some(Duration::from_millis(10)));
    }

    #[test]
    fn on_time_fire_advances_from_scheduled_deadline() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let mut queue = EventQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::from_millis(100), 0);

        // woken 3ms late; next deadline stays on the 200ms grid
        let later = t0 + Duration::from_millis(103);
        timers.process(later, &mut queue);
        assert_eq!(
            timers.min_wait(later),
            Some(Duration::from_millis(97))
        );
    }

    #[test]
    fn remove_widget_purges_all_entries() {
        let mut arena = WidgetArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let mut timers = TimerQueue::new();
        let t0 = Instant::now();
        timers.append(t0, a, 1, Duration::from_millis(10), 0);
        timers.append(t0, a, 2, Duration::from_millis(20), 0);
        timers.append(t0, b, 1, Duration::from_millis(30), 0);
        timers.remove_widget(a);
        assert_eq!(timers.len(), 1);
        let mut queue = EventQueue::new();
        timers.process(t0 + Duration::from_millis(100), &mut queue);
        assert_eq!(queue.pop().unwrap().target, b);
    }

    #[test]
    fn min_wait_is_zero_for_elapsed_deadline() {
        let mut arena = WidgetArena::new();
        let w = arena.alloc();
        let mut timers = TimerQueue::new();
        let t0 = Instant::now();
        timers.append(t0, w, 1, Duration::from_millis(5), 0);
        assert_eq!(
            timers.min_wait(t0 + Duration::from_millis(50)),
            Some(Duration::ZERO)
        );
    }
}
