//! Deadline-ordered timer queue.
//!
//! Keyed by `(expiration, sequence)` so same-deadline timers fire in
//! creation order. Driven by `EventLoop` once per iteration; there is no
//! timerfd. Cancellation is soft (the entry stays until its deadline) and
//! safe to call from a timer callback against the currently running timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::event_loop::EventLoop;

pub(crate) type TimerCallback = Box<dyn FnMut(&EventLoop) + Send>;

/// Repeat forever until cancelled or removed.
pub const REPEAT_FOREVER: i32 = -1;

/// Handle to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub(crate) struct TimerEntry {
    pub(crate) interval: Duration,
    /// Remaining runs; `REPEAT_FOREVER` for unbounded periodic timers.
    pub(crate) repeat: i32,
    pub(crate) cancelled: bool,
    pub(crate) callback: TimerCallback,
}

pub(crate) struct TimerQueue {
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    /// seq -> scheduled expiration, for cancel/remove lookups.
    index: HashMap<u64, Instant>,
    /// Sequences cancelled while their entry was detached for execution.
    cancelled_running: HashSet<u64>,
    ticking: bool,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> TimerQueue {
        TimerQueue {
            timers: BTreeMap::new(),
            index: HashMap::new(),
            cancelled_running: HashSet::new(),
            ticking: false,
            next_seq: 0,
        }
    }

    pub(crate) fn add(
        &mut self,
        when: Instant,
        interval: Duration,
        repeat: i32,
        callback: TimerCallback,
    ) -> TimerId {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.timers.insert(
            (when, seq),
            TimerEntry {
                interval,
                repeat,
                cancelled: false,
                callback,
            },
        );
        self.index.insert(seq, when);
        TimerId(seq)
    }

    /// Soft cancel: the entry is skipped when its deadline arrives.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(&when) = self.index.get(&id.0) {
            if let Some(entry) = self.timers.get_mut(&(when, id.0)) {
                entry.cancelled = true;
            }
        } else if self.ticking {
            // Timer is detached and running right now; suppress its restart.
            self.cancelled_running.insert(id.0);
        }
    }

    /// Hard removal. Equivalent to cancel for a timer that is currently
    /// executing.
    pub(crate) fn remove(&mut self, id: TimerId) {
        if let Some(when) = self.index.remove(&id.0) {
            self.timers.remove(&(when, id.0));
        } else if self.ticking {
            self.cancelled_running.insert(id.0);
        }
    }

    /// Detach every entry whose deadline has passed, in order. The caller
    /// runs the callbacks and hands survivors back via `reschedule`.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(u64, Instant, TimerEntry)> {
        let mut expired = Vec::new();
        loop {
            let due = match self.timers.first_key_value() {
                Some((&(when, _), _)) => when <= now,
                None => false,
            };
            if !due {
                break;
            }
            if let Some(((when, seq), entry)) = self.timers.pop_first() {
                self.index.remove(&seq);
                expired.push((seq, when, entry));
            }
        }
        self.ticking = !expired.is_empty();
        expired
    }

    /// Restart a periodic entry at its advanced deadline unless it was
    /// cancelled while running.
    pub(crate) fn reschedule(&mut self, seq: u64, when: Instant, entry: TimerEntry) {
        if self.cancelled_running.contains(&seq) || entry.cancelled {
            return;
        }
        self.timers.insert((when, seq), entry);
        self.index.insert(seq, when);
    }

    pub(crate) fn finish_tick(&mut self) {
        self.ticking = false;
        self.cancelled_running.clear();
    }

    pub(crate) fn next_expiration(&self) -> Option<Instant> {
        self.timers.first_key_value().map(|(&(when, _), _)| when)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nop() -> TimerCallback {
        Box::new(|_lp| {})
    }

    #[test]
    fn expires_in_deadline_then_sequence_order() {
        let mut q = TimerQueue::new();
        let base = Instant::now();
        let late = q.add(base + Duration::from_millis(20), Duration::ZERO, 1, nop());
        let early_a = q.add(base + Duration::from_millis(5), Duration::ZERO, 1, nop());
        let early_b = q.add(base + Duration::from_millis(5), Duration::ZERO, 1, nop());

        let expired = q.take_expired(base + Duration::from_millis(10));
        let seqs: Vec<u64> = expired.iter().map(|(seq, _, _)| *seq).collect();
        assert_eq!(seqs, vec![early_a.0, early_b.0]);
        q.finish_tick();

        let expired = q.take_expired(base + Duration::from_millis(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, late.0);
    }

    #[test]
    fn cancelled_entry_is_marked() {
        let mut q = TimerQueue::new();
        let when = Instant::now();
        let id = q.add(when, Duration::ZERO, 1, nop());
        q.cancel(id);

        let expired = q.take_expired(when + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert!(expired[0].2.cancelled);
    }

    #[test]
    fn remove_erases_entry() {
        let mut q = TimerQueue::new();
        let id = q.add(Instant::now(), Duration::from_millis(1), REPEAT_FOREVER, nop());
        assert_eq!(q.len(), 1);
        q.remove(id);
        assert_eq!(q.len(), 0);
        assert!(q.take_expired(Instant::now() + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn cancel_while_running_suppresses_restart() {
        let mut q = TimerQueue::new();
        let when = Instant::now();
        let id = q.add(when, Duration::from_millis(1), REPEAT_FOREVER, nop());

        let mut expired = q.take_expired(when + Duration::from_millis(1));
        let (seq, fired_at, entry) = expired.remove(0);
        // Callback would run here and cancel its own timer.
        q.cancel(id);
        q.reschedule(seq, fired_at + entry.interval, entry);
        q.finish_tick();
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn reschedule_advances_deadline() {
        let mut q = TimerQueue::new();
        let when = Instant::now();
        q.add(when, Duration::from_millis(10), REPEAT_FOREVER, nop());

        let mut expired = q.take_expired(when + Duration::from_millis(1));
        let (seq, fired_at, entry) = expired.remove(0);
        let next = fired_at + entry.interval;
        q.reschedule(seq, next, entry);
        q.finish_tick();
        assert_eq!(q.next_expiration(), Some(next));
    }
}
