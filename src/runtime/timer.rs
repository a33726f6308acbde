//! Named one-shot and persistent timers.
//!
//! Timers are keyed by a small integer id. Adding a timer under an id that is
//! already armed replaces it; the replaced callback never fires again even if
//! it is running at the time.

use super::Reactor;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Timer callback, invoked on the reactor thread.
pub type TimerCallback = Box<dyn FnMut(&mut Reactor)>;

struct Timer {
    deadline: Instant,
    /// `Some` for persistent timers.
    period: Option<Duration>,
    generation: u64,
    /// `None` while the callback is running.
    callback: Option<TimerCallback>,
}

/// Set of named timers owned by one reactor.
#[derive(Default)]
pub struct Timers {
    timers: BTreeMap<u32, Timer>,
    generation: u64,
}

impl Timers {
    /// Arm (or re-arm) timer `id`.
    pub fn insert(
        &mut self,
        id: u32,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    ) {
        self.generation += 1;
        self.timers.insert(
            id,
            Timer {
                deadline: Instant::now() + delay,
                period,
                generation: self.generation,
                callback: Some(callback),
            },
        );
    }

    /// Disarm timer `id`. Returns whether it was armed.
    pub fn remove(&mut self, id: u32) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.timers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Time until the earliest deadline, zero if one is already due.
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.timers
            .values()
            .map(|t| t.deadline.saturating_duration_since(now))
            .min()
    }

    /// Timers due at `now`, earliest first, as `(id, generation)` pairs.
    pub fn expired(&self, now: Instant) -> Vec<(u32, u64)> {
        let mut due: Vec<_> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(&id, t)| (t.deadline, id, t.generation))
            .collect();
        due.sort_unstable();
        due.into_iter().map(|(_, id, gen)| (id, gen)).collect()
    }

    /// Check out the callback of a due timer.
    pub fn take(&mut self, id: u32, generation: u64) -> Option<TimerCallback> {
        self.timers
            .get_mut(&id)
            .filter(|t| t.generation == generation)
            .and_then(|t| t.callback.take())
    }

    /// Hand a fired callback back: persistent timers are rescheduled, one-shot
    /// timers are dropped. A timer replaced or removed while running is left
    /// alone and the old callback dropped.
    pub fn finish(&mut self, id: u32, generation: u64, callback: TimerCallback) {
        let Some(timer) = self.timers.get_mut(&id) else {
            return;
        };
        if timer.generation != generation {
            return;
        }
        match timer.period {
            Some(period) => {
                timer.deadline = Instant::now() + period;
                timer.callback = Some(callback);
            }
            None => {
                self.timers.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> TimerCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_reinsert_replaces() {
        let mut timers = Timers::default();
        timers.insert(1, Duration::from_secs(60), None, noop());
        timers.insert(1, Duration::ZERO, None, noop());
        assert_eq!(timers.len(), 1);

        let due = timers.expired(Instant::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);
    }

    #[test]
    fn test_one_shot_removed_after_finish() {
        let mut timers = Timers::default();
        timers.insert(7, Duration::ZERO, None, noop());

        let (id, gen) = timers.expired(Instant::now())[0];
        let cb = timers.take(id, gen).unwrap();
        timers.finish(id, gen, cb);
        assert!(!timers.contains(7));
    }

    #[test]
    fn test_persistent_rescheduled() {
        let mut timers = Timers::default();
        timers.insert(3, Duration::ZERO, Some(Duration::from_secs(30)), noop());

        let now = Instant::now();
        let (id, gen) = timers.expired(now)[0];
        let cb = timers.take(id, gen).unwrap();
        timers.finish(id, gen, cb);

        assert!(timers.contains(3));
        assert!(timers.expired(now).is_empty());
        assert!(timers.next_timeout(now).unwrap() > Duration::from_secs(29));
    }

    #[test]
    fn test_replaced_while_running_keeps_new_timer() {
        let mut timers = Timers::default();
        timers.insert(2, Duration::ZERO, Some(Duration::from_secs(1)), noop());

        let (id, gen) = timers.expired(Instant::now())[0];
        let cb = timers.take(id, gen).unwrap();
        timers.insert(2, Duration::from_secs(60), None, noop());
        timers.finish(id, gen, cb);

        assert!(timers.contains(2));
        assert!(timers.expired(Instant::now()).is_empty());
    }
}
