use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub type UnixMillis = i64;

pub type IntervalCallback = Arc<dyn Fn() + Send + Sync>;

/// Time source for drying deadlines, rate limiting, and periodic work.
///
/// `start_interval` schedules `callback` to run every `period` from the
/// moment of registration. Callbacks may re-enter the clock (to read
/// `now()`, for instance), so implementations must not hold internal locks
/// while invoking them.
pub trait Clock: Send + Sync {
    fn now(&self) -> UnixMillis;
    fn start_interval(&self, period: Duration, callback: IntervalCallback);
}

/// The wall clock. Intervals run on a detached thread.
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        SystemClock
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> UnixMillis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_millis() as UnixMillis
    }

    fn start_interval(&self, period: Duration, callback: IntervalCallback) {
        thread::spawn(move || loop {
            thread::sleep(period);
            callback();
        });
    }
}

struct Interval {
    period_ms: i64,
    next_fire: UnixMillis,
    callback: IntervalCallback,
}

struct TestClockState {
    now: UnixMillis,
    intervals: Vec<Interval>,
}

/// A manually driven clock for tests.
///
/// Time only moves through `advance` or `set_time`. Advancing walks through
/// any interval deadlines inside the window in order, invoking each callback
/// with `now()` reporting the deadline itself rather than the final time, so
/// periodic work observes the same sequence of instants it would under the
/// wall clock.
pub struct TestClock {
    state: Mutex<TestClockState>,
}

impl TestClock {
    /// Starts at the current system time.
    pub fn new() -> Self {
        TestClock {
            state: Mutex::new(TestClockState {
                now: SystemClock.now(),
                intervals: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TestClockState> {
        self.state.lock().expect("test clock mutex poisoned")
    }

    pub fn set_time(&self, now: UnixMillis) {
        self.lock().now = now;
    }

    /// Move time forward, firing due interval callbacks along the way.
    ///
    /// The internal lock is released across each callback invocation;
    /// callbacks are free to call back into the clock.
    pub fn advance(&self, d: Duration) {
        let mut remaining = d.as_millis() as i64;

        loop {
            let mut state = self.lock();
            let now = state.now;

            // Earliest deadline inside the remaining window, if any.
            let mut due: Option<(usize, UnixMillis)> = None;
            for (i, interval) in state.intervals.iter().enumerate() {
                if interval.next_fire > now + remaining {
                    continue;
                }
                if due.map_or(true, |(_, t)| interval.next_fire < t) {
                    due = Some((i, interval.next_fire));
                }
            }

            match due {
                Some((i, fire_at)) => {
                    let callback = state.intervals[i].callback.clone();
                    state.intervals[i].next_fire = fire_at + state.intervals[i].period_ms;
                    remaining -= fire_at - now;
                    state.now = fire_at;
                    drop(state);
                    callback();
                }
                None => {
                    state.now = now + remaining;
                    return;
                }
            }
        }
    }
}

impl Default for TestClock {
    fn default() -> Self {
        TestClock::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> UnixMillis {
        self.lock().now
    }

    fn start_interval(&self, period: Duration, callback: IntervalCallback) {
        let mut state = self.lock();
        let next_fire = state.now + period.as_millis() as i64;
        state.intervals.push(Interval {
            period_ms: period.as_millis() as i64,
            next_fire,
            callback,
        });
    }
}
