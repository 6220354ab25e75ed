// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use std::time::{Duration, Instant};

/// A countdown timer driven by externally supplied instants.
///
/// The timer never reads a clock on its own. Callers [update](Timer::update) it with the
/// current time, and the timer's notion of "now" only ever moves forward.
#[derive(Copy, Clone, Debug)]
pub struct Timer {
    current: Instant,
    deadline: Instant,
    timeout: Duration,
}

impl Timer {
    /// Create a timer that expires `timeout` after `now`.
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            current: now,
            deadline: now + timeout,
            timeout,
        }
    }

    /// Advance the timer's notion of the current time. Instants older than the last one seen
    /// are ignored.
    pub fn update(&mut self, now: Instant) {
        if now > self.current {
            self.current = now;
        }
    }

    /// Restart the countdown from the last seen instant.
    pub fn reset(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.deadline = self.current + timeout;
    }

    /// Equivalent to an [update](Timer::update) followed by a [reset](Timer::reset).
    pub fn update_and_reset(&mut self, now: Instant, timeout: Duration) {
        self.update(now);
        self.reset(timeout);
    }

    /// Returns true if the deadline has been reached.
    pub fn is_expired(&self) -> bool {
        self.current >= self.deadline
    }

    /// Returns the time left until the deadline, or zero if it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(self.current)
    }

    /// Returns how long ago the deadline passed, or zero if it hasn't.
    pub fn expired_by(&self) -> Duration {
        self.current.saturating_duration_since(self.deadline)
    }

    /// Returns the timeout used by the last reset.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn expires_at_deadline() {
        let t0 = Instant::now();
        let mut t = Timer::new(t0, SEC);

        assert!(!t.is_expired());
        assert_eq!(SEC, t.remaining());

        t.update(t0 + SEC / 2);
        assert!(!t.is_expired());
        assert_eq!(SEC / 2, t.remaining());

        t.update(t0 + SEC);
        assert!(t.is_expired());
        assert_eq!(Duration::from_secs(0), t.remaining());

        t.update(t0 + SEC * 3);
        assert_eq!(SEC * 2, t.expired_by());
    }

    #[test]
    fn zero_timeout_is_expired_immediately() {
        let t = Timer::new(Instant::now(), Duration::from_secs(0));
        assert!(t.is_expired());
    }

    #[test]
    fn reset_counts_from_last_update() {
        let t0 = Instant::now();
        let mut t = Timer::new(t0, SEC);

        t.update(t0 + SEC * 5);
        t.reset(SEC);

        assert!(!t.is_expired());
        assert_eq!(SEC, t.remaining());
        assert_eq!(SEC, t.timeout());
    }

    #[quickcheck]
    fn time_never_moves_backwards(steps: Vec<u16>) -> bool {
        let t0 = Instant::now() + Duration::from_secs(1 << 16);
        let mut t = Timer::new(t0, Duration::from_millis(u16::MAX as u64));

        let mut prev = t.remaining();
        steps.into_iter().all(|ms| {
            // alternate between moving forward and trying to move backward
            let at = if ms % 2 == 0 {
                t0 + Duration::from_millis(ms as u64)
            } else {
                t0 - Duration::from_millis(ms as u64)
            };

            t.update(at);
            let ok = t.remaining() <= prev;
            prev = t.remaining();
            ok
        })
    }
}
