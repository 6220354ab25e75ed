// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use rand::{thread_rng, Rng};
use std::time::Duration;

/// A count-based exponential backoff with optional jitter and a hard upper bound.
///
/// The delay for attempt `n` is `initial * multiplier^n`, scaled by a random factor drawn
/// from `[1 - jitter, 1 + jitter)`, and capped at `max`.
#[derive(Copy, Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: u32,
    max: Duration,
    jitter: f64,
    exp_max: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff.
    ///
    /// If `initial > max`, `max` is used as the initial delay.
    ///
    /// # Panics
    /// Panics if `multiplier < 2`, or if `jitter` is not in `[0, 1)`.
    pub fn new(initial: Duration, multiplier: u32, max: Duration, jitter: f64) -> Self {
        assert!(multiplier >= 2);
        assert!((0.0..1.0).contains(&jitter));

        let initial = initial.min(max);

        let exp_max = if max > initial {
            let ratio = max.as_secs_f64() / initial.as_secs_f64().max(0.001);
            ratio.ln() / (multiplier as f64).ln()
        } else {
            0.0
        };

        Self {
            initial,
            multiplier,
            max,
            jitter,
            exp_max,
        }
    }

    /// Returns the delay to wait before the next attempt, given the number of attempts that
    /// have already failed.
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.exp_max == 0.0 {
            return self.initial;
        }

        let exp = (attempts as f64).min(self.exp_max);
        let term = self.initial.as_secs_f64() * (self.multiplier as f64).powf(exp);

        let factor = if self.jitter < f64::MIN_POSITIVE {
            1.0
        } else {
            thread_rng().gen_range(1.0 - self.jitter..1.0 + self.jitter)
        };

        Duration::from_secs_f64(term * factor).min(self.max)
    }

    /// Returns the (unjittered) initial delay.
    pub fn initial(&self) -> Duration {
        self.initial
    }

    /// Returns the upper bound on any delay.
    pub fn max(&self) -> Duration {
        self.max
    }
}
