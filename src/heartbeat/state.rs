// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Heartbeat pacing and request diffing.
use super::proto::Subscription;
use crate::timing::{ExponentialBackoff, Timer};
use std::time::{Duration, Instant};

/// When the next heartbeat may be sent.
///
/// A heartbeat may be sent once the heartbeat interval has elapsed, no heartbeat is in
/// flight, and any backoff from a previous failure has elapsed.
#[derive(Debug)]
pub struct HeartbeatRequestState {
    timer: Timer,
    interval: Duration,
    backoff: ExponentialBackoff,
    attempts: u32,
    in_flight: bool,
    last_sent: Option<Instant>,
    last_received: Option<Instant>,
    backoff_until: Option<Instant>,
}

impl HeartbeatRequestState {
    /// Create a new request state. The first heartbeat may be sent immediately.
    pub fn new(now: Instant, backoff: ExponentialBackoff) -> Self {
        Self {
            timer: Timer::new(now, Duration::from_secs(0)),
            interval: Duration::from_secs(0),
            backoff,
            attempts: 0,
            in_flight: false,
            last_sent: None,
            last_received: None,
            backoff_until: None,
        }
    }

    /// Returns true if a heartbeat may be sent at `now`.
    pub fn can_send(&mut self, now: Instant) -> bool {
        self.timer.update(now);
        self.timer.is_expired() && !self.in_flight && self.backoff_elapsed(now)
    }

    /// Returns true if no failure backoff is pending at `now`.
    pub fn backoff_elapsed(&self, now: Instant) -> bool {
        self.backoff_until.map_or(true, |t| now >= t)
    }

    /// Returns true if a heartbeat was sent and no outcome was recorded yet.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Returns the number of consecutive failed attempts.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns when the last heartbeat was sent.
    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    /// Returns when the last heartbeat outcome was recorded.
    pub fn last_received(&self) -> Option<Instant> {
        self.last_received
    }

    /// Returns the current heartbeat interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Record that a heartbeat was sent, and restart the interval.
    pub fn on_send_attempt(&mut self, now: Instant) {
        self.last_sent = Some(now);
        self.in_flight = true;
        self.timer.update_and_reset(now, self.interval);
    }

    /// Record a successful heartbeat. Clears any backoff, and restarts the interval using
    /// `interval` as reported by the coordinator.
    pub fn on_successful_attempt(&mut self, now: Instant, interval: Duration) {
        self.last_received = Some(now);
        self.in_flight = false;
        self.attempts = 0;
        self.backoff_until = None;
        self.interval = interval;
        self.timer.update_and_reset(now, interval);
    }

    /// Record a failed heartbeat. The next heartbeat waits only for the backoff, not for a
    /// full interval.
    pub fn on_failed_attempt(&mut self, now: Instant) {
        self.last_received = Some(now);
        self.in_flight = false;

        self.backoff_until = Some(now + self.backoff.backoff(self.attempts));
        self.attempts = self.attempts.saturating_add(1);
        self.timer.update_and_reset(now, Duration::from_secs(0));
    }

    /// Forget any backoff and in-flight heartbeat, so the next heartbeat goes out as soon as
    /// possible.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.in_flight = false;
        self.backoff_until = None;
        self.timer.reset(Duration::from_secs(0));
    }

    /// Returns how long until the next heartbeat may be sent.
    pub fn time_to_next_heartbeat(&mut self, now: Instant) -> Duration {
        self.timer.update(now);

        if self.in_flight {
            return self.interval.max(self.backoff.initial());
        }

        let backoff = (self.backoff_until)
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or_default();

        self.timer.remaining().max(backoff)
    }
}

/// The optional request fields sent with the last heartbeat.
///
/// Each field is included in a heartbeat only if it differs from what was last sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SentFields {
    pub(crate) instance_id: Option<String>,
    pub(crate) rebalance_timeout: Option<Duration>,
    pub(crate) subscription: Option<Subscription>,
    pub(crate) owned_epoch: Option<i64>,
}

impl SentFields {
    /// Forget everything, so the next heartbeat is a full one.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Returns `value` if it differs from what `sent` holds, and records it as sent.
    pub(crate) fn diff<T: Clone + PartialEq>(sent: &mut Option<T>, value: &T) -> Option<T> {
        if sent.as_ref() == Some(value) {
            return None;
        }

        *sent = Some(value.clone());
        Some(value.clone())
    }
}
