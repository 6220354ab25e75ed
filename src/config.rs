// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Engine configuration.
use std::time::Duration;

/// Configuration of a group member.
///
/// ```
/// use std::time::Duration;
/// use tether::MemberConfig;
///
/// let cfg = MemberConfig::new("orders")
///     .instance_id("orders-7")
///     .max_poll_interval(Duration::from_secs(60))
///     .retry_backoff(Duration::from_millis(50), Duration::from_secs(2));
///
/// assert_eq!(Duration::from_secs(60), cfg.rebalance_timeout());
/// ```
#[derive(Clone, Debug)]
pub struct MemberConfig {
    pub(crate) group_id: String,
    pub(crate) instance_id: Option<String>,
    pub(crate) max_poll_interval: Duration,
    pub(crate) rebalance_timeout: Option<Duration>,
    pub(crate) retry_backoff: Duration,
    pub(crate) retry_backoff_max: Duration,
    pub(crate) jitter: f64,
    pub(crate) coordinator_rediscovery: Option<Duration>,
}

impl MemberConfig {
    /// Create a configuration for a member of `group_id`, with default settings.
    ///
    /// # Panics
    /// Panics if `group_id` is empty.
    pub fn new<S: Into<String>>(group_id: S) -> Self {
        let group_id = group_id.into();
        assert!(!group_id.is_empty(), "group id must not be empty");

        Self {
            group_id,
            instance_id: None,
            max_poll_interval: Duration::from_secs(300),
            rebalance_timeout: None,
            retry_backoff: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(1),
            jitter: 0.2,
            coordinator_rediscovery: None,
        }
    }

    /// Set a static group instance id. Static members leave with a distinct sentinel epoch,
    /// which lets the coordinator hold their assignment until they return.
    ///
    /// # Panics
    /// Panics if `id` is empty.
    pub fn instance_id<S: Into<String>>(mut self, id: S) -> Self {
        let id = id.into();
        assert!(!id.is_empty(), "instance id must not be empty");
        self.instance_id = Some(id);
        self
    }

    /// Set the maximum time allowed between application polls before the member gives up
    /// its assignment and leaves the group.
    ///
    /// # Panics
    /// Panics if `interval` is zero.
    pub fn max_poll_interval(mut self, interval: Duration) -> Self {
        assert!(interval > Duration::from_secs(0));
        self.max_poll_interval = interval;
        self
    }

    /// Set the rebalance timeout sent to the coordinator. Defaults to the maximum poll
    /// interval.
    pub fn rebalance_timeout_override(mut self, timeout: Duration) -> Self {
        self.rebalance_timeout = Some(timeout);
        self
    }

    /// Set the bounds of the exponential backoff used between failed heartbeats.
    ///
    /// # Panics
    /// Panics if `initial` is zero, or `initial > max`.
    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        assert!(initial > Duration::from_secs(0));
        assert!(initial <= max);
        self.retry_backoff = initial;
        self.retry_backoff_max = max;
        self
    }

    /// Set the jitter factor applied to backoff delays.
    ///
    /// # Panics
    /// Panics if `jitter` is not in `[0, 1)`.
    pub fn jitter(mut self, jitter: f64) -> Self {
        assert!((0.0..1.0).contains(&jitter));
        self.jitter = jitter;
        self
    }

    /// Set how long a coordinator stays unknown after being marked so. Defaults to the
    /// initial retry backoff.
    pub fn coordinator_rediscovery(mut self, delay: Duration) -> Self {
        self.coordinator_rediscovery = Some(delay);
        self
    }

    /// Returns the group id.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Returns the static instance id, if any.
    pub fn get_instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Returns the maximum poll interval.
    pub fn get_max_poll_interval(&self) -> Duration {
        self.max_poll_interval
    }

    /// Returns the rebalance timeout.
    pub fn rebalance_timeout(&self) -> Duration {
        self.rebalance_timeout.unwrap_or(self.max_poll_interval)
    }

    /// Returns the initial retry backoff.
    pub fn get_retry_backoff(&self) -> Duration {
        self.retry_backoff
    }

    /// Returns the maximum retry backoff.
    pub fn get_retry_backoff_max(&self) -> Duration {
        self.retry_backoff_max
    }

    /// Returns the jitter factor.
    pub fn get_jitter(&self) -> f64 {
        self.jitter
    }

    /// Returns the coordinator rediscovery delay.
    pub fn get_coordinator_rediscovery(&self) -> Duration {
        self.coordinator_rediscovery.unwrap_or(self.retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = MemberConfig::new("g");

        assert_eq!("g", cfg.group_id());
        assert_eq!(None, cfg.get_instance_id());
        assert_eq!(Duration::from_secs(300), cfg.get_max_poll_interval());
        assert_eq!(Duration::from_secs(300), cfg.rebalance_timeout());
        assert_eq!(Duration::from_millis(100), cfg.get_retry_backoff());
        assert_eq!(Duration::from_secs(1), cfg.get_retry_backoff_max());
        assert_eq!(Duration::from_millis(100), cfg.get_coordinator_rediscovery());
    }

    #[test]
    fn rebalance_timeout_follows_poll_interval() {
        let cfg = MemberConfig::new("g").max_poll_interval(Duration::from_secs(9));
        assert_eq!(Duration::from_secs(9), cfg.rebalance_timeout());

        let cfg = cfg.rebalance_timeout_override(Duration::from_secs(3));
        assert_eq!(Duration::from_secs(3), cfg.rebalance_timeout());
    }

    #[test]
    #[should_panic]
    fn backoff_bounds_are_ordered() {
        MemberConfig::new("g").retry_backoff(Duration::from_secs(2), Duration::from_secs(1));
    }

    #[test]
    #[should_panic]
    fn empty_group_id() {
        MemberConfig::new("");
    }
}
