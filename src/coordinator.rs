// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Locating the group coordinator.
use log::info;
use std::{
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// A known group coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Coordinator {
    /// The coordinator's node id.
    pub id: i32,
    /// The coordinator's address.
    pub addr: SocketAddr,
}

impl fmt::Display for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// A source of the current group coordinator.
pub trait CoordinatorDiscovery: Send {
    /// Returns the coordinator heartbeats should be routed to, if one is known.
    fn coordinator(&self, now: Instant) -> Option<&Coordinator>;

    /// Forget the current coordinator.
    fn mark_unknown(&mut self, reason: &str, now: Instant);
}

/// A coordinator at a fixed address.
///
/// After being marked unknown, the coordinator is hidden for a rediscovery delay, as if a
/// lookup were in flight.
#[derive(Clone, Debug)]
pub struct StaticCoordinator {
    coordinator: Coordinator,
    rediscovery: Duration,
    hidden_until: Option<Instant>,
}

impl StaticCoordinator {
    /// Create a new static coordinator.
    pub fn new(coordinator: Coordinator, rediscovery: Duration) -> Self {
        Self {
            coordinator,
            rediscovery,
            hidden_until: None,
        }
    }
}

impl CoordinatorDiscovery for StaticCoordinator {
    fn coordinator(&self, now: Instant) -> Option<&Coordinator> {
        guard!(self.hidden_until.map_or(true, |t| now >= t));
        Some(&self.coordinator)
    }

    fn mark_unknown(&mut self, reason: &str, now: Instant) {
        info!("coordinator {} marked unknown: {}", self.coordinator, reason);
        self.hidden_until = Some(now + self.rediscovery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_for_rediscovery_delay() {
        let c = Coordinator {
            id: 1,
            addr: "127.0.0.1:9092".parse().unwrap(),
        };
        let mut d = StaticCoordinator::new(c.clone(), Duration::from_millis(100));
        let t0 = Instant::now();

        assert_eq!(Some(&c), d.coordinator(t0));

        d.mark_unknown("not coordinator", t0);
        assert_eq!(None, d.coordinator(t0));
        assert_eq!(None, d.coordinator(t0 + Duration::from_millis(99)));
        assert_eq!(Some(&c), d.coordinator(t0 + Duration::from_millis(100)));
    }
}
