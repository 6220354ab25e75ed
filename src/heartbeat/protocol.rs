// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Group protocol variants.
use super::proto::{HeartbeatResponse, Subscription};
use crate::{
    error::{ErrorCode, ErrorKind},
    membership::{Assignment, TaskId},
    ownership::TopicPartition,
    topology::{StreamsTopology, Topology},
};
use std::collections::BTreeSet;

/// The parts of the heartbeat protocol that differ between kinds of groups.
pub trait GroupProtocol: Topology + Send {
    /// Returns what the member currently subscribes to.
    fn subscription(&self) -> Subscription;

    /// Decide how to react to `code`.
    fn classify(&self, code: ErrorCode) -> ErrorKind {
        code.kind()
    }

    /// Extract the target assignment from a successful response, if it carries one.
    fn extract_target(&self, response: &HeartbeatResponse) -> Option<Assignment> {
        response.assignment.clone()
    }
}

/// A streams group member. Tasks resolve to partitions through a [StreamsTopology].
#[derive(Clone, Debug)]
pub struct StreamsProtocol {
    topology: StreamsTopology,
}

impl StreamsProtocol {
    /// Create a streams protocol for `topology`.
    pub fn new(topology: StreamsTopology) -> Self {
        Self { topology }
    }

    /// Returns the topology.
    pub fn topology(&self) -> &StreamsTopology {
        &self.topology
    }

    /// Replace the topology. Pair with [subscribe](crate::Engine::subscribe) so the change is
    /// sent with the next heartbeat.
    pub fn set_topology(&mut self, topology: StreamsTopology) {
        self.topology = topology;
    }
}

impl Topology for StreamsProtocol {
    fn partitions(&self, task: &TaskId) -> Vec<TopicPartition> {
        self.topology.partitions(task)
    }
}

impl GroupProtocol for StreamsProtocol {
    fn subscription(&self) -> Subscription {
        Subscription::Topology(self.topology.clone())
    }
}

/// A consumer group member. Each task is a single partition: the subtopology id is the
/// topic name.
#[derive(Clone, Debug, Default)]
pub struct ConsumerProtocol {
    topics: BTreeSet<String>,
    assignor: Option<String>,
}

impl ConsumerProtocol {
    /// Create a consumer protocol subscribed to `topics`.
    pub fn new<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: topics.into_iter().map(Into::into).collect(),
            assignor: None,
        }
    }

    /// Request a specific server-side assignor.
    pub fn assignor<S: Into<String>>(mut self, name: S) -> Self {
        self.assignor = Some(name.into());
        self
    }

    /// Replace the subscribed topics.
    pub fn set_topics<I, S>(&mut self, topics: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
    }
}

impl Topology for ConsumerProtocol {
    fn partitions(&self, task: &TaskId) -> Vec<TopicPartition> {
        vec![TopicPartition::new(task.subtopology.as_str(), task.partition)]
    }
}

impl GroupProtocol for ConsumerProtocol {
    fn subscription(&self) -> Subscription {
        Subscription::Topics {
            topics: self.topics.clone(),
            assignor: self.assignor.clone(),
        }
    }

    /// Consumers have no standby or warmup tasks; anything but active tasks is dropped.
    fn extract_target(&self, response: &HeartbeatResponse) -> Option<Assignment> {
        let a = response.assignment.as_ref()?;

        Some(Assignment {
            active: a.active.clone(),
            ..Assignment::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn consumer_tasks_are_partitions() {
        let p = ConsumerProtocol::new(vec!["orders"]);
        assert_eq!(
            vec![TopicPartition::new("orders", 4)],
            p.partitions(&TaskId::new("orders", 4))
        );
    }

    #[test]
    fn consumer_drops_standby_tasks() {
        let p = ConsumerProtocol::new(vec!["orders"]);
        let assignment = Assignment::default()
            .active("orders", vec![0])
            .standby("orders", vec![1]);
        let rsp = HeartbeatResponse::ok(1, Duration::from_secs(1)).with_assignment(assignment);

        let got = p.extract_target(&rsp).unwrap();
        assert_eq!(Assignment::default().active("orders", vec![0]), got);
    }

    #[test]
    fn streams_subscription_carries_topology() {
        let t = StreamsTopology::new(3);
        let p = StreamsProtocol::new(t.clone());
        assert_eq!(Subscription::Topology(t), p.subscription());
    }
}
