// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Resolving tasks into the partitions they read from.
use super::{membership::TaskId, ownership::TopicPartition};
use log::error;
use std::collections::{BTreeMap, BTreeSet};

/// Resolves a task into its constituent partitions.
pub trait Topology {
    /// Returns the partitions read by `task`.
    fn partitions(&self, task: &TaskId) -> Vec<TopicPartition>;
}

/// Resolve every task in `tasks` through `topology`.
pub fn partitions_for<'a, T, I>(topology: &T, tasks: I) -> BTreeSet<TopicPartition>
where
    T: Topology + ?Sized,
    I: IntoIterator<Item = &'a TaskId>,
{
    tasks
        .into_iter()
        .flat_map(|t| topology.partitions(t))
        .collect()
}

/// The source topics of one subtopology.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subtopology {
    /// User topics read by this subtopology.
    pub source_topics: BTreeSet<String>,
    /// Internal repartition topics read by this subtopology.
    pub repartition_source_topics: BTreeSet<String>,
}

impl Subtopology {
    /// Create a subtopology reading from `topics`.
    pub fn with_sources<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            source_topics: topics.into_iter().map(Into::into).collect(),
            repartition_source_topics: BTreeSet::new(),
        }
    }

    /// Add a repartition source topic.
    pub fn repartition_source<S: Into<String>>(mut self, topic: S) -> Self {
        self.repartition_source_topics.insert(topic.into());
        self
    }
}

/// A streams topology: subtopologies keyed by id. Task `(s, p)` reads partition `p` of every
/// source and repartition topic of subtopology `s`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamsTopology {
    /// The epoch of this topology, sent to the coordinator.
    pub epoch: i32,
    /// Subtopologies keyed by id.
    pub subtopologies: BTreeMap<String, Subtopology>,
}

impl StreamsTopology {
    /// Create an empty topology at `epoch`.
    pub fn new(epoch: i32) -> Self {
        Self {
            epoch,
            subtopologies: BTreeMap::new(),
        }
    }

    /// Add a subtopology.
    pub fn subtopology<S: Into<String>>(mut self, id: S, sub: Subtopology) -> Self {
        self.subtopologies.insert(id.into(), sub);
        self
    }
}

impl Topology for StreamsTopology {
    fn partitions(&self, task: &TaskId) -> Vec<TopicPartition> {
        let sub = match self.subtopologies.get(&task.subtopology) {
            Some(sub) => sub,
            None => {
                error!("task {} refers to an unknown subtopology", task);
                return Vec::new();
            }
        };

        (sub.source_topics.iter())
            .chain(sub.repartition_source_topics.iter())
            .map(|topic| TopicPartition::new(topic.as_str(), task.partition))
            .collect()
    }
}
