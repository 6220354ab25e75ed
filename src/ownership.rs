// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Tracking which partitions are owned, and which of those may be served.
//!
//! The engine mutates a tracker only at fixed points of reconciliation: before dispatching a
//! revoke callback, and before and after dispatching an assign callback. The data path reads
//! it concurrently, so implementations must provide their own synchronization.
use fnv::FnvHashMap;
use parking_lot::RwLock;
use std::{collections::BTreeSet, fmt};

/// An addressable unit of ownership.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// The topic name.
    pub topic: String,
    /// The partition index.
    pub partition: i32,
}

impl TopicPartition {
    /// Create a new topic partition.
    pub fn new<S: Into<String>>(topic: S, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// The external record of owned partitions.
pub trait OwnershipTracker: Send + Sync {
    /// Stop serving `partitions`; a revoke callback for them is about to be dispatched.
    fn mark_pending_revocation(&self, partitions: &BTreeSet<TopicPartition>);

    /// Replace the owned set with `all`. Partitions in `newly` are owned but must not be
    /// served until they are [enabled](OwnershipTracker::enable).
    fn assign_awaiting_callback(
        &self,
        all: &BTreeSet<TopicPartition>,
        newly: &BTreeSet<TopicPartition>,
    );

    /// Allow `partitions` to be served. Partitions that aren't owned are ignored.
    fn enable(&self, partitions: &BTreeSet<TopicPartition>);

    /// Forget every owned partition.
    fn clear_all(&self);

    /// Returns every owned partition, whether or not it may be served.
    fn currently_owned(&self) -> BTreeSet<TopicPartition>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum UnitState {
    Fetchable,
    AwaitingCallback,
    PendingRevocation,
}

/// An [OwnershipTracker] that may be shared between the engine and a data path.
#[derive(Default)]
pub struct SharedOwnership {
    units: RwLock<FnvHashMap<TopicPartition, UnitState>>,
}

impl SharedOwnership {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `tp` is owned and may be served.
    pub fn is_fetchable(&self, tp: &TopicPartition) -> bool {
        self.units.read().get(tp) == Some(&UnitState::Fetchable)
    }

    /// Returns every partition that may be served.
    pub fn fetchable(&self) -> BTreeSet<TopicPartition> {
        (self.units.read().iter())
            .filter(|(_, s)| **s == UnitState::Fetchable)
            .map(|(tp, _)| tp.clone())
            .collect()
    }
}

impl OwnershipTracker for SharedOwnership {
    fn mark_pending_revocation(&self, partitions: &BTreeSet<TopicPartition>) {
        let mut units = self.units.write();
        for tp in partitions {
            if let Some(s) = units.get_mut(tp) {
                *s = UnitState::PendingRevocation;
            }
        }
    }

    fn assign_awaiting_callback(
        &self,
        all: &BTreeSet<TopicPartition>,
        newly: &BTreeSet<TopicPartition>,
    ) {
        let mut units = self.units.write();
        units.retain(|tp, _| all.contains(tp));

        for tp in all {
            let state = if newly.contains(tp) {
                UnitState::AwaitingCallback
            } else {
                match units.get(tp) {
                    Some(UnitState::AwaitingCallback) => UnitState::AwaitingCallback,
                    _ => UnitState::Fetchable,
                }
            };
            units.insert(tp.clone(), state);
        }
    }

    fn enable(&self, partitions: &BTreeSet<TopicPartition>) {
        let mut units = self.units.write();
        for tp in partitions {
            if let Some(s) = units.get_mut(tp) {
                *s = UnitState::Fetchable;
            }
        }
    }

    fn clear_all(&self) {
        self.units.write().clear();
    }

    fn currently_owned(&self) -> BTreeSet<TopicPartition> {
        self.units.read().keys().cloned().collect()
    }
}
