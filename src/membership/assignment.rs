// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Epoch-tagged assignment snapshots.
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// The local epoch of an empty, unset assignment.
pub const NONE_EPOCH: i64 = -1;

/// Tasks keyed by subtopology id (or topic, for consumer groups).
pub type Tasks = BTreeMap<String, BTreeSet<i32>>;

/// A single task: one partition of one subtopology.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId {
    /// The subtopology (or topic) id.
    pub subtopology: String,
    /// The partition index.
    pub partition: i32,
}

impl TaskId {
    /// Create a new task id.
    pub fn new<S: Into<String>>(subtopology: S, partition: i32) -> Self {
        Self {
            subtopology: subtopology.into(),
            partition,
        }
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.subtopology, self.partition)
    }
}

/// The tasks assigned to a member, by category.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Assignment {
    /// Tasks this member processes.
    pub active: Tasks,
    /// Tasks this member keeps a replica of.
    pub standby: Tasks,
    /// Tasks this member is catching up on, before taking them over.
    pub warmup: Tasks,
}

impl Assignment {
    /// Add active `partitions` of `subtopology`.
    pub fn active<S, I>(mut self, subtopology: S, partitions: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = i32>,
    {
        insert(&mut self.active, subtopology.into(), partitions);
        self
    }

    /// Add standby `partitions` of `subtopology`.
    pub fn standby<S, I>(mut self, subtopology: S, partitions: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = i32>,
    {
        insert(&mut self.standby, subtopology.into(), partitions);
        self
    }

    /// Add warmup `partitions` of `subtopology`.
    pub fn warmup<S, I>(mut self, subtopology: S, partitions: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = i32>,
    {
        insert(&mut self.warmup, subtopology.into(), partitions);
        self
    }

    /// Returns true if no tasks of any kind are assigned.
    pub fn is_empty(&self) -> bool {
        [&self.active, &self.standby, &self.warmup]
            .iter()
            .all(|t| t.values().all(BTreeSet::is_empty))
    }

    /// Returns every active task.
    pub fn active_tasks(&self) -> BTreeSet<TaskId> {
        (self.active.iter())
            .flat_map(|(s, ps)| ps.iter().map(move |&p| TaskId::new(s.as_str(), p)))
            .collect()
    }
}

fn insert<I: IntoIterator<Item = i32>>(tasks: &mut Tasks, key: String, partitions: I) {
    tasks.entry(key).or_default().extend(partitions);
}

/// An immutable assignment snapshot, tagged with a local epoch that only advances when the
/// content changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalAssignment {
    local_epoch: i64,
    tasks: Assignment,
}

impl Default for LocalAssignment {
    fn default() -> Self {
        Self::none()
    }
}

impl LocalAssignment {
    /// The empty, unset assignment.
    pub fn none() -> Self {
        Self {
            local_epoch: NONE_EPOCH,
            tasks: Assignment::default(),
        }
    }

    /// Create an assignment at `local_epoch`.
    ///
    /// # Panics
    /// Panics if `local_epoch` is [NONE_EPOCH] and `tasks` is not empty.
    pub fn new(local_epoch: i64, tasks: Assignment) -> Self {
        // NOTE(invariant): only the unset assignment may carry NONE_EPOCH
        assert!(
            local_epoch != NONE_EPOCH || tasks.is_empty(),
            "assignment at epoch {} must be empty",
            NONE_EPOCH
        );

        Self { local_epoch, tasks }
    }

    /// Returns the local epoch.
    pub fn local_epoch(&self) -> i64 {
        self.local_epoch
    }

    /// Returns the assigned tasks.
    pub fn tasks(&self) -> &Assignment {
        &self.tasks
    }

    /// Returns true if this is the unset assignment.
    pub fn is_none(&self) -> bool {
        self.local_epoch == NONE_EPOCH
    }

    /// Returns an assignment holding `tasks`. If `tasks` is what this assignment already
    /// holds, the result is identical to `self`; otherwise its local epoch is one greater.
    pub fn update_with(&self, tasks: Assignment) -> Self {
        if self.tasks == tasks {
            return self.clone();
        }

        Self::new(self.local_epoch + 1, tasks)
    }
}

impl fmt::Display for LocalAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.tasks.active, self.local_epoch)
    }
}
