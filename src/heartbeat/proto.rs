// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Heartbeat requests and responses, independent of any wire encoding.
use crate::{error::ErrorCode, membership::Assignment, topology::StreamsTopology};
use std::{collections::BTreeSet, time::Duration};

/// What a member subscribes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Subscription {
    /// A consumer subscription to a set of topics.
    Topics {
        /// The subscribed topics.
        topics: BTreeSet<String>,
        /// The server-side assignor to use, if not the default.
        assignor: Option<String>,
    },

    /// A streams member's processing topology.
    Topology(StreamsTopology),
}

/// A heartbeat sent to the group coordinator.
///
/// Optional fields are only present if they changed since the last heartbeat, or if the
/// coordinator may have forgotten them (the member is joining, or the last heartbeat
/// failed).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatRequest {
    /// The group id.
    pub group_id: String,
    /// The member id.
    pub member_id: String,
    /// The member epoch, or one of the join/leave sentinels.
    pub member_epoch: i32,
    /// The static instance id.
    pub instance_id: Option<String>,
    /// The rebalance timeout.
    pub rebalance_timeout: Option<Duration>,
    /// The member's subscription.
    pub subscription: Option<Subscription>,
    /// The tasks the member currently owns.
    pub owned: Option<Assignment>,
}

impl HeartbeatRequest {
    /// Returns true if this heartbeat leaves the group.
    pub fn is_leave(&self) -> bool {
        self.member_epoch < 0
    }
}

/// The coordinator's response to a heartbeat.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// The error code. [ErrorCode::None] on success.
    pub error_code: ErrorCode,
    /// An optional error message.
    pub error_message: Option<String>,
    /// The member's new epoch.
    pub member_epoch: i32,
    /// How often the member should heartbeat.
    pub heartbeat_interval: Duration,
    /// The member's target assignment, if it changed.
    pub assignment: Option<Assignment>,
}

impl HeartbeatResponse {
    /// Create a successful response.
    pub fn ok(member_epoch: i32, heartbeat_interval: Duration) -> Self {
        Self {
            error_code: ErrorCode::None,
            error_message: None,
            member_epoch,
            heartbeat_interval,
            assignment: None,
        }
    }

    /// Create an error response.
    pub fn error(code: ErrorCode, message: Option<String>) -> Self {
        Self {
            error_code: code,
            error_message: message,
            member_epoch: 0,
            heartbeat_interval: Duration::from_secs(0),
            assignment: None,
        }
    }

    /// Attach a target assignment.
    pub fn with_assignment(mut self, assignment: Assignment) -> Self {
        self.assignment = Some(assignment);
        self
    }
}
