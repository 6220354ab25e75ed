// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Member-side group membership and assignment reconciliation for coordinator-managed
//! groups.
//!
//! # Overview
//! `tether` implements the client half of a heartbeat-based group protocol, in which a
//! coordinator computes assignments and members converge on them. A member joins a group by
//! heartbeating, receives a target assignment in a heartbeat response, and reconciles its
//! locally owned tasks towards that target by revoking and assigning them through
//! application callbacks. The coordinator learns what the member owns from subsequent
//! heartbeats.
//!
//! Both consumer groups (tasks are partitions) and streams groups (tasks resolve to
//! partitions through a [topology]) are supported through [GroupProtocol].
//!
//! # Sans-IO
//! The [Engine] never performs I/O, never blocks, and never reads a clock. It is driven by
//! repeatedly calling [poll](Engine::poll) with the current time, sending the heartbeat it
//! returns, and feeding the outcome back. Callbacks are [dispatched](events) to the
//! application over a channel and completed asynchronously; the engine picks up their
//! completion on a later poll.
//!
//! A tokio [driver] is provided for applications that don't need to own the loop.
//!
//! # Ownership
//! A partition is never fetchable by this member while it is owned by another member
//! according to the coordinator's most recent intent: revocation always completes before
//! the corresponding assignment is acted on, and at most one reconciliation pass is in
//! flight at any time. Partitions released through a fencing or poll-timeout are reported
//! as lost, rather than revoked, since progress on them can no longer be committed.
//!
//! # References
//! * [KIP-848: The Next Generation of the Consumer Rebalance Protocol][kip848]
//! * [KIP-1071: Streams Rebalance Protocol][kip1071]
//!
//! [kip848]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-848%3A+The+Next+Generation+of+the+Consumer+Rebalance+Protocol
//! [kip1071]: https://cwiki.apache.org/confluence/display/KAFKA/KIP-1071%3A+Streams+Rebalance+Protocol
#![warn(rust_2018_idioms, missing_docs)]
#![doc(
    issue_tracker_base_url = "https://github.com/nytopop/tether/issues/",
    html_root_url = "https://docs.rs/tether/0.1.0",
    test(
        no_crate_inject,
        attr(
            deny(rust_2018_idioms, unused_imports, unused_mut),
            allow(unused_variables)
        )
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(test)]
#[test]
fn test_html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[macro_use]
mod macros;

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod membership;
pub mod ownership;
pub mod timing;
pub mod topology;

#[cfg(test)]
mod tests;

#[doc(inline)]
pub use config::MemberConfig;
#[doc(inline)]
pub use coordinator::{Coordinator, CoordinatorDiscovery, StaticCoordinator};
#[doc(inline)]
pub use driver::{Driver, MemberHandle, Status, Transport};
#[doc(inline)]
pub use error::{CallbackError, Closed, ErrorCode, GroupError, TransportError};
#[doc(inline)]
pub use events::{Callback, CallbackRequest, Event};
#[doc(inline)]
pub use heartbeat::{
    protocol::{ConsumerProtocol, GroupProtocol, StreamsProtocol},
    Engine, Outbound, PollResult,
};
#[doc(inline)]
pub use membership::{Assignment, LeaveGroup, MemberState, MemberStateListener, TaskId};
#[doc(inline)]
pub use ownership::{OwnershipTracker, SharedOwnership, TopicPartition};
#[doc(inline)]
pub use topology::{StreamsTopology, Subtopology, Topology};

/// A re-export of [async_trait] for convenience.
///
/// [async_trait]: https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html
#[doc(inline)]
pub use async_trait::async_trait;
