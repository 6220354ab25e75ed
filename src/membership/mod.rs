// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The member lifecycle state machine.
//!
//! A member moves between the states of [MemberState] in response to heartbeat responses,
//! application requests (subscribe, leave, poll), and the completion of callbacks it has
//! dispatched. The [MembershipManager] is the sole owner of the member's epoch and of the
//! target and current assignments; everything that releases or acquires ownership goes
//! through it.
mod assignment;
mod listener;
mod reconcile;
mod state;

pub use assignment::{Assignment, LocalAssignment, TaskId, Tasks, NONE_EPOCH};
pub use listener::MemberStateListener;
pub use state::MemberState;

use super::{
    error::{Closed, GroupError},
    events::{Callback, EventSender, PendingCallback},
    ownership::{OwnershipTracker, TopicPartition},
};
use listener::Listeners;
use reconcile::{AfterLost, Continuation};

use log::{debug, error, info, warn};
use std::{
    collections::BTreeSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::sync::oneshot::{self, error::TryRecvError};

/// The epoch a member sends while joining.
pub const JOIN_EPOCH: i32 = 0;

/// The epoch a dynamic member sends to leave the group.
pub const LEAVE_EPOCH: i32 = -1;

/// The epoch a static member sends to leave the group. The coordinator keeps its assignment
/// around until the same instance id rejoins.
pub const LEAVE_STATIC_EPOCH: i32 = -2;

/// Who a member is. Fixed for the lifetime of an engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    group_id: String,
    member_id: String,
    instance_id: Option<String>,
}

impl Identity {
    /// Create an identity with a freshly generated member id.
    pub fn new(group_id: String, instance_id: Option<String>) -> Self {
        let member_id = format!("{:032x}", rand::random::<u128>());

        Self {
            group_id,
            member_id,
            instance_id,
        }
    }

    /// Returns the group id.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Returns the member id. It is generated once, and never changes, even across rejoins.
    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Returns the static instance id, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Returns the epoch to send when leaving the group.
    pub fn leave_epoch(&self) -> i32 {
        if self.instance_id.is_some() {
            LEAVE_STATIC_EPOCH
        } else {
            LEAVE_EPOCH
        }
    }
}

/// Resolves once the member has left the group.
///
/// Resolves to [Closed] if the engine was dropped before the leave completed.
#[derive(Debug)]
pub struct LeaveGroup {
    rx: Option<oneshot::Receiver<()>>,
}

impl LeaveGroup {
    fn done() -> Self {
        Self { rx: None }
    }

    /// Returns the outcome of the leave if it has finished, without waiting.
    pub fn try_complete(&mut self) -> Option<Result<(), Closed>> {
        match self.rx.as_mut().map(|rx| rx.try_recv()) {
            None | Some(Ok(())) => Some(Ok(())),
            Some(Err(TryRecvError::Empty)) => None,
            Some(Err(TryRecvError::Closed)) => Some(Err(Closed)),
        }
    }
}

impl Future for LeaveGroup {
    type Output = Result<(), Closed>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.rx.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(rx) => Pin::new(rx).poll(ctx).map(|r| r.map_err(|_| Closed)),
        }
    }
}

pub(crate) struct MembershipManager {
    identity: Identity,
    state: MemberState,
    member_epoch: i32,

    target: LocalAssignment,
    current: LocalAssignment,

    reconciliation_in_progress: bool,
    rejoined_while_reconciling: bool,
    revoke_after_reconciliation: bool,

    subscription_updated: bool,
    leaving_due_to_poll_timer: bool,
    stale_release_pending: bool,
    rejoin_when_released: bool,

    leave_waiters: Vec<oneshot::Sender<()>>,
    outstanding: Vec<(PendingCallback, Continuation)>,

    tracker: Arc<dyn OwnershipTracker>,
    events: EventSender,
    listeners: Listeners,
}

impl MembershipManager {
    pub(crate) fn new(
        identity: Identity,
        tracker: Arc<dyn OwnershipTracker>,
        events: EventSender,
    ) -> Self {
        Self {
            identity,
            state: MemberState::Unsubscribed,
            member_epoch: JOIN_EPOCH,

            target: LocalAssignment::none(),
            current: LocalAssignment::none(),

            reconciliation_in_progress: false,
            rejoined_while_reconciling: false,
            revoke_after_reconciliation: false,

            subscription_updated: false,
            leaving_due_to_poll_timer: false,
            stale_release_pending: false,
            rejoin_when_released: false,

            leave_waiters: Vec::new(),
            outstanding: Vec::new(),

            tracker,
            events,
            listeners: Listeners::default(),
        }
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn state(&self) -> MemberState {
        self.state
    }

    pub(crate) fn member_epoch(&self) -> i32 {
        self.member_epoch
    }

    pub(crate) fn current(&self) -> &LocalAssignment {
        &self.current
    }

    pub(crate) fn target(&self) -> &LocalAssignment {
        &self.target
    }

    pub(crate) fn events(&self) -> &EventSender {
        &self.events
    }

    pub(crate) fn register_listener(&mut self, l: &Arc<dyn MemberStateListener>) {
        self.listeners.register(l);
    }

    /// Surface an error to the application.
    pub(crate) fn surface(&self, e: GroupError) {
        self.events.error(e);
    }

    pub(crate) fn is_leaving_group(&self) -> bool {
        matches!(self.state, MemberState::PrepareLeaving | MemberState::Leaving)
    }

    pub(crate) fn should_skip_heartbeat(&self) -> bool {
        self.state.is_not_in_group()
    }

    /// Returns true if the next heartbeat shouldn't wait for the heartbeat interval.
    pub(crate) fn should_heartbeat_now(&self) -> bool {
        use MemberState::*;
        matches!(self.state, Joining | Acknowledging | Leaving)
    }

    fn transition_to(&mut self, next: MemberState) {
        // NOTE(invariant): every state declares the states it may be entered from
        assert!(
            next.can_transition_from(self.state),
            "invalid member state transition: {} -> {}",
            self.state,
            next
        );

        info!(
            "member {} transitioned: {} -> {}",
            self.identity.member_id, self.state, next
        );
        self.state = next;
    }

    fn update_member_epoch(&mut self, epoch: i32) {
        if epoch == self.member_epoch {
            return;
        }

        debug!("member epoch updated: {} -> {}", self.member_epoch, epoch);
        self.member_epoch = epoch;

        let epoch = if epoch > 0 { Some(epoch) } else { None };
        (self.listeners).epoch_updated(epoch, &self.identity.member_id);
    }

    /// Record that the application changed its subscription. The member joins on the next
    /// application poll if it isn't already in the group.
    pub(crate) fn on_subscription_updated(&mut self) {
        self.subscription_updated = true;
    }

    /// Called whenever the application polls.
    pub(crate) fn on_application_poll(&mut self) {
        if !self.subscription_updated {
            return;
        }
        self.subscription_updated = false;

        match self.state {
            MemberState::Unsubscribed => self.transition_to_joining(),
            MemberState::Fatal => warn!("not joining group {}: member failed", self.group_id()),
            s => debug!("subscription updated in state {}; sent with next heartbeat", s),
        }
    }

    fn group_id(&self) -> &str {
        &self.identity.group_id
    }

    pub(crate) fn on_heartbeat_success(&mut self, epoch: i32, target: Option<Assignment>) {
        match self.state {
            MemberState::Leaving => {
                debug!("ignoring heartbeat response received while leaving");
                return;
            }

            MemberState::Unsubscribed => {
                info!("member {} left group {}", self.identity.member_id, self.group_id());
                self.complete_leave();
                return;
            }

            s if s.is_not_in_group() => {
                debug!("ignoring heartbeat response received in state {}", s);
                return;
            }

            _ => {}
        }

        self.update_member_epoch(epoch);

        let tasks = match target {
            Some(tasks) => tasks,
            None => return,
        };

        if self.state == MemberState::PrepareLeaving {
            debug!("ignoring assignment received while preparing to leave");
            return;
        }

        self.process_assignment_received(tasks);
    }

    fn process_assignment_received(&mut self, tasks: Assignment) {
        self.target = self.target.update_with(tasks);

        // an in-flight pass may have changed ownership already; let it finish and converge
        if self.target != self.current || self.reconciliation_in_progress {
            self.transition_to(MemberState::Reconciling);
        } else if matches!(
            self.state,
            MemberState::Joining | MemberState::Reconciling
        ) {
            self.transition_to(MemberState::Stable);
        }
    }

    /// Called after a heartbeat request is built, and before it is sent.
    pub(crate) fn on_heartbeat_request_generated(&mut self) {
        match self.state {
            MemberState::Acknowledging if self.target == self.current => {
                self.transition_to(MemberState::Stable);
            }

            MemberState::Acknowledging => {
                debug!("newer target {} arrived while acknowledging", self.target);
                self.transition_to(MemberState::Reconciling);
            }

            MemberState::Leaving if self.leaving_due_to_poll_timer => {
                self.transition_to_stale();
            }

            MemberState::Leaving => {
                self.transition_to(MemberState::Unsubscribed);
            }

            _ => {}
        }
    }

    /// Called when a heartbeat couldn't be sent because no coordinator is known.
    pub(crate) fn on_heartbeat_request_skipped(&mut self) {
        if self.state != MemberState::Leaving {
            return;
        }

        info!("leave heartbeat could not be sent: no known coordinator");

        if self.leaving_due_to_poll_timer {
            self.transition_to_stale();
        } else {
            self.transition_to(MemberState::Unsubscribed);
            self.complete_leave();
        }
    }

    pub(crate) fn on_heartbeat_failure(&mut self) {
        if self.state == MemberState::Unsubscribed {
            self.complete_leave();
        }
    }

    pub(crate) fn transition_to_joining(&mut self) {
        if self.state == MemberState::Fatal {
            warn!("not rejoining group {}: member failed", self.group_id());
            return;
        }

        if self.reconciliation_in_progress {
            self.rejoined_while_reconciling = true;
        }

        self.update_member_epoch(JOIN_EPOCH);
        self.transition_to(MemberState::Joining);

        self.target = LocalAssignment::none();
        self.current = LocalAssignment::none();
    }

    /// Release everything and rejoin, following a fencing error.
    pub(crate) fn transition_to_fenced(&mut self) {
        match self.state {
            MemberState::PrepareLeaving => {
                info!("fenced while preparing to leave; completing leave without heartbeat");
                self.finalize_leaving();
                self.clear_assignment();
                self.transition_to(MemberState::Unsubscribed);
                self.complete_leave();
                return;
            }

            MemberState::Leaving => {
                info!("fenced while leaving; completing leave");
                self.transition_to(MemberState::Unsubscribed);
                self.complete_leave();
                return;
            }

            s if s.is_not_in_group() => {
                debug!("ignoring fencing error in state {}", s);
                return;
            }

            _ => {}
        }

        warn!(
            "member {} fenced at epoch {}; releasing assignment and rejoining",
            self.identity.member_id, self.member_epoch
        );

        self.transition_to(MemberState::Fenced);
        self.update_member_epoch(JOIN_EPOCH);
        self.release_lost(AfterLost::Rejoin);
    }

    /// Stop participating in the group. Terminal.
    pub(crate) fn transition_to_fatal(&mut self) {
        let prev = self.state;
        if prev == MemberState::Fatal {
            return;
        }

        self.transition_to(MemberState::Fatal);
        error!(
            "member {} of group {} failed fatally in state {}",
            self.identity.member_id,
            self.group_id(),
            prev
        );

        self.update_member_epoch(LEAVE_EPOCH);
        self.leaving_due_to_poll_timer = false;
        self.target = LocalAssignment::none();

        match prev {
            MemberState::Unsubscribed => self.complete_leave(),

            MemberState::Fenced | MemberState::Stale => {
                debug!("assignment is already being released");
            }

            MemberState::PrepareLeaving | MemberState::Leaving => {
                info!("discarding leave in favor of fatal error");
                self.clear_assignment();
                self.complete_leave();
            }

            _ => self.release_lost(AfterLost::Release),
        }
    }

    fn transition_to_stale(&mut self) {
        self.transition_to(MemberState::Stale);
        self.leaving_due_to_poll_timer = false;

        info!(
            "member {} left group {} after poll timer expiry; releasing assignment",
            self.identity.member_id,
            self.group_id()
        );

        self.stale_release_pending = true;
        self.release_lost(AfterLost::Stale);
    }

    /// Rejoin if the member went stale. Called when the application polls again after the
    /// poll timer expired.
    pub(crate) fn maybe_rejoin_stale_member(&mut self) {
        self.leaving_due_to_poll_timer = false;

        if self.state != MemberState::Stale {
            return;
        }

        if self.stale_release_pending {
            debug!("stale member will rejoin once its assignment is released");
            self.rejoin_when_released = true;
        } else {
            self.transition_to_joining();
        }
    }

    /// Begin leaving the group. If `run_callbacks` is set, owned tasks are revoked through the
    /// application before the leave heartbeat is sent.
    pub(crate) fn leave_group(&mut self, run_callbacks: bool) -> LeaveGroup {
        self.subscription_updated = false;

        if self.state.is_not_in_group() {
            if matches!(self.state, MemberState::Fenced | MemberState::Stale) {
                self.clear_assignment();
                self.rejoin_when_released = false;
                self.transition_to(MemberState::Unsubscribed);
            }

            return LeaveGroup::done();
        }

        if self.is_leaving_group() {
            debug!("leave already in progress");
            return self.leave_waiter();
        }

        self.transition_to(MemberState::PrepareLeaving);
        let leave = self.leave_waiter();

        if !run_callbacks {
            self.clear_assignment_and_leave();
        } else if self.reconciliation_in_progress {
            // the pass's callback must complete before anything else is revoked
            debug!("revoking before leave once the in-flight reconciliation ends");
            self.revoke_after_reconciliation = true;
        } else {
            let tasks = self.current.tasks().active_tasks();
            self.revoke_before_leaving(tasks, &BTreeSet::new());
        }

        leave
    }

    /// Dispatch the revoke callback for everything owned except `released`, then leave.
    fn revoke_before_leaving(
        &mut self,
        tasks: BTreeSet<TaskId>,
        released: &BTreeSet<TopicPartition>,
    ) {
        let partitions: BTreeSet<_> = (self.tracker.currently_owned())
            .difference(released)
            .cloned()
            .collect();

        if tasks.is_empty() && partitions.is_empty() {
            self.clear_assignment_and_leave();
            return;
        }

        self.tracker.mark_pending_revocation(&partitions);

        let pending = self.events.dispatch(Callback::Revoked { tasks, partitions });
        self.outstanding.push((pending, Continuation::Leaving));
    }

    fn clear_assignment_and_leave(&mut self) {
        self.clear_assignment();
        self.transition_to_sending_leave_group(false);
    }

    /// Move to [Leaving](MemberState::Leaving), so the next heartbeat leaves the group.
    pub(crate) fn transition_to_sending_leave_group(&mut self, due_to_poll_timer: bool) {
        if self.state == MemberState::Fatal {
            warn!("not sending leave heartbeat: member failed");
            return;
        }

        if due_to_poll_timer {
            self.leaving_due_to_poll_timer = true;
            self.transition_to(MemberState::PrepareLeaving);
        }

        self.finalize_leaving();
        self.transition_to(MemberState::Leaving);
    }

    fn finalize_leaving(&mut self) {
        self.update_member_epoch(self.identity.leave_epoch());
        self.target = LocalAssignment::none();
    }

    fn leave_waiter(&mut self) -> LeaveGroup {
        let (tx, rx) = oneshot::channel();
        self.leave_waiters.push(tx);
        LeaveGroup { rx: Some(rx) }
    }

    fn complete_leave(&mut self) {
        for tx in self.leave_waiters.drain(..) {
            let _ = tx.send(());
        }
    }

    fn release_lost(&mut self, then: AfterLost) {
        let partitions = self.tracker.currently_owned();
        self.tracker.mark_pending_revocation(&partitions);

        let pending = self.events.dispatch(Callback::Lost { partitions });
        self.outstanding.push((pending, Continuation::Lost(then)));
    }

    fn clear_assignment(&mut self) {
        self.revoke_after_reconciliation = false;
        self.tracker.clear_all();
        self.current = LocalAssignment::none();
        self.listeners.assignment_updated(&BTreeSet::new());
    }
}
