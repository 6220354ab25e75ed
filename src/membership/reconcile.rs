// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Converging the current assignment towards the target.
//!
//! A reconciliation pass runs in up to two steps, each ending in a callback dispatched to
//! the application:
//!
//! 1. Partitions owned now but absent from the target are marked pending revocation, and
//!    the revoke callback is dispatched.
//! 2. Once it completes, if the pass is still relevant, the target's partitions are
//!    recorded as owned (newly added ones awaiting the callback), and the assign callback
//!    is dispatched.
//!
//! When the assign callback completes, newly added partitions become fetchable and the
//! target captured at the start of the pass becomes the current assignment.
//!
//! Dispatched callbacks can't be cancelled. A pass that becomes irrelevant (the member left
//! [Reconciling](MemberState::Reconciling), or rejoined) is discarded when it resumes. A
//! leave requested meanwhile revokes whatever the discarded pass left owned.
use super::{LocalAssignment, MemberState, MembershipManager, TaskId};
use crate::{
    error::{CallbackError, GroupError},
    events::Callback,
    ownership::TopicPartition,
    topology::{partitions_for, Topology},
};
use log::{debug, error, info, trace};
use std::collections::BTreeSet;

/// What to do once a dispatched callback completes.
#[derive(Debug)]
pub(crate) enum Continuation {
    Revoked(Pass),
    Assigned(Pass),
    Leaving,
    Lost(AfterLost),
}

/// What to do once owned partitions were released through the lost callback.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum AfterLost {
    Rejoin,
    Stale,
    Release,
}

/// A reconciliation pass, carried across callbacks.
#[derive(Debug)]
pub(crate) struct Pass {
    target: LocalAssignment,
    assigned: BTreeSet<TopicPartition>,
    added: BTreeSet<TopicPartition>,
    revoked_tasks: BTreeSet<TaskId>,
    revoked: BTreeSet<TopicPartition>,
}

impl Continuation {
    #[cfg(test)]
    fn is_reconciliation(&self) -> bool {
        matches!(self, Self::Revoked(_) | Self::Assigned(_))
    }
}

impl MembershipManager {
    /// Start a reconciliation pass if the member is reconciling and no pass is in flight.
    pub(crate) fn maybe_reconcile(&mut self, topology: &dyn Topology) {
        if self.state != MemberState::Reconciling {
            return;
        }

        if self.reconciliation_in_progress {
            trace!("reconciliation in progress; target {} deferred", self.target);
            return;
        }

        if self.target == self.current {
            debug!("target {} is already reconciled", self.target);
            self.transition_to(MemberState::Stable);
            return;
        }

        self.reconciliation_in_progress = true;
        self.rejoined_while_reconciling = false;

        let target = self.target.clone();

        let owned_tasks = self.current.tasks().active_tasks();
        let target_tasks = target.tasks().active_tasks();

        let owned = partitions_for(topology, &owned_tasks);
        let assigned = partitions_for(topology, &target_tasks);

        let revoked_tasks: BTreeSet<_> = owned_tasks.difference(&target_tasks).cloned().collect();
        let revoked: BTreeSet<_> = owned.difference(&assigned).cloned().collect();
        let added: BTreeSet<_> = assigned.difference(&owned).cloned().collect();

        info!(
            "reconciling {} -> {}: revoking {} partition(s), adding {} partition(s)",
            self.current,
            target,
            revoked.len(),
            added.len()
        );

        let pass = Pass {
            target,
            assigned,
            added,
            revoked_tasks,
            revoked,
        };

        if pass.revoked_tasks.is_empty() && pass.revoked.is_empty() {
            self.assign(pass);
            return;
        }

        self.tracker.mark_pending_revocation(&pass.revoked);

        let pending = self.events.dispatch(Callback::Revoked {
            tasks: pass.revoked_tasks.clone(),
            partitions: pass.revoked.clone(),
        });
        self.outstanding.push((pending, Continuation::Revoked(pass)));
    }

    fn assign(&mut self, pass: Pass) {
        if self.maybe_abort("revoke") {
            // the application let go of the revoked tasks and still holds the rest
            let held = self.current.tasks().active_tasks();
            let held = held.difference(&pass.revoked_tasks).cloned().collect();
            self.end_pass(held, &pass.revoked);
            return;
        }

        (self.tracker).assign_awaiting_callback(&pass.assigned, &pass.added);
        self.listeners.assignment_updated(&pass.assigned);

        let pending = self.events.dispatch(Callback::Assigned {
            assignment: pass.target.tasks().clone(),
            added: pass.added.clone(),
        });
        self.outstanding.push((pending, Continuation::Assigned(pass)));
    }

    fn commit(&mut self, pass: Pass) {
        if self.maybe_abort("assign") {
            self.end_pass(pass.target.tasks().active_tasks(), &BTreeSet::new());
            return;
        }

        self.tracker.enable(&pass.added);

        info!("reconciled assignment {}", pass.target);
        self.current = pass.target;
        self.transition_to(MemberState::Acknowledging);
        self.mark_reconciliation_completed();
    }

    /// Returns true if the pass's outcome is no longer relevant.
    fn maybe_abort(&self, after: &str) -> bool {
        if self.state == MemberState::Reconciling && !self.rejoined_while_reconciling {
            return false;
        }

        info!(
            "discarding reconciliation after {} callback: state={} rejoined={}",
            after, self.state, self.rejoined_while_reconciling
        );
        true
    }

    fn mark_reconciliation_completed(&mut self) {
        self.reconciliation_in_progress = false;
        self.rejoined_while_reconciling = false;
    }

    /// End a pass that didn't commit. `held` are the tasks the application may still own,
    /// and `released` the partitions it has already given up.
    fn end_pass(&mut self, held: BTreeSet<TaskId>, released: &BTreeSet<TopicPartition>) {
        self.mark_reconciliation_completed();

        if !self.revoke_after_reconciliation {
            return;
        }
        self.revoke_after_reconciliation = false;

        if self.state == MemberState::PrepareLeaving {
            self.revoke_before_leaving(held, released);
        }
    }

    fn reconciliation_failed(&mut self, callback: &'static str, pass: Pass, e: CallbackError) {
        error!("{} callback failed; reconciliation will be retried: {}", callback, e);
        self.surface(GroupError::Callback {
            callback,
            source: e,
        });

        let mut held = self.current.tasks().active_tasks();
        if callback == "assign" {
            held.extend(pass.target.tasks().active_tasks());
        }
        self.end_pass(held, &BTreeSet::new());
    }

    /// Resume every continuation whose callback has completed, in dispatch order.
    pub(crate) fn poll_callbacks(&mut self) {
        let mut i = 0;

        while i < self.outstanding.len() {
            let result = match self.outstanding[i].0.try_complete() {
                Some(result) => result,
                None => {
                    i += 1;
                    continue;
                }
            };

            let (pending, k) = self.outstanding.remove(i);
            trace!("{} callback completed: {:?}", pending.name(), result);
            self.resume(k, result);
        }
    }

    fn resume(&mut self, k: Continuation, result: Result<(), CallbackError>) {
        match k {
            Continuation::Revoked(pass) => match result {
                Ok(()) => self.assign(pass),
                Err(e) => self.reconciliation_failed("revoke", pass, e),
            },

            Continuation::Assigned(pass) => match result {
                Ok(()) => self.commit(pass),
                Err(e) => self.reconciliation_failed("assign", pass, e),
            },

            Continuation::Leaving => {
                if let Err(e) = result {
                    error!("revoke callback failed while leaving: {}", e);
                    self.surface(GroupError::Callback {
                        callback: "revoke",
                        source: e,
                    });
                }

                if self.state == MemberState::PrepareLeaving {
                    self.clear_assignment_and_leave();
                } else if self.state.is_not_in_group() {
                    self.clear_assignment();
                }
            }

            Continuation::Lost(then) => {
                if let Err(e) = result {
                    error!("lost callback failed: {}", e);
                    self.surface(GroupError::Callback {
                        callback: "lost",
                        source: e,
                    });
                }

                if self.state.is_not_in_group() {
                    self.clear_assignment();
                }

                self.after_lost(then);
            }
        }
    }

    fn after_lost(&mut self, then: AfterLost) {
        match then {
            AfterLost::Rejoin if self.state == MemberState::Fenced => {
                self.transition_to_joining();
            }

            AfterLost::Rejoin => {
                debug!("not rejoining after fencing: state is now {}", self.state);
            }

            AfterLost::Stale => {
                self.stale_release_pending = false;

                if self.state == MemberState::Stale && self.rejoin_when_released {
                    self.rejoin_when_released = false;
                    self.transition_to_joining();
                }
            }

            AfterLost::Release => {}
        }
    }

    /// Returns the number of dispatched reconciliation callbacks that haven't completed.
    #[cfg(test)]
    pub(crate) fn outstanding_reconciliations(&self) -> usize {
        (self.outstanding.iter())
            .filter(|(_, k)| k.is_reconciliation())
            .count()
    }
}
