// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The heartbeat engine.
//!
//! An [Engine] never performs I/O, and never reads a clock. Whoever drives it calls
//! [poll](Engine::poll) with the current time, sends the heartbeat it returns (if any), and
//! feeds the outcome back through [on_heartbeat_success](Engine::on_heartbeat_success) or
//! [on_heartbeat_failure](Engine::on_heartbeat_failure). See [driver](crate::driver) for a
//! ready-made tokio driver.
pub mod proto;
pub mod protocol;
pub mod state;

use crate::{
    config::MemberConfig,
    coordinator::{Coordinator, CoordinatorDiscovery},
    error::{ErrorCode, ErrorKind, GroupError, TransportError},
    events::EventSender,
    membership::{
        Identity, LeaveGroup, LocalAssignment, MemberState, MemberStateListener,
        MembershipManager, JOIN_EPOCH,
    },
    ownership::OwnershipTracker,
    timing::{ExponentialBackoff, Timer},
};
use proto::{HeartbeatRequest, HeartbeatResponse};
use protocol::GroupProtocol;
use state::{HeartbeatRequestState, SentFields};

use log::{debug, error, info, warn};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Notify;

/// A heartbeat that should be sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outbound {
    /// Where to send it.
    pub coordinator: Coordinator,
    /// What to send.
    pub request: HeartbeatRequest,
    /// If set, the outcome of this heartbeat must not be fed back to the engine.
    pub ignore_response: bool,
}

/// The outcome of a [poll](Engine::poll).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollResult {
    /// A heartbeat to send, if one is due.
    pub outbound: Option<Outbound>,
    /// How long the caller may wait before polling again, unless something else happens
    /// first.
    pub next_poll: Duration,
}

/// The member-side group membership engine.
pub struct Engine<P> {
    cfg: MemberConfig,
    protocol: P,
    membership: MembershipManager,
    coordinator: Box<dyn CoordinatorDiscovery>,
    request_state: HeartbeatRequestState,
    sent: SentFields,
    poll_timer: Timer,
}

impl<P: GroupProtocol> Engine<P> {
    /// Create an engine. The member starts out [unsubscribed](MemberState::Unsubscribed);
    /// call [subscribe](Engine::subscribe) and [on_application_poll](Engine::on_application_poll)
    /// to join the group.
    pub fn new<C>(
        cfg: MemberConfig,
        protocol: P,
        coordinator: C,
        tracker: Arc<dyn OwnershipTracker>,
        events: EventSender,
        now: Instant,
    ) -> Self
    where
        C: CoordinatorDiscovery + 'static,
    {
        let identity = Identity::new(cfg.group_id.clone(), cfg.instance_id.clone());

        let backoff = ExponentialBackoff::new(
            cfg.retry_backoff,
            2,
            cfg.retry_backoff_max,
            cfg.jitter,
        );

        info!(
            "created member {} of group {}",
            identity.member_id(),
            identity.group_id()
        );

        Self {
            membership: MembershipManager::new(identity, tracker, events),
            coordinator: Box::new(coordinator),
            request_state: HeartbeatRequestState::new(now, backoff),
            sent: SentFields::default(),
            poll_timer: Timer::new(now, cfg.max_poll_interval),
            protocol,
            cfg,
        }
    }

    /// Advance the engine to `now`.
    ///
    /// Completed callbacks are processed, reconciliation is started if needed, and a
    /// heartbeat is returned if one is due.
    pub fn poll(&mut self, now: Instant) -> PollResult {
        self.membership.poll_callbacks();
        self.membership.maybe_reconcile(&self.protocol);

        let coordinator = match self.coordinator.coordinator(now) {
            Some(c) => c.clone(),
            None => {
                self.membership.on_heartbeat_request_skipped();
                return PollResult::idle(self.cfg.retry_backoff);
            }
        };

        if self.membership.should_skip_heartbeat() {
            self.membership.on_heartbeat_request_skipped();
            let next = self.request_state.interval().max(self.cfg.retry_backoff);
            return PollResult::idle(next);
        }

        self.poll_timer.update(now);
        if self.poll_timer.is_expired() && !self.membership.is_leaving_group() {
            return self.leave_on_poll_timer_expiry(coordinator, now);
        }

        let heartbeat_now = self.membership.should_heartbeat_now()
            && !self.request_state.in_flight()
            && self.request_state.backoff_elapsed(now);

        if !self.request_state.can_send(now) && !heartbeat_now {
            let next = (self.request_state.time_to_next_heartbeat(now))
                .min(self.until_poll_timeout());
            return PollResult::idle(next);
        }

        let request = self.make_request(now);

        PollResult {
            outbound: Some(Outbound {
                coordinator,
                request,
                ignore_response: false,
            }),
            next_poll: self.request_state.interval().min(self.until_poll_timeout()),
        }
    }

    fn until_poll_timeout(&self) -> Duration {
        if self.membership.is_leaving_group() {
            return Duration::MAX;
        }
        self.poll_timer.remaining()
    }

    fn leave_on_poll_timer_expiry(&mut self, coordinator: Coordinator, now: Instant) -> PollResult {
        warn!(
            "consumer poll timeout has expired: {:?} since the last poll exceeds the maximum \
             poll interval of {:?}; leaving group {}",
            self.poll_timer.expired_by() + self.cfg.max_poll_interval,
            self.cfg.max_poll_interval,
            self.cfg.group_id
        );

        self.membership.transition_to_sending_leave_group(true);
        let request = self.make_request(now);

        // the outcome of this heartbeat doesn't matter; we can rejoin either way
        self.request_state.reset();
        self.sent.reset();

        PollResult {
            outbound: Some(Outbound {
                coordinator,
                request,
                ignore_response: true,
            }),
            next_poll: self.request_state.interval().max(self.cfg.retry_backoff),
        }
    }

    fn make_request(&mut self, now: Instant) -> HeartbeatRequest {
        let request = self.build_request();
        debug!("sending heartbeat: {:?}", request);

        self.request_state.on_send_attempt(now);
        self.membership.on_heartbeat_request_generated();

        request
    }

    fn build_request(&mut self) -> HeartbeatRequest {
        let identity = self.membership.identity();
        let epoch = self.membership.member_epoch();

        let mut request = HeartbeatRequest {
            group_id: identity.group_id().to_owned(),
            member_id: identity.member_id().to_owned(),
            member_epoch: epoch,
            ..HeartbeatRequest::default()
        };

        if self.membership.state() == MemberState::Leaving {
            request.instance_id = identity.instance_id().map(str::to_owned);
            return request;
        }

        if epoch == JOIN_EPOCH {
            self.sent.reset();
        }

        let sent = &mut self.sent;

        if let Some(id) = identity.instance_id() {
            request.instance_id = SentFields::diff(&mut sent.instance_id, &id.to_owned());
        }

        request.rebalance_timeout =
            SentFields::diff(&mut sent.rebalance_timeout, &self.cfg.rebalance_timeout());

        request.subscription =
            SentFields::diff(&mut sent.subscription, &self.protocol.subscription());

        let current = self.membership.current();
        if SentFields::diff(&mut sent.owned_epoch, &current.local_epoch()).is_some() {
            request.owned = Some(current.tasks().clone());
        }

        request
    }

    /// Feed back the response to a heartbeat.
    pub fn on_heartbeat_success(&mut self, response: HeartbeatResponse, now: Instant) {
        if response.error_code != ErrorCode::None {
            return self.on_error_response(response, now);
        }

        (self.request_state).on_successful_attempt(now, response.heartbeat_interval);

        let target = self.protocol.extract_target(&response);
        self.membership.on_heartbeat_success(response.member_epoch, target);
    }

    fn on_error_response(&mut self, response: HeartbeatResponse, now: Instant) {
        self.request_state.on_failed_attempt(now);
        self.sent.reset();

        let code = response.error_code;
        let message = response.error_message.unwrap_or_default();

        if self.membership.state() == MemberState::Unsubscribed {
            debug!("leave heartbeat failed with {}: {}", code, message);
            self.membership.on_heartbeat_failure();
            return;
        }

        match self.protocol.classify(code) {
            ErrorKind::CoordinatorStale => {
                info!("heartbeat failed with {}; rediscovering coordinator", code);
                let reason = format!("heartbeat failed with {}: {}", code, message);
                self.coordinator.mark_unknown(&reason, now);
                self.request_state.reset();
            }

            ErrorKind::Retriable => {
                info!("heartbeat failed with {}; retrying after backoff", code);
            }

            ErrorKind::Fencing => {
                info!("heartbeat failed with {}: {}", code, message);
                self.membership.transition_to_fenced();
                self.request_state.reset();
            }

            ErrorKind::Authorization => {
                error!("heartbeat failed with {}: {}", code, message);
                self.membership.surface(GroupError::Authorization {
                    group_id: self.cfg.group_id.clone(),
                    code,
                    message,
                });
            }

            ErrorKind::Fatal => {
                error!("heartbeat failed with {}: {}", code, message);
                self.membership.surface(GroupError::Fatal { code, message });
                self.membership.transition_to_fatal();
            }
        }

        self.membership.on_heartbeat_failure();
    }

    /// Feed back a failure to deliver a heartbeat.
    pub fn on_heartbeat_failure(&mut self, e: TransportError, now: Instant) {
        self.request_state.on_failed_attempt(now);
        self.sent.reset();

        if self.membership.state() == MemberState::Unsubscribed {
            debug!("leave heartbeat failed: {}", e);
            self.membership.on_heartbeat_failure();
            return;
        }

        if e.is_retriable() {
            warn!("heartbeat failed: {}; retrying after backoff", e);

            if let TransportError::Disconnected(_) = e {
                self.coordinator.mark_unknown(&e.to_string(), now);
            }
        } else {
            error!("heartbeat failed: {}", e);
            self.membership.surface(GroupError::Transport(e));
            self.membership.transition_to_fatal();
        }

        self.membership.on_heartbeat_failure();
    }

    /// Record that the application polled at `now`. Pending subscription changes are
    /// applied, and the poll timer is reset.
    pub fn on_application_poll(&mut self, now: Instant) {
        self.membership.on_application_poll();
        self.reset_poll_timer(now);
    }

    /// Reset the poll timer. A member that went stale because the timer expired rejoins.
    pub fn reset_poll_timer(&mut self, now: Instant) {
        self.poll_timer.update(now);

        if self.poll_timer.is_expired() {
            warn!(
                "time between subsequent polls exceeded the maximum poll interval by {:?}",
                self.poll_timer.expired_by()
            );
            self.membership.maybe_rejoin_stale_member();
        }

        self.poll_timer.reset(self.cfg.max_poll_interval);
    }

    /// Record that the subscription changed. The member joins on the next application poll,
    /// if it isn't part of the group already; otherwise the new subscription is sent with
    /// the next heartbeat.
    pub fn subscribe(&mut self) {
        self.membership.on_subscription_updated();
    }

    /// Leave the group, revoking owned tasks through the application first.
    pub fn leave_group(&mut self) -> LeaveGroup {
        self.membership.leave_group(true)
    }

    /// Leave the group without running any callbacks.
    pub fn leave_group_on_close(&mut self) -> LeaveGroup {
        self.membership.leave_group(false)
    }

    /// Register a listener for epoch and assignment changes. The engine only keeps a weak
    /// reference to it.
    pub fn register_state_listener(&mut self, l: &Arc<dyn MemberStateListener>) {
        self.membership.register_listener(l);
    }

    /// Returns the member state.
    pub fn state(&self) -> MemberState {
        self.membership.state()
    }

    /// Returns the member epoch.
    pub fn member_epoch(&self) -> i32 {
        self.membership.member_epoch()
    }

    /// Returns the member id.
    pub fn member_id(&self) -> &str {
        self.membership.identity().member_id()
    }

    /// Returns the member's identity.
    pub fn identity(&self) -> &Identity {
        self.membership.identity()
    }

    /// Returns the assignment whose callbacks have completed.
    pub fn current_assignment(&self) -> &LocalAssignment {
        self.membership.current()
    }

    /// Returns the assignment the coordinator most recently asked for.
    pub fn target_assignment(&self) -> &LocalAssignment {
        self.membership.target()
    }

    /// Returns the group protocol.
    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    /// Returns the group protocol mutably, e.g. to change the subscription.
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MemberConfig {
        &self.cfg
    }

    /// Returns a [Notify] that is signaled whenever a callback request completes.
    pub fn completions(&self) -> Arc<Notify> {
        self.membership.events().completions()
    }

    #[cfg(test)]
    pub(crate) fn membership(&self) -> &MembershipManager {
        &self.membership
    }
}

impl PollResult {
    fn idle(next_poll: Duration) -> Self {
        Self {
            outbound: None,
            next_poll,
        }
    }
}
