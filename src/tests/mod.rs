// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use super::*;
use crate::{
    events::EventReceiver,
    heartbeat::proto::{HeartbeatRequest, HeartbeatResponse},
    membership::{JOIN_EPOCH, LEAVE_EPOCH, LEAVE_STATIC_EPOCH},
};

use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};

const INTERVAL: Duration = Duration::from_secs(1);

struct Member {
    engine: Engine<ConsumerProtocol>,
    events: EventReceiver,
    owned: Arc<SharedOwnership>,
    now: Instant,
}

impl Member {
    fn new() -> Self {
        Self::with_config(MemberConfig::new("group").jitter(0.0))
    }

    fn with_config(cfg: MemberConfig) -> Self {
        let now = Instant::now();
        let (tx, events) = events::channel();
        let owned = Arc::new(SharedOwnership::new());

        let coordinator = Coordinator {
            id: 1,
            addr: "127.0.0.1:9092".parse().unwrap(),
        };

        let rediscovery = cfg.get_coordinator_rediscovery();

        let engine = Engine::new(
            cfg,
            ConsumerProtocol::new(vec!["orders"]),
            StaticCoordinator::new(coordinator, rediscovery),
            Arc::clone(&owned) as Arc<dyn OwnershipTracker>,
            tx,
            now,
        );

        Self {
            engine,
            events,
            owned,
            now,
        }
    }

    fn poll(&mut self) -> PollResult {
        self.engine.poll(self.now)
    }

    fn heartbeat(&mut self) -> HeartbeatRequest {
        self.poll().outbound.expect("a heartbeat is due").request
    }

    fn respond(&mut self, rsp: HeartbeatResponse) {
        self.engine.on_heartbeat_success(rsp, self.now);
    }

    fn join(&mut self) {
        self.engine.subscribe();
        self.engine.on_application_poll(self.now);
        assert_eq!(MemberState::Joining, self.engine.state());
        assert_eq!(JOIN_EPOCH, self.heartbeat().member_epoch);
    }

    /// Join, and reconcile `partitions` at epoch 1.
    fn stable(&mut self, partitions: Vec<i32>) {
        self.join();
        self.respond(assign(1, partitions));

        self.poll();
        self.next_callback().complete(Ok(()));

        let ack = self.heartbeat();
        assert!(ack.owned.is_some());
        self.respond(HeartbeatResponse::ok(1, INTERVAL));

        assert_eq!(MemberState::Stable, self.engine.state());
    }

    fn next_callback(&mut self) -> CallbackRequest {
        loop {
            match self.events.try_recv() {
                Some(Event::Callback(req)) => return req,
                Some(Event::Error(_)) => continue,
                None => panic!("no callback was dispatched"),
            }
        }
    }

    fn next_error(&mut self) -> GroupError {
        loop {
            match self.events.try_recv() {
                Some(Event::Error(e)) => return e,
                Some(Event::Callback(_)) => continue,
                None => panic!("no error was surfaced"),
            }
        }
    }

    fn outstanding(&self) -> usize {
        self.engine.membership().outstanding_reconciliations()
    }
}

fn assign(epoch: i32, partitions: Vec<i32>) -> HeartbeatResponse {
    HeartbeatResponse::ok(epoch, INTERVAL)
        .with_assignment(Assignment::default().active("orders", partitions))
}

fn tps(partitions: &[i32]) -> BTreeSet<TopicPartition> {
    (partitions.iter())
        .map(|&p| TopicPartition::new("orders", p))
        .collect()
}

fn tasks_of(partitions: &[i32]) -> BTreeSet<TaskId> {
    (partitions.iter())
        .map(|&p| TaskId::new("orders", p))
        .collect()
}

#[test]
fn newer_target_waits_for_in_flight_pass() {
    let mut m = Member::new();
    m.join();
    m.respond(assign(1, vec![0, 1]));

    m.poll();
    assert_eq!(1, m.outstanding());
    let first = m.next_callback();

    m.respond(assign(2, vec![2]));
    m.poll();
    assert_eq!(1, m.outstanding());
    assert!(m.events.try_recv().is_none());

    first.complete(Ok(()));
    m.poll();

    // the pass commits what it captured, not the newer target
    assert_eq!(0, m.engine.current_assignment().local_epoch());
    assert_eq!(tps(&[0, 1]), m.owned.fetchable());
    assert_eq!(MemberState::Reconciling, m.engine.state());

    m.poll();
    match m.next_callback().callback() {
        Callback::Revoked { partitions, .. } => assert_eq!(&tps(&[0, 1]), partitions),
        cb => panic!("expected a revoke callback, got {:?}", cb),
    }
    assert!(m.owned.fetchable().is_empty());
}

#[test]
fn rejoin_discards_in_flight_pass() {
    let mut m = Member::new();
    m.join();
    m.respond(assign(1, vec![0]));

    m.poll();
    let assigned = m.next_callback();

    m.respond(HeartbeatResponse::error(ErrorCode::FencedMemberEpoch, None));
    assert_eq!(MemberState::Fenced, m.engine.state());
    assert_eq!(JOIN_EPOCH, m.engine.member_epoch());

    m.next_callback().complete(Ok(()));
    m.poll();
    assert_eq!(MemberState::Joining, m.engine.state());

    assigned.complete(Ok(()));
    m.poll();

    assert_eq!(0, m.outstanding());
    assert!(m.engine.current_assignment().is_none());
    assert!(m.owned.currently_owned().is_empty());
}

#[test]
fn fatal_error_discards_leave() {
    let mut m = Member::new();
    m.stable(vec![0]);

    let mut leave = m.engine.leave_group();
    assert_eq!(MemberState::PrepareLeaving, m.engine.state());
    let revoke = m.next_callback();

    m.respond(HeartbeatResponse::error(ErrorCode::InvalidRequest, None));

    assert_eq!(MemberState::Fatal, m.engine.state());
    assert_eq!(LEAVE_EPOCH, m.engine.member_epoch());
    assert!(m.engine.target_assignment().is_none());
    assert_eq!(Some(Ok(())), leave.try_complete());
    assert!(m.owned.currently_owned().is_empty());

    match m.next_error() {
        GroupError::Fatal { code, .. } => assert_eq!(ErrorCode::InvalidRequest, code),
        e => panic!("unexpected error: {}", e),
    }

    revoke.complete(Ok(()));
    assert_eq!(None, m.poll().outbound);
    assert_eq!(MemberState::Fatal, m.engine.state());
}

#[test]
fn leave_revokes_partitions_awaiting_assign() {
    let mut m = Member::new();
    m.join();
    m.respond(assign(1, vec![0]));

    m.poll();
    let assigned = m.next_callback();
    assert_eq!(tps(&[0]), m.owned.currently_owned());

    let mut leave = m.engine.leave_group();
    assert_eq!(MemberState::PrepareLeaving, m.engine.state());
    assert!(m.events.try_recv().is_none());

    assigned.complete(Ok(()));
    m.poll();

    let revoke = m.next_callback();
    match revoke.callback() {
        Callback::Revoked { tasks, partitions } => {
            assert_eq!(&tasks_of(&[0]), tasks);
            assert_eq!(&tps(&[0]), partitions);
        }
        cb => panic!("expected a revoke callback, got {:?}", cb),
    }
    assert!(m.owned.fetchable().is_empty());

    revoke.complete(Ok(()));
    let req = m.heartbeat();
    assert!(req.is_leave());
    assert!(m.owned.currently_owned().is_empty());

    m.respond(HeartbeatResponse::ok(LEAVE_EPOCH, INTERVAL));
    assert_eq!(Some(Ok(())), leave.try_complete());
}

#[test]
fn leave_waits_for_in_flight_revoke() {
    let mut m = Member::new();
    m.stable(vec![0, 1]);

    m.respond(assign(2, vec![1]));
    m.poll();
    let first = m.next_callback();
    match first.callback() {
        Callback::Revoked { partitions, .. } => assert_eq!(&tps(&[0]), partitions),
        cb => panic!("expected a revoke callback, got {:?}", cb),
    }

    let _leave = m.engine.leave_group();
    assert!(m.events.try_recv().is_none());

    first.complete(Ok(()));
    m.poll();
    assert_eq!(0, m.outstanding());

    // only what the application still holds is revoked again
    match m.next_callback().callback() {
        Callback::Revoked { tasks, partitions } => {
            assert_eq!(&tasks_of(&[1]), tasks);
            assert_eq!(&tps(&[1]), partitions);
        }
        cb => panic!("expected a revoke callback, got {:?}", cb),
    }
    assert!(m.events.try_recv().is_none());
    assert_eq!(MemberState::PrepareLeaving, m.engine.state());
}

#[test]
fn static_member_leaves_with_static_epoch() {
    let mut m = Member::with_config(MemberConfig::new("group").instance_id("i-1").jitter(0.0));
    m.join();
    m.respond(HeartbeatResponse::ok(1, INTERVAL).with_assignment(Assignment::default()));
    assert_eq!(MemberState::Stable, m.engine.state());

    let mut leave = m.engine.leave_group_on_close();
    assert_eq!(MemberState::Leaving, m.engine.state());

    let req = m.heartbeat();
    assert_eq!(LEAVE_STATIC_EPOCH, req.member_epoch);
    assert_eq!(Some("i-1".to_owned()), req.instance_id);
    assert!(req.is_leave());

    assert_eq!(MemberState::Unsubscribed, m.engine.state());
    assert_eq!(None, leave.try_complete());

    m.respond(HeartbeatResponse::ok(LEAVE_STATIC_EPOCH, INTERVAL));
    assert_eq!(Some(Ok(())), leave.try_complete());
}

#[test]
fn stale_member_rejoins_after_release() {
    let cfg = MemberConfig::new("group")
        .max_poll_interval(Duration::from_secs(10))
        .jitter(0.0);

    let mut m = Member::with_config(cfg);
    m.stable(vec![0]);

    m.now += Duration::from_secs(11);
    let out = m.poll().outbound.expect("a leave heartbeat");
    assert!(out.ignore_response);
    assert_eq!(LEAVE_EPOCH, out.request.member_epoch);
    assert_eq!(MemberState::Stale, m.engine.state());

    let lost = m.next_callback();
    assert_eq!(
        &Callback::Lost {
            partitions: tps(&[0])
        },
        lost.callback()
    );

    m.engine.on_application_poll(m.now);
    assert_eq!(MemberState::Stale, m.engine.state());

    lost.complete(Ok(()));
    let req = m.heartbeat();

    assert_eq!(MemberState::Joining, m.engine.state());
    assert_eq!(JOIN_EPOCH, req.member_epoch);
    assert!(m.owned.currently_owned().is_empty());
}

#[test]
fn unchanged_fields_are_omitted() {
    let mut m = Member::new();
    m.stable(vec![0]);

    m.now += INTERVAL;
    let req = m.heartbeat();

    assert_eq!(1, req.member_epoch);
    assert_eq!(None, req.subscription);
    assert_eq!(None, req.rebalance_timeout);
    assert_eq!(None, req.owned);
}

#[test]
fn full_heartbeat_after_failure() {
    let mut m = Member::new();
    m.stable(vec![0]);

    m.now += INTERVAL;
    m.heartbeat();
    m.engine.on_heartbeat_failure(TransportError::Timeout, m.now);

    m.now += Duration::from_millis(100);
    let req = m.heartbeat();
    assert!(req.subscription.is_some());
    assert!(req.owned.is_some());
}

#[derive(Default)]
struct Epochs(Mutex<Vec<Option<i32>>>);

impl MemberStateListener for Epochs {
    fn on_member_epoch_updated(&self, epoch: Option<i32>, _: &str) {
        self.0.lock().push(epoch);
    }
}

#[test]
fn listeners_observe_epochs() {
    let mut m = Member::new();
    let epochs = Arc::new(Epochs::default());
    let l: Arc<dyn MemberStateListener> = epochs.clone();
    m.engine.register_state_listener(&l);

    m.join();
    m.respond(HeartbeatResponse::ok(3, INTERVAL).with_assignment(Assignment::default()));
    m.respond(HeartbeatResponse::error(ErrorCode::UnknownMemberId, None));

    assert_eq!(vec![Some(3), None], *epochs.0.lock());
}

#[derive(Default)]
struct Owned(Mutex<Vec<BTreeSet<TopicPartition>>>);

impl MemberStateListener for Owned {
    fn on_member_epoch_updated(&self, _: Option<i32>, _: &str) {}

    fn on_group_assignment_updated(&self, partitions: &BTreeSet<TopicPartition>) {
        self.0.lock().push(partitions.clone());
    }
}

#[test]
fn listeners_observe_owned_partitions() {
    let mut m = Member::new();
    let owned = Arc::new(Owned::default());
    let l: Arc<dyn MemberStateListener> = owned.clone();
    m.engine.register_state_listener(&l);

    m.stable(vec![0, 1]);
    assert_eq!(vec![tps(&[0, 1])], *owned.0.lock());

    m.respond(HeartbeatResponse::error(ErrorCode::FencedMemberEpoch, None));
    m.next_callback().complete(Ok(()));
    m.poll();

    assert_eq!(vec![tps(&[0, 1]), BTreeSet::new()], *owned.0.lock());
}
