
use quickcheck_macros::quickcheck;
use shared::{assign, Member, INTERVAL};
use std::collections::{BTreeSet, VecDeque};
use tether::{
    heartbeat::proto::HeartbeatResponse, Assignment, Callback, CallbackRequest, Event,
    MemberState, TopicPartition,
};

fn partitions(raw: &[u8]) -> Vec<i32> {
    raw.iter().map(|&p| (p % 8) as i32).collect()
}

fn owned_by(a: &Assignment) -> BTreeSet<TopicPartition> {
    (a.active_tasks().into_iter())
        .map(|t| TopicPartition::new(t.subtopology, t.partition))
        .collect()
}

/// Moves every dispatched callback into `held`. Returns false if an error was surfaced.
fn drain(m: &mut Member, held: &mut VecDeque<CallbackRequest>) -> bool {
    while let Some(e) = m.events.try_recv() {
        match e {
            Event::Callback(req) => held.push_back(req),
            Event::Error(_) => return false,
        }
    }
    true
}

/// Polls, answering any heartbeat right away.
fn tick(m: &mut Member, epoch: i32) {
    if m.poll().is_some() {
        m.respond(HeartbeatResponse::ok(epoch, INTERVAL));
    }
}

/// Checks what must hold between any two polls.
fn is_safe(m: &Member, held: &VecDeque<CallbackRequest>) -> bool {
    let fetchable = m.owned.fetchable();

    let in_flight = (held.iter())
        .filter(|r| !matches!(r.callback(), Callback::Lost { .. }))
        .count();

    let unreleased = held.iter().all(|r| match r.callback() {
        Callback::Revoked { partitions, .. } => fetchable.is_disjoint(partitions),
        Callback::Assigned { added, .. } => fetchable.is_disjoint(added),
        Callback::Lost { .. } => true,
    });

    let owned = owned_by(m.engine.current_assignment().tasks());

    in_flight <= 1 && unreleased && fetchable.is_subset(&owned)
}

/// However targets and callback completions interleave, at most one reconciliation is in
/// flight, nothing being revoked or not yet assigned is fetchable, and the member eventually
/// owns the last target.
#[quickcheck]
fn reconciliation_is_safe(steps: Vec<(Vec<u8>, u8)>) -> bool {
    let mut m = Member::new();
    m.join();
    m.respond(HeartbeatResponse::ok(1, INTERVAL).with_assignment(Assignment::default()));

    let mut held = VecDeque::new();
    let mut epoch = 1;
    let mut local_epoch = m.engine.target_assignment().local_epoch();
    let mut last = Assignment::default();

    for (raw, completions) in steps {
        epoch += 1;
        let ps = partitions(&raw);
        last = Assignment::default().active("orders", ps.iter().copied());

        m.respond(assign(epoch, &ps));
        tick(&mut m, epoch);

        if !drain(&mut m, &mut held) || !is_safe(&m, &held) {
            return false;
        }

        for i in 0..completions % 3 {
            let next = if i % 2 == 0 {
                held.pop_front()
            } else {
                held.pop_back()
            };

            if let Some(req) = next {
                req.complete(Ok(()));
            }

            tick(&mut m, epoch);

            if !drain(&mut m, &mut held) || !is_safe(&m, &held) {
                return false;
            }
        }

        let target_epoch = m.engine.target_assignment().local_epoch();
        if m.engine.member_epoch() != epoch || target_epoch < local_epoch {
            return false;
        }
        local_epoch = target_epoch;
    }

    for _ in 0..16 {
        while let Some(req) = held.pop_front() {
            req.complete(Ok(()));
        }

        m.advance(INTERVAL);
        tick(&mut m, epoch);

        if !drain(&mut m, &mut held) || !is_safe(&m, &held) {
            return false;
        }
    }

    m.engine.state() == MemberState::Stable
        && m.engine.current_assignment().tasks().active_tasks() == last.active_tasks()
        && m.owned.fetchable() == owned_by(&last)
}

/// A member that keeps being told the same thing reconciles at most once.
#[quickcheck]
fn repeated_targets_reconcile_once(raw: Vec<u8>, repeats: u8) -> bool {
    let mut m = Member::new();
    m.join();

    let ps = partitions(&raw);
    m.respond(assign(1, &ps));
    m.poll();
    let first = m.run_callbacks();
    m.heartbeat();

    let local_epoch = m.engine.current_assignment().local_epoch();

    for _ in 0..repeats % 8 {
        m.advance(INTERVAL);
        m.respond(assign(1, &ps));
        m.poll();

        if !m.run_callbacks().is_empty() {
            return false;
        }
    }

    first.len() == 1
        && m.engine.state() == MemberState::Stable
        && m.engine.current_assignment().local_epoch() == local_epoch
}
