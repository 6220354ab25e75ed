// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use std::fmt;

/// The lifecycle state of a group member.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Not part of the group, and not trying to join it.
    Unsubscribed,
    /// Sending heartbeats at the join epoch, waiting to be admitted.
    Joining,
    /// Owns exactly what the coordinator intends.
    Stable,
    /// Converging the current assignment towards the target.
    Reconciling,
    /// Reconciliation finished; the next heartbeat acknowledges it.
    Acknowledging,
    /// Releasing the assignment before sending a leave heartbeat.
    PrepareLeaving,
    /// The leave heartbeat is about to be sent.
    Leaving,
    /// The coordinator rejected our epoch; releasing everything before rejoining.
    Fenced,
    /// Left the group because the application stopped polling.
    Stale,
    /// An unrecoverable error occurred. Terminal.
    Fatal,
}

use MemberState::*;

impl MemberState {
    /// Returns the states this state may be entered from.
    pub fn previous_states(&self) -> &'static [MemberState] {
        match self {
            Unsubscribed => &[PrepareLeaving, Leaving, Fenced, Stale],
            Joining => &[Fenced, Unsubscribed, Stale],
            Reconciling => &[Stable, Joining, Acknowledging, Reconciling],
            Acknowledging => &[Reconciling],
            Stable => &[Joining, Acknowledging, Reconciling],
            Fenced => &[Joining, Stable, Reconciling, Acknowledging],
            PrepareLeaving => &[Joining, Stable, Reconciling, Acknowledging, Unsubscribed],
            Leaving => &[PrepareLeaving],
            Stale => &[Leaving],
            Fatal => &[
                Unsubscribed,
                Joining,
                Stable,
                Reconciling,
                Acknowledging,
                PrepareLeaving,
                Leaving,
                Fenced,
                Stale,
            ],
        }
    }

    /// Returns true if this state may be entered from `prev`.
    pub fn can_transition_from(&self, prev: MemberState) -> bool {
        self.previous_states().contains(&prev)
    }

    /// Returns true if the member is not part of the group in this state.
    pub fn is_not_in_group(&self) -> bool {
        matches!(self, Unsubscribed | Fenced | Fatal | Stale)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Unsubscribed => "UNSUBSCRIBED",
            Joining => "JOINING",
            Stable => "STABLE",
            Reconciling => "RECONCILING",
            Acknowledging => "ACKNOWLEDGING",
            PrepareLeaving => "PREPARE_LEAVING",
            Leaving => "LEAVING",
            Fenced => "FENCED",
            Stale => "STALE",
            Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [MemberState; 10] = [
        Unsubscribed,
        Joining,
        Stable,
        Reconciling,
        Acknowledging,
        PrepareLeaving,
        Leaving,
        Fenced,
        Stale,
        Fatal,
    ];

    #[test]
    fn fatal_is_terminal() {
        for s in ALL.iter() {
            assert!(!s.can_transition_from(Fatal), "{} from FATAL", s);
            assert_eq!(*s != Fatal, Fatal.can_transition_from(*s));
        }
    }

    #[test]
    fn leaving_only_after_prepare() {
        for s in ALL.iter() {
            assert_eq!(*s == PrepareLeaving, Leaving.can_transition_from(*s));
        }
    }

    #[test]
    fn every_state_is_reachable() {
        for s in ALL.iter() {
            assert!(!s.previous_states().is_empty(), "{} is unreachable", s);
        }
    }
}
