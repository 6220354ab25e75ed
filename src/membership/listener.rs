// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
use crate::ownership::TopicPartition;
use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};

/// Receives notifications about membership changes, e.g. so a fetch layer can stop using a
/// stale epoch.
///
/// Listeners are held weakly; dropping the last [Arc] unregisters it.
pub trait MemberStateListener: Send + Sync {
    /// The member epoch changed. `epoch` is `None` while the member has no valid epoch
    /// (joining, leaving, or failed).
    fn on_member_epoch_updated(&self, epoch: Option<i32>, member_id: &str);

    /// The set of owned partitions changed.
    fn on_group_assignment_updated(&self, _partitions: &BTreeSet<TopicPartition>) {}
}

#[derive(Default)]
pub(crate) struct Listeners {
    inner: Vec<Weak<dyn MemberStateListener>>,
}

impl Listeners {
    pub(crate) fn register(&mut self, l: &Arc<dyn MemberStateListener>) {
        self.inner.push(Arc::downgrade(l));
    }

    pub(crate) fn epoch_updated(&mut self, epoch: Option<i32>, member_id: &str) {
        self.each(|l| l.on_member_epoch_updated(epoch, member_id));
    }

    pub(crate) fn assignment_updated(&mut self, partitions: &BTreeSet<TopicPartition>) {
        self.each(|l| l.on_group_assignment_updated(partitions));
    }

    fn each<F: FnMut(&dyn MemberStateListener)>(&mut self, mut f: F) {
        self.inner.retain(|w| match w.upgrade() {
            Some(l) => {
                f(&*l);
                true
            }
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Epochs(Mutex<Vec<Option<i32>>>);

    impl MemberStateListener for Epochs {
        fn on_member_epoch_updated(&self, epoch: Option<i32>, _: &str) {
            self.0.lock().push(epoch);
        }
    }

    #[test]
    fn dropped_listeners_are_pruned() {
        let mut ls = Listeners::default();

        let kept = Arc::new(Epochs::default());
        let gone: Arc<dyn MemberStateListener> = Arc::new(Epochs::default());

        ls.register(&(Arc::clone(&kept) as Arc<dyn MemberStateListener>));
        ls.register(&gone);
        drop(gone);

        ls.epoch_updated(Some(3), "m");
        ls.epoch_updated(None, "m");

        assert_eq!(1, ls.inner.len());
        assert_eq!(vec![Some(3), None], *kept.0.lock());
    }
}
