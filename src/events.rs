// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The bridge between the engine and the application.
//!
//! Callbacks never run on the engine's thread. Instead, the engine sends a [CallbackRequest]
//! over the event channel and keeps going; the application executes the callback wherever
//! it likes and [completes](CallbackRequest::complete) the request. The engine observes the
//! completion on a later poll.
//!
//! ```
//! # use tether::events::{self, Event};
//! # async fn run(mut rx: events::EventReceiver) {
//! while let Ok(event) = rx.recv().await {
//!     match event {
//!         Event::Callback(req) => {
//!             println!("running {:?}", req.callback());
//!             req.complete(Ok(()));
//!         }
//!         Event::Error(e) => eprintln!("group error: {}", e),
//!     }
//! }
//! # }
//! ```
use super::{
    error::{CallbackError, Closed, GroupError},
    membership::{Assignment, TaskId},
    ownership::TopicPartition,
};
use futures::stream::{unfold, Stream};
use std::{collections::BTreeSet, sync::Arc};
use tokio::sync::{
    mpsc,
    oneshot::{self, error::TryRecvError},
    Notify,
};

type Completion = Result<(), CallbackError>;

/// Create a linked pair of event sender and receiver.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let notify = Arc::new(Notify::new());

    (EventSender { tx, notify }, EventReceiver { rx })
}

/// Something the application must act on.
#[derive(Debug)]
pub enum Event {
    /// A callback that must be executed and completed.
    Callback(CallbackRequest),
    /// An error the engine could not recover from internally.
    Error(GroupError),
}

/// The callbacks an application may be asked to run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Callback {
    /// Stop processing `tasks`, and commit any progress made on `partitions`.
    Revoked {
        /// The active tasks being revoked.
        tasks: BTreeSet<TaskId>,
        /// The partitions read by those tasks.
        partitions: BTreeSet<TopicPartition>,
    },

    /// Start processing `assignment`. Partitions in `added` were not owned before.
    Assigned {
        /// The complete assignment, including standby and warmup tasks.
        assignment: Assignment,
        /// Partitions newly owned by this member.
        added: BTreeSet<TopicPartition>,
    },

    /// Ownership of `partitions` has been lost; progress on them must not be committed.
    Lost {
        /// The partitions that were owned.
        partitions: BTreeSet<TopicPartition>,
    },
}

impl Callback {
    /// Returns a short name for this callback.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Revoked { .. } => "revoke",
            Self::Assigned { .. } => "assign",
            Self::Lost { .. } => "lost",
        }
    }
}

/// A request to run a callback.
///
/// Dropping a request without completing it reports [CallbackError::Abandoned] to the
/// engine.
#[derive(Debug)]
pub struct CallbackRequest {
    callback: Callback,
    tx: Option<oneshot::Sender<Completion>>,
    notify: Arc<Notify>,
}

impl CallbackRequest {
    /// Returns the callback to run.
    pub fn callback(&self) -> &Callback {
        &self.callback
    }

    /// Report the outcome of the callback to the engine.
    pub fn complete(mut self, result: Result<(), CallbackError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(result);
        }
        self.notify.notify_one();
    }
}

impl Drop for CallbackRequest {
    fn drop(&mut self) {
        if self.tx.take().is_some() {
            self.notify.notify_one();
        }
    }
}

/// The engine's side of a [CallbackRequest].
#[derive(Debug)]
pub(crate) struct PendingCallback {
    name: &'static str,
    rx: oneshot::Receiver<Completion>,
}

impl PendingCallback {
    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the outcome of the callback, if it has finished.
    pub(crate) fn try_complete(&mut self) -> Option<Completion> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(CallbackError::Abandoned)),
        }
    }
}

/// The engine's end of the event channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
    notify: Arc<Notify>,
}

impl EventSender {
    /// Dispatch a callback request to the application.
    pub(crate) fn dispatch(&self, callback: Callback) -> PendingCallback {
        let (tx, rx) = oneshot::channel();
        let name = callback.name();

        let req = CallbackRequest {
            callback,
            tx: Some(tx),
            notify: Arc::clone(&self.notify),
        };

        // if the receiver is gone, the request is dropped here and resolves as abandoned
        let _ = self.tx.send(Event::Callback(req));

        PendingCallback { name, rx }
    }

    /// Surface an error to the application.
    pub(crate) fn error(&self, e: GroupError) {
        let _ = self.tx.send(Event::Error(e));
    }

    /// Returns the [Notify] signaled whenever a callback request is completed or dropped.
    pub fn completions(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}

/// The application's end of the event channel.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    /// Resolves when the next event is available, or the engine is dropped.
    pub async fn recv(&mut self) -> Result<Event, Closed> {
        self.rx.recv().await.ok_or(Closed)
    }

    /// Returns the next event if one is immediately available.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Convert this receiver into a [Stream] of events.
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        unfold(self, |mut r| async { Some((r.recv().await.ok()?, r)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lost() -> Callback {
        Callback::Lost {
            partitions: BTreeSet::new(),
        }
    }

    #[test]
    fn completion_is_observed() {
        let (tx, mut rx) = channel();
        let mut pending = tx.dispatch(lost());
        assert_eq!(None, pending.try_complete());

        match rx.try_recv() {
            Some(Event::Callback(req)) => {
                assert_eq!("lost", req.callback().name());
                req.complete(Err(CallbackError::failed("boom")));
            }
            e => panic!("unexpected event: {:?}", e),
        }

        assert_eq!(
            Some(Err(CallbackError::Failed("boom".into()))),
            pending.try_complete()
        );
    }

    #[test]
    fn dropped_request_is_abandoned() {
        let (tx, mut rx) = channel();
        let mut pending = tx.dispatch(lost());

        drop(rx.try_recv());
        assert_eq!(Some(Err(CallbackError::Abandoned)), pending.try_complete());
    }

    #[test]
    fn dispatch_without_receiver_is_abandoned() {
        let (tx, rx) = channel();
        drop(rx);

        let mut pending = tx.dispatch(lost());
        assert_eq!(Some(Err(CallbackError::Abandoned)), pending.try_complete());
    }

    #[tokio::test]
    async fn completion_wakes_notify() {
        let (tx, mut rx) = channel();
        let notify = tx.completions();
        let _pending = tx.dispatch(lost());

        if let Ok(Event::Callback(req)) = rx.recv().await {
            req.complete(Ok(()));
        }

        // notify_one stores a permit, so this resolves even though we weren't waiting yet
        notify.notified().await;
    }
}
