// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! A tokio driver for an [Engine].
//!
//! The [Driver] owns the engine and is its only mutator. It polls the engine whenever a
//! heartbeat outcome arrives, a callback completes, the application sends a command through
//! a [MemberHandle], or the engine's requested poll delay elapses. Heartbeats are sent
//! through a [Transport], concurrently with the loop.
use super::{
    coordinator::Coordinator,
    error::{Closed, TransportError},
    heartbeat::{
        proto::{HeartbeatRequest, HeartbeatResponse},
        protocol::GroupProtocol,
        Engine, PollResult,
    },
    membership::{Assignment, LeaveGroup, MemberState},
};
use futures::{
    future::{pending, BoxFuture, FutureExt},
    stream::{FuturesUnordered, StreamExt},
};
use log::{debug, info, warn};
use std::{future::Future, sync::Arc};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch, Notify},
    time::{sleep, Instant},
};
use tracing::{info_span, Instrument};

/// Delivers heartbeats to the group coordinator.
#[crate::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` to `coordinator`, and resolve with its response.
    async fn send(
        &self,
        coordinator: &Coordinator,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, TransportError>;
}

/// A snapshot of the member, as published by a [Driver].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    /// The member state.
    pub state: MemberState,
    /// The member epoch.
    pub member_epoch: i32,
    /// The tasks whose callbacks have completed.
    pub assignment: Assignment,
}

enum Command {
    Poll,
    Subscribe,
    Leave(oneshot::Sender<LeaveGroup>),
}

/// The application's handle to a running [Driver]. Cloning this is cheap.
#[derive(Clone)]
pub struct MemberHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<Status>,
}

impl MemberHandle {
    /// Record an application poll. This must be called at least once per maximum poll
    /// interval, or the member leaves the group.
    pub fn poll(&self) -> Result<(), Closed> {
        self.commands.send(Command::Poll).map_err(|_| Closed)
    }

    /// Record a subscription change. The member joins (or sends its new subscription) after
    /// the next [poll](MemberHandle::poll).
    pub fn subscribe(&self) -> Result<(), Closed> {
        self.commands.send(Command::Subscribe).map_err(|_| Closed)
    }

    /// Leave the group, revoking owned tasks first. Resolves once the member has left.
    pub async fn leave(&self) -> Result<(), Closed> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::Leave(tx)).map_err(|_| Closed)?;

        let leave = rx.await.map_err(|_| Closed)?;
        leave.await
    }

    /// Returns the most recently published status.
    pub fn status(&self) -> Status {
        self.status.borrow().clone()
    }

    /// Resolves with the first published status that satisfies `pred`.
    pub async fn wait_for<F>(&self, pred: F) -> Result<Status, Closed>
    where F: Fn(&Status) -> bool {
        let mut rx = self.status.clone();

        loop {
            {
                let status = rx.borrow();
                if pred(&*status) {
                    return Ok((*status).clone());
                }
            }

            rx.changed().await.map_err(|_| Closed)?;
        }
    }
}

type InFlight = BoxFuture<'static, (bool, Result<HeartbeatResponse, TransportError>)>;

/// Drives an [Engine] on a tokio runtime.
pub struct Driver<P, T> {
    engine: Engine<P>,
    transport: Arc<T>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<Status>,
    completions: Arc<Notify>,
}

impl<P: GroupProtocol + 'static, T: Transport> Driver<P, T> {
    /// Create a driver for `engine`, along with a handle to it.
    pub fn new(engine: Engine<P>, transport: T) -> (Self, MemberHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(status_of(&engine));
        let completions = engine.completions();

        let driver = Self {
            engine,
            transport: Arc::new(transport),
            commands,
            status: status_tx,
            completions,
        };

        let handle = MemberHandle {
            commands: commands_tx,
            status,
        };

        (driver, handle)
    }

    /// Drive the engine until every [MemberHandle] is dropped, then leave the group.
    pub async fn run(self) -> Result<(), Closed> {
        self.run_with_shutdown(pending()).await
    }

    /// Drive the engine until `signal` resolves (or every [MemberHandle] is dropped), then
    /// leave the group without running callbacks.
    ///
    /// Resolves once the member has left.
    pub async fn run_with_shutdown<F>(self, signal: F) -> Result<(), Closed>
    where F: Future<Output = ()> + Send {
        let span = info_span!(
            "member",
            group_id = %self.engine.identity().group_id(),
            member_id = %self.engine.member_id(),
        );

        self.drive(signal).instrument(span).await
    }

    async fn drive<F>(mut self, signal: F) -> Result<(), Closed>
    where F: Future<Output = ()> + Send {
        tokio::pin!(signal);

        let mut in_flight: FuturesUnordered<InFlight> = FuturesUnordered::new();
        let mut closing: Option<LeaveGroup> = None;
        let mut handles_gone = false;

        loop {
            let PollResult { outbound, next_poll } = self.engine.poll(now());

            if let Some(o) = outbound {
                let transport = Arc::clone(&self.transport);
                let ignore = o.ignore_response;

                in_flight.push(
                    async move { (ignore, transport.send(&o.coordinator, o.request).await) }
                        .boxed(),
                );
            }

            self.publish_status();

            if let Some(leave) = closing.as_mut() {
                if let Some(r) = leave.try_complete() {
                    info!("left group; driver exiting");
                    return r;
                }
            }

            select! {
                _ = &mut signal, if closing.is_none() => {
                    info!("shutdown requested; leaving group");
                    closing = Some(self.engine.leave_group_on_close());
                }

                Some((ignore, r)) = in_flight.next() => {
                    if ignore {
                        debug!("ignoring outcome of heartbeat: {:?}", r);
                        continue;
                    }

                    match r {
                        Ok(rsp) => self.engine.on_heartbeat_success(rsp, now()),
                        Err(e) => self.engine.on_heartbeat_failure(e, now()),
                    }
                }

                cmd = self.commands.recv(), if !handles_gone => match cmd {
                    Some(Command::Poll) => self.engine.on_application_poll(now()),
                    Some(Command::Subscribe) => self.engine.subscribe(),
                    Some(Command::Leave(tx)) => {
                        let _ = tx.send(self.engine.leave_group());
                    }
                    None => {
                        handles_gone = true;
                        if closing.is_none() {
                            warn!("every member handle was dropped; leaving group");
                            closing = Some(self.engine.leave_group_on_close());
                        }
                    }
                },

                _ = self.completions.notified() => {}

                _ = sleep(next_poll) => {}
            }
        }
    }

    fn publish_status(&self) {
        let next = status_of(&self.engine);

        if *self.status.borrow() != next {
            let _ = self.status.send(next);
        }
    }
}

fn status_of<P: GroupProtocol>(engine: &Engine<P>) -> Status {
    Status {
        state: engine.state(),
        member_epoch: engine.member_epoch(),
        assignment: engine.current_assignment().tasks().clone(),
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
