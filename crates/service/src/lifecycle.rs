//! Process-wide connect/disconnect state.
//!
//! Concurrent callers of `start` or `stop` all await the same in-flight
//! operation instead of each issuing their own.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;

/// Which backends are reachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub metrics: bool,
    pub sessions: bool,
    pub models: bool,
}

impl ConnectionStatus {
    pub fn all(&self) -> bool {
        self.metrics && self.sessions && self.models
    }
}

type SharedOp = Shared<BoxFuture<'static, ConnectionStatus>>;

enum Phase {
    Idle,
    Starting(SharedOp),
    Running(ConnectionStatus),
    Stopping(SharedOp),
}

enum Step {
    Done(ConnectionStatus),
    Await(SharedOp),
    AwaitOther(SharedOp),
}

pub struct Lifecycle {
    phase: Mutex<Phase>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Status once running, `None` otherwise.
    pub fn status(&self) -> Option<ConnectionStatus> {
        match &*self.phase.lock() {
            Phase::Running(status) => Some(*status),
            _ => None,
        }
    }

    /// Runs `connect` unless a start is already running or done.
    pub async fn start<F>(&self, connect: F) -> ConnectionStatus
    where
        F: FnOnce() -> BoxFuture<'static, ConnectionStatus>,
    {
        let mut connect = Some(connect);
        loop {
            let step = {
                let mut phase = self.phase.lock();
                match &*phase {
                    Phase::Running(status) => Step::Done(*status),
                    Phase::Starting(op) => Step::Await(op.clone()),
                    Phase::Stopping(op) => Step::AwaitOther(op.clone()),
                    Phase::Idle => match connect.take() {
                        Some(connect) => {
                            let op = connect().shared();
                            *phase = Phase::Starting(op.clone());
                            Step::Await(op)
                        }
                        None => Step::Done(ConnectionStatus::default()),
                    },
                }
            };

            match step {
                Step::Done(status) => return status,
                Step::AwaitOther(op) => {
                    op.await;
                    // A stop whose caller went away never resets the phase.
                    let mut phase = self.phase.lock();
                    if matches!(*phase, Phase::Stopping(_)) {
                        *phase = Phase::Idle;
                    }
                }
                Step::Await(op) => {
                    let status = op.await;
                    let mut phase = self.phase.lock();
                    if matches!(*phase, Phase::Starting(_)) {
                        *phase = Phase::Running(status);
                    }
                    return status;
                }
            }
        }
    }

    /// Runs `disconnect` if started; waits for an in-flight start first.
    pub async fn stop<F>(&self, disconnect: F)
    where
        F: FnOnce() -> BoxFuture<'static, ConnectionStatus>,
    {
        let mut disconnect = Some(disconnect);
        loop {
            let step = {
                let mut phase = self.phase.lock();
                match &*phase {
                    Phase::Idle => return,
                    Phase::Starting(op) => Step::AwaitOther(op.clone()),
                    Phase::Stopping(op) => Step::Await(op.clone()),
                    Phase::Running(_) => match disconnect.take() {
                        Some(disconnect) => {
                            let op = disconnect().shared();
                            *phase = Phase::Stopping(op.clone());
                            Step::Await(op)
                        }
                        None => return,
                    },
                }
            };

            match step {
                Step::Done(_) => return,
                Step::AwaitOther(op) => {
                    let status = op.await;
                    let mut phase = self.phase.lock();
                    if matches!(*phase, Phase::Starting(_)) {
                        *phase = Phase::Running(status);
                    }
                }
                Step::Await(op) => {
                    op.await;
                    let mut phase = self.phase.lock();
                    if matches!(*phase, Phase::Stopping(_)) {
                        *phase = Phase::Idle;
                    }
                    return;
                }
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
