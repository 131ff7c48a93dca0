//! The seam between the update logic and the event loop.
//!
//! Core components never touch tokio directly: they read the clock, arm
//! one-shot timers, spawn and signal plugins through [`Reactor`], and learn
//! about outcomes through [`Event`]s delivered back on the loop.

use crate::control::ControlMessage;
use crate::coordinator::Query;
use crate::process::{self, ExitOutcome, ProcessError, SpawnRequest};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::debug;

pub type TimerId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// The scheduler's shared deadline.
    Deadline,
    RetryInit(String),
    RestartMaintainer(String),
}

#[derive(Debug)]
pub enum Event {
    /// The child was waited on. Its pid may be reused from here on, but the
    /// run only ends with the matching `ChildExited`.
    ChildReaped {
        site: String,
        pid: u32,
    },
    ChildExited {
        site: String,
        pid: u32,
        outcome: ExitOutcome,
    },
    /// A control-socket peer connected; reply with the site it belongs to,
    /// or `None` to reject it.
    PeerConnected {
        pid: u32,
        reply: oneshot::Sender<Option<String>>,
    },
    Control {
        pid: u32,
        message: ControlMessage,
    },
    Timer {
        id: TimerId,
        kind: TimerKind,
    },
    Query(Query),
    Shutdown,
}

pub trait Reactor {
    /// Local wall-clock time.
    fn now(&self) -> NaiveDateTime;

    /// Deliver `Event::Timer` once after `delay`.
    fn arm_timer(&mut self, delay: Duration, kind: TimerKind) -> TimerId;

    fn cancel_timer(&mut self, id: TimerId);

    /// Start a plugin. Its exit is reported later as `Event::ChildReaped`
    /// followed by `Event::ChildExited`.
    fn spawn(&mut self, request: SpawnRequest) -> Result<u32, ProcessError>;

    fn terminate(&mut self, pid: u32);

    fn force_kill(&mut self, pid: u32);
}

// ---------------------------------------------------------------------------
// TokioReactor
// ---------------------------------------------------------------------------

pub struct TokioReactor {
    events: mpsc::UnboundedSender<Event>,
    timers: HashMap<TimerId, AbortHandle>,
    next_timer: TimerId,
}

impl TokioReactor {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            timers: HashMap::new(),
            next_timer: 1,
        }
    }
}

impl Reactor for TokioReactor {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }

    fn arm_timer(&mut self, delay: Duration, kind: TimerKind) -> TimerId {
        self.timers.retain(|_, handle| !handle.is_finished());

        let id = self.next_timer;
        self.next_timer += 1;
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Timer { id, kind });
        });
        self.timers.insert(id, task.abort_handle());
        id
    }

    fn cancel_timer(&mut self, id: TimerId) {
        if let Some(handle) = self.timers.remove(&id) {
            handle.abort();
        }
    }

    fn spawn(&mut self, request: SpawnRequest) -> Result<u32, ProcessError> {
        process::spawn_plugin(request, self.events.clone())
    }

    fn terminate(&mut self, pid: u32) {
        if let Err(e) = process::terminate(pid) {
            debug!(pid, error = %e, "terminate failed");
        }
    }

    fn force_kill(&mut self, pid: u32) {
        if let Err(e) = process::force_kill(pid) {
            debug!(pid, error = %e, "kill failed");
        }
    }
}

impl Drop for TokioReactor {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// FakeReactor
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) use fake::FakeReactor;


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tokio_timer_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reactor = TokioReactor::new(tx);
        let id = reactor.arm_timer(Duration::from_millis(10), TimerKind::Deadline);
        match rx.recv().await.unwrap() {
            Event::Timer { id: fired, kind } => {
                assert_eq!(fired, id);
                assert_eq!(kind, TimerKind::Deadline);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tokio_timer_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reactor = TokioReactor::new(tx);
        let cancelled = reactor.arm_timer(Duration::from_millis(20), TimerKind::Deadline);
        let kept = reactor.arm_timer(
            Duration::from_millis(40),
            TimerKind::RetryInit("a".to_string()),
        );
        reactor.cancel_timer(cancelled);
        match rx.recv().await.unwrap() {
            Event::Timer { id, .. } => assert_eq!(id, kept),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_fake_pop_due_orders_by_time() {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let mut fake = FakeReactor::new(start);
        let late = fake.arm_timer(Duration::from_secs(120), TimerKind::Deadline);
        let early = fake.arm_timer(Duration::from_secs(60), TimerKind::RetryInit("x".into()));

        let until = start + chrono::TimeDelta::minutes(5);
        assert_eq!(fake.pop_due(until).map(|(id, _)| id), Some(early));
        assert_eq!(fake.now, start + chrono::TimeDelta::minutes(1));
        assert_eq!(fake.pop_due(until).map(|(id, _)| id), Some(late));
        assert!(fake.pop_due(until).is_none());
    }
}
