//! Protocol client abstraction
//!
//! Two variants implement one capability interface consumed by the scenario
//! drivers: the stateless variant resends the entire accumulated context
//! every turn and approximates push by polling; the stateful variant holds
//! a server-side session, sends only deltas, and receives true push events.
//! The drivers never branch on the concrete type, so adding a third variant
//! is additive.

pub(crate) mod wire;
pub mod stateless;
pub mod session;

pub use stateless::StatelessClient;
pub use session::SessionClient;
pub use wire::REQUEST_FRAMING_BYTES;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BenchError, Result};
use crate::metrics::{CallKind, Recorder};
use crate::netsim::ImpairedLink;
use crate::Protocol;

/// Handle to a long-running task started through a client.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub(crate) task_id: Uuid,
    pub(crate) started: Instant,
    // Start-call bytes, folded into the completion sample when the start
    // itself is not separately sampled.
    pub(crate) start_bytes_sent: u64,
    pub(crate) start_bytes_received: u64,
}

impl TaskHandle {
    /// Server-assigned task identifier.
    pub fn task_id(&self) -> Uuid {
        self.task_id
    }
}

/// Status reported by a task poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task still in progress
    Running {
        /// Percent complete, 0-99
        progress: u8,
    },
    /// Task reached its terminal status
    Completed,
}

/// Lazy, unbounded sequence of subscription events.
///
/// Cancelled explicitly or by drop; the poll-approximation variant stops
/// its background loop, the push variant releases the session's channel.
pub struct EventStream {
    backend: StreamBackend,
}

enum StreamBackend {
    /// True push from the session's event channel. Each delivery charges
    /// the receive leg and records a sample; no client-initiated call.
    Push {
        events: UnboundedReceiver<Bytes>,
        link: ImpairedLink,
        recorder: Recorder,
    },
    /// Poll-approximation: a background loop records every poll and
    /// forwards only fresh values.
    Poll {
        events: UnboundedReceiver<Bytes>,
        task: JoinHandle<()>,
    },
}

impl EventStream {
    pub(crate) fn push(events: UnboundedReceiver<Bytes>, link: ImpairedLink, recorder: Recorder) -> Self {
        Self { backend: StreamBackend::Push { events, link, recorder } }
    }

    pub(crate) fn polled(events: UnboundedReceiver<Bytes>, task: JoinHandle<()>) -> Self {
        Self { backend: StreamBackend::Poll { events, task } }
    }

    /// Next delivered event, or None once the stream ends.
    pub async fn next(&mut self) -> Option<Bytes> {
        match &mut self.backend {
            StreamBackend::Push { events, link, recorder } => {
                let payload = events.recv().await?;
                let arrived = Instant::now();
                link.charge_push(payload.len() as u64).await;
                recorder.record_event(CallKind::TickerEvent, arrived, payload.len() as u64);
                Some(payload)
            }
            StreamBackend::Poll { events, .. } => events.recv().await,
        }
    }

    /// Stop delivery immediately for either variant: the push channel is
    /// closed and its buffer discarded (the server's push loop bails on its
    /// next send), the poll loop is aborted.
    pub fn cancel(&mut self) {
        match &mut self.backend {
            StreamBackend::Push { events, .. } => {
                events.close();
                while events.try_recv().is_ok() {}
            }
            StreamBackend::Poll { events, task } => {
                task.abort();
                events.close();
                while events.try_recv().is_ok() {}
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Capability interface consumed by the scenario drivers.
#[async_trait]
pub trait ProtocolClient: Send {
    /// Which protocol variant this client speaks.
    fn protocol(&self) -> Protocol;

    /// Send one conversational turn. A degraded (loss-exhausted) turn
    /// records a failed sample and still returns Ok.
    async fn send_turn(&mut self, message: &str) -> Result<()>;

    /// Start the long-running task on the server.
    async fn start_long_task(&mut self, duration: Duration) -> Result<TaskHandle>;

    /// Issue one status poll and record its sample.
    async fn check_status(&mut self, task: &TaskHandle) -> Result<TaskStatus>;

    /// Block until the task reaches its terminal status, polling at
    /// `poll_interval` or awaiting the push notification per variant,
    /// bounded by `ceiling` from the task's start.
    async fn wait_for_completion(
        &mut self,
        task: &TaskHandle,
        poll_interval: Duration,
        ceiling: Duration,
    ) -> Result<()>;

    /// Subscribe to `topic`, receiving events until cancelled.
    async fn subscribe(&mut self, topic: &str) -> Result<EventStream>;

    /// Invoke a named tool. None means the call degraded after retry
    /// exhaustion and produced no output.
    async fn call_tool(&mut self, name: &str, input: &str) -> Result<Option<String>>;

    /// Release any server-side state held on this client's behalf.
    async fn close(&mut self);
}

/// Record the failed sample for a call that errored before any attempt
/// could be charged, then hand the error back.
pub(crate) fn record_error(recorder: &Recorder, kind: CallKind, err: BenchError) -> BenchError {
    let now = Instant::now();
    let started = match &err {
        // The ceiling elapsed in full before the call was abandoned.
        BenchError::Timeout { ceiling } => now.checked_sub(*ceiling).unwrap_or(now),
        _ => now,
    };
    recorder.record_span(kind, started, now, 0, 0, false, 0);
    err
}
