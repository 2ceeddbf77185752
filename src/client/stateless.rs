//! Stateless request/response client
//!
//! Every turn resends the entire accumulated history, so request size
//! grows linearly with turn count. There is no push channel: task
//! completion and subscriptions are observed by fixed-interval polling,
//! and every empty poll is measurable overhead.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::client::{self, wire, EventStream, ProtocolClient, TaskHandle, TaskStatus};
use crate::error::{BenchError, Result};
use crate::metrics::{CallKind, Recorder};
use crate::netsim::ImpairedLink;
use crate::server::{ModelServer, TurnMessage};
use crate::Protocol;

/// Client speaking the stateless full-context protocol.
pub struct StatelessClient {
    server: Arc<ModelServer>,
    link: ImpairedLink,
    recorder: Recorder,
    history: Vec<TurnMessage>,
    poll_interval: Duration,
}

impl StatelessClient {
    /// Build a client; no handshake is needed, every call stands alone.
    pub fn new(
        server: Arc<ModelServer>,
        link: ImpairedLink,
        recorder: Recorder,
        poll_interval: Duration,
    ) -> Self {
        Self {
            server,
            link,
            recorder,
            history: Vec::new(),
            poll_interval,
        }
    }

    /// Accumulated client-side history, resent in full on every turn.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[async_trait]
impl ProtocolClient for StatelessClient {
    fn protocol(&self) -> Protocol {
        Protocol::Rest
    }

    async fn send_turn(&mut self, message: &str) -> Result<()> {
        let body = wire::chat_body(&self.history, message);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let history = self.history.clone();
        let message_owned = message.to_string();
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                let history = history.clone();
                let message = message_owned.clone();
                async move { server.chat(&history, &message).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::Turn, err)),
        };

        self.recorder.record_call(CallKind::Turn, &outcome);
        self.history.push(TurnMessage::user(message));
        if outcome.delivered {
            if let Some(reply) = wire::str_field(&outcome.response, "response") {
                self.history.push(TurnMessage::assistant(reply));
            }
        }
        Ok(())
    }

    async fn start_long_task(&mut self, duration: Duration) -> Result<TaskHandle> {
        let body = wire::start_task_body(duration.as_millis() as u64);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                async move { server.start_task(duration).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::TaskStart, err)),
        };

        if !outcome.delivered {
            // Without a task id there is nothing to poll; end this agent's
            // scenario rather than retrying above the shim.
            self.recorder.record_call(CallKind::TaskStart, &outcome);
            return Err(BenchError::RetriesExhausted {
                attempts: outcome.attempts.len() as u32,
            });
        }

        let task_id = wire::str_field(&outcome.response, "task_id")
            .and_then(|id| id.parse::<Uuid>().ok())
            .ok_or_else(|| BenchError::Connection {
                endpoint: "tasks".into(),
                reason: "malformed task id".into(),
            })?;

        // The start call is not separately sampled; its timing and bytes
        // belong to the completion sample spanning the whole task.
        Ok(TaskHandle {
            task_id,
            started: outcome.started,
            start_bytes_sent: outcome.bytes_sent(),
            start_bytes_received: outcome.bytes_received(),
        })
    }

    async fn check_status(&mut self, task: &TaskHandle) -> Result<TaskStatus> {
        let server = self.server.clone();
        let task_id = task.task_id;
        let result = self
            .link
            .call(wire::REQUEST_FRAMING_BYTES, move || {
                let server = server.clone();
                async move { server.task_status(task_id).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                return Err(client::record_error(
                    &self.recorder,
                    CallKind::TaskPoll { done: false },
                    err,
                ))
            }
        };

        if !outcome.delivered {
            self.recorder.record_call(CallKind::TaskPoll { done: false }, &outcome);
            return Ok(TaskStatus::Running { progress: 0 });
        }

        let done = wire::str_field(&outcome.response, "status").as_deref() == Some("completed");
        let progress = wire::u64_field(&outcome.response, "progress").unwrap_or(0) as u8;
        self.recorder.record_call(CallKind::TaskPoll { done }, &outcome);
        if done {
            Ok(TaskStatus::Completed)
        } else {
            Ok(TaskStatus::Running { progress })
        }
    }

    async fn wait_for_completion(
        &mut self,
        task: &TaskHandle,
        poll_interval: Duration,
        ceiling: Duration,
    ) -> Result<()> {
        let deadline = task.started + ceiling;
        loop {
            tokio::time::sleep(poll_interval).await;
            if Instant::now() >= deadline {
                self.recorder.record_failure(CallKind::TaskComplete, task.started);
                return Err(BenchError::Timeout { ceiling });
            }
            let status = self.check_status(task).await?;
            if status == TaskStatus::Completed {
                self.recorder.record_span(
                    CallKind::TaskComplete,
                    task.started,
                    Instant::now(),
                    task.start_bytes_sent,
                    task.start_bytes_received,
                    true,
                    0,
                );
                return Ok(());
            }
        }
    }

    async fn subscribe(&mut self, _topic: &str) -> Result<EventStream> {
        // No push mechanism: approximate the subscription with a background
        // fixed-interval poll of the latest-value endpoint.
        let (tx, rx) = mpsc::unbounded_channel();
        let server = self.server.clone();
        let link = self.link.clone();
        let recorder = self.recorder.clone();
        let interval = self.poll_interval;

        let task = tokio::spawn(async move {
            let mut last_version: Option<u64> = None;
            loop {
                tokio::time::sleep(interval).await;
                let server_for_call = server.clone();
                let result = link
                    .call(wire::REQUEST_FRAMING_BYTES, move || {
                        let server = server_for_call.clone();
                        async move { server.ticker_value().await }
                    })
                    .await;

                let outcome = match result {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        debug!(%err, "ticker poll loop stopping");
                        break;
                    }
                };
                if !outcome.delivered {
                    recorder.record_call(CallKind::TickerPoll { fresh: false }, &outcome);
                    continue;
                }

                let version = wire::u64_field(&outcome.response, "version");
                let fresh = match (version, last_version) {
                    (Some(seen), Some(last)) => seen > last,
                    (Some(_), None) => true,
                    (None, _) => false,
                };
                recorder.record_call(CallKind::TickerPoll { fresh }, &outcome);
                if fresh {
                    last_version = version;
                    if tx.send(outcome.response.clone()).is_err() {
                        break;
                    }
                }
            }
        });

        Ok(EventStream::polled(rx, task))
    }

    async fn call_tool(&mut self, name: &str, input: &str) -> Result<Option<String>> {
        let body = wire::tool_body(name, input);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let name_owned = name.to_string();
        let input_owned = input.to_string();
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                let name = name_owned.clone();
                let input = input_owned.clone();
                async move { server.call_tool(&name, &input).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::Tool, err)),
        };

        self.recorder.record_call(CallKind::Tool, &outcome);
        if !outcome.delivered {
            return Ok(None);
        }
        Ok(wire::str_field(&outcome.response, "output"))
    }

    async fn close(&mut self) {
        // Nothing held server-side; every call stood alone.
        self.history.clear();
    }
}
