//! Stateful session client
//!
//! Holds exactly one server-side session: turns carry only the new delta,
//! long tasks complete via push notification, and subscriptions deliver
//! true push events over the session's event channel. All requests share
//! one JSON-RPC id sequence, modeling a single persistent connection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::client::{self, wire, EventStream, ProtocolClient, TaskHandle, TaskStatus};
use crate::error::{BenchError, Result};
use crate::metrics::{CallKind, Recorder};
use crate::netsim::ImpairedLink;
use crate::server::ModelServer;
use crate::Protocol;

/// Client speaking the stateful session protocol.
pub struct SessionClient {
    server: Arc<ModelServer>,
    link: ImpairedLink,
    recorder: Recorder,
    session_id: Uuid,
    events: Option<UnboundedReceiver<Bytes>>,
    next_rpc_id: u64,
    turn_count: u32,
}

impl SessionClient {
    /// Establish the session. Establishment belongs to client construction
    /// and is not part of the measured sample stream.
    pub fn connect(server: Arc<ModelServer>, link: ImpairedLink, recorder: Recorder) -> Result<Self> {
        let (session_id, events) = server.open_session()?;
        Ok(Self {
            server,
            link,
            recorder,
            session_id,
            events: Some(events),
            next_rpc_id: 0,
            turn_count: 0,
        })
    }

    /// Identifier of the server-side session this client owns.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    fn rpc_id(&mut self) -> u64 {
        self.next_rpc_id += 1;
        self.next_rpc_id
    }
}

#[async_trait]
impl ProtocolClient for SessionClient {
    fn protocol(&self) -> Protocol {
        Protocol::Mcp
    }

    async fn send_turn(&mut self, message: &str) -> Result<()> {
        let id = self.rpc_id();
        let params = json!({
            "message": message,
            "sessionId": self.session_id,
            "turnCount": self.turn_count + 1,
        });
        let body = wire::rpc_body("prompts/chat", params, id);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let session_id = self.session_id;
        let message_owned = message.to_string();
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                let message = message_owned.clone();
                async move { server.session_turn(session_id, &message).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::Turn, err)),
        };

        self.recorder.record_call(CallKind::Turn, &outcome);
        if outcome.delivered {
            self.turn_count += 1;
        }
        Ok(())
    }

    async fn start_long_task(&mut self, duration: Duration) -> Result<TaskHandle> {
        let id = self.rpc_id();
        let params = json!({
            "name": "start_task",
            "arguments": {
                "durationMs": duration.as_millis() as u64,
                "sessionId": self.session_id,
            },
        });
        let body = wire::rpc_body("tools/call", params, id);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let session_id = self.session_id;
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                async move { server.start_session_task(session_id, duration).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::TaskStart, err)),
        };

        // The start RPC is its own sample; the push completion spans the
        // task separately.
        self.recorder.record_call(CallKind::TaskStart, &outcome);
        if !outcome.delivered {
            return Err(BenchError::RetriesExhausted {
                attempts: outcome.attempts.len() as u32,
            });
        }

        let task_id = wire::str_field(&outcome.response, "task_id")
            .and_then(|id| id.parse::<Uuid>().ok())
            .ok_or_else(|| BenchError::Connection {
                endpoint: "session".into(),
                reason: "malformed task id".into(),
            })?;

        Ok(TaskHandle {
            task_id,
            started: outcome.started,
            start_bytes_sent: 0,
            start_bytes_received: 0,
        })
    }

    async fn check_status(&mut self, task: &TaskHandle) -> Result<TaskStatus> {
        let id = self.rpc_id();
        let body = wire::rpc_body("tasks/status", json!({ "taskId": task.task_id }), id);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let task_id = task.task_id;
        let result = self
            .link
            .call(request_bytes, move || {
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
        _poll_interval: Duration,
        ceiling: Duration,
    ) -> Result<()> {
        let events = self.events.as_mut().ok_or_else(|| BenchError::Connection {
            endpoint: "session".into(),
            reason: "event channel already consumed by a subscription".into(),
        })?;

        let deadline = task.started + ceiling;
        loop {
            let payload = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    self.recorder.record_failure(CallKind::TaskComplete, task.started);
                    return Err(BenchError::Connection {
                        endpoint: "session".into(),
                        reason: "event channel closed mid-task".into(),
                    });
                }
                Err(_) => {
                    self.recorder.record_failure(CallKind::TaskComplete, task.started);
                    return Err(BenchError::Timeout { ceiling });
                }
            };

            let notification: Value = match serde_json::from_slice(&payload) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if notification["method"] == "notifications/progress"
                && notification["params"]["status"] == "completed"
            {
                self.link.charge_push(payload.len() as u64).await;
                self.recorder.record_span(
                    CallKind::TaskComplete,
                    task.started,
                    Instant::now(),
                    0,
                    payload.len() as u64,
                    true,
                    0,
                );
                return Ok(());
            }
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<EventStream> {
        let id = self.rpc_id();
        let params = json!({ "uri": topic, "sessionId": self.session_id });
        let body = wire::rpc_body("resources/subscribe", params, id);
        let request_bytes = body.len() as u64 + wire::REQUEST_FRAMING_BYTES;

        let server = self.server.clone();
        let session_id = self.session_id;
        let result = self
            .link
            .call(request_bytes, move || {
                let server = server.clone();
                async move { server.subscribe_ticker(session_id).await }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return Err(client::record_error(&self.recorder, CallKind::Subscribe, err)),
        };

        self.recorder.record_call(CallKind::Subscribe, &outcome);
        if !outcome.delivered {
            return Err(BenchError::RetriesExhausted {
                attempts: outcome.attempts.len() as u32,
            });
        }

        let events = self.events.take().ok_or_else(|| BenchError::Connection {
            endpoint: "session".into(),
            reason: "event channel already consumed by a subscription".into(),
        })?;
        Ok(EventStream::push(events, self.link.clone(), self.recorder.clone()))
    }

    async fn call_tool(&mut self, name: &str, input: &str) -> Result<Option<String>> {
        let id = self.rpc_id();
        let params = json!({ "name": name, "arguments": { "input": input } });
        let body = wire::rpc_body("tools/call", params, id);
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
        self.server.close_session(self.session_id);
        self.events = None;
        debug!(session_id = %self.session_id, turns = self.turn_count, "session client closed");
    }
}
