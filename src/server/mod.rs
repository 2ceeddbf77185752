//! Modeled protocol endpoints
//!
//! In-process stand-in for the two servers the harness drives: a stateless
//! call endpoint that receives the full context on every turn, and a
//! stateful endpoint holding per-session history with an event-push
//! channel. Only the minimal operations the scenarios invoke are modeled.
//! Processing cost scales with context length the way an LLM-backed
//! endpoint would, so resend-all and resend-delta pay the same compute for
//! the same conversation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Serialize, Deserialize};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::error::{BenchError, Result};

/// Simulated processing cost per byte of conversational context.
pub const CONTEXT_DELAY_PER_BYTE: Duration = Duration::from_micros(100);

/// One message of conversational history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    /// "user" or "assistant"
    pub role: String,
    /// Message body
    pub content: String,
}

impl TurnMessage {
    /// A user-authored message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }

    /// An assistant reply.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: content.into() }
    }
}

/// Server-held state for one stateful session.
///
/// Referenced by exactly one client instance; removed when that client
/// closes or its agent's run ends.
#[derive(Debug)]
struct Session {
    turn_history: Vec<TurnMessage>,
    created_at: DateTime<Utc>,
    push: UnboundedSender<Bytes>,
}

#[derive(Debug, Clone, Copy)]
struct TaskState {
    started: Instant,
    duration: Duration,
}

/// Minimal model of the two protocol servers' operation semantics.
///
/// Task status is computed from the task's registration instant rather than
/// advanced by a background worker, which keeps poll observations
/// deterministic under paused-clock tests.
#[derive(Debug)]
pub struct ModelServer {
    started: Instant,
    ticker_interval: Duration,
    refusing: AtomicBool,
    sessions: DashMap<Uuid, Session>,
    tasks: DashMap<Uuid, TaskState>,
}

impl ModelServer {
    /// Server producing a new ticker value every `ticker_interval`.
    pub fn new(ticker_interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            ticker_interval,
            refusing: AtomicBool::new(false),
            sessions: DashMap::new(),
            tasks: DashMap::new(),
        }
    }

    /// Make every subsequent request fail with a connection error.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::Relaxed);
    }

    /// Live session count.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn check_available(&self, endpoint: &str) -> Result<()> {
        if self.refusing.load(Ordering::Relaxed) {
            return Err(BenchError::Connection {
                endpoint: endpoint.into(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    /// Stateless chat turn: the caller supplies the entire history.
    pub async fn chat(&self, history: &[TurnMessage], message: &str) -> Result<Bytes> {
        self.check_available("chat")?;
        let context_len: usize =
            history.iter().map(|m| m.content.len()).sum::<usize>() + message.len();
        tokio::time::sleep(CONTEXT_DELAY_PER_BYTE * context_len as u32).await;

        let body = json!({
            "response": format!("Echo: {message} (context: {} msgs)", history.len()),
            "usage": context_len,
        });
        Ok(Bytes::from(body.to_string()))
    }

    /// Establish a stateful session and hand back its push channel.
    pub fn open_session(&self) -> Result<(Uuid, UnboundedReceiver<Bytes>)> {
        self.check_available("session")?;
        let session_id = Uuid::new_v4();
        let (push, events) = mpsc::unbounded_channel();
        self.sessions.insert(
            session_id,
            Session {
                turn_history: Vec::new(),
                created_at: Utc::now(),
                push,
            },
        );
        debug!(%session_id, "session opened");
        Ok((session_id, events))
    }

    /// Stateful chat turn: the caller sends only the delta, the session
    /// already holds everything before it.
    pub async fn session_turn(&self, session_id: Uuid, message: &str) -> Result<Bytes> {
        self.check_available("session")?;
        let (reply, context_len, turn) = {
            let mut session = self.session_entry(session_id)?;
            let reply = format!("Echo: {message} (context: {} msgs)", session.turn_history.len());
            session.turn_history.push(TurnMessage::user(message));
            session.turn_history.push(TurnMessage::assistant(reply.clone()));
            let context_len: usize =
                session.turn_history.iter().map(|m| m.content.len()).sum();
            (reply, context_len, session.turn_history.len() / 2)
        };
        tokio::time::sleep(CONTEXT_DELAY_PER_BYTE * context_len as u32).await;

        let body = json!({ "response": reply, "turn": turn });
        Ok(Bytes::from(body.to_string()))
    }

    /// Start a long-running task observed by polling.
    pub async fn start_task(&self, duration: Duration) -> Result<Bytes> {
        self.check_available("tasks")?;
        let task_id = Uuid::new_v4();
        self.tasks.insert(task_id, TaskState { started: Instant::now(), duration });
        Ok(Bytes::from(json!({ "task_id": task_id }).to_string()))
    }

    /// Current status of a polled task.
    pub async fn task_status(&self, task_id: Uuid) -> Result<Bytes> {
        self.check_available("tasks")?;
        let task = *self.tasks.get(&task_id).ok_or_else(|| BenchError::Connection {
            endpoint: "tasks".into(),
            reason: format!("unknown task {task_id}"),
        })?;

        let elapsed = task.started.elapsed();
        let (status, progress) = if elapsed >= task.duration {
            ("completed", 100u32)
        } else {
            let pct = (elapsed.as_secs_f64() / task.duration.as_secs_f64() * 100.0) as u32;
            ("running", pct.min(99))
        };
        let body = json!({ "task_id": task_id, "status": status, "progress": progress });
        Ok(Bytes::from(body.to_string()))
    }

    /// Start a long-running task whose completion is pushed to the session.
    pub async fn start_session_task(&self, session_id: Uuid, duration: Duration) -> Result<Bytes> {
        self.check_available("session")?;
        let push = self.session_entry(session_id)?.push.clone();
        let task_id = Uuid::new_v4();
        self.tasks.insert(task_id, TaskState { started: Instant::now(), duration });

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let notification = json!({
                "method": "notifications/progress",
                "params": { "task_id": task_id, "status": "completed", "progress": 100 },
            });
            // Receiver gone means the session closed mid-task; nothing to do.
            let _ = push.send(Bytes::from(notification.to_string()));
        });

        Ok(Bytes::from(json!({ "task_id": task_id, "accepted": true }).to_string()))
    }

    /// Begin pushing ticker updates to the session until it closes.
    pub async fn subscribe_ticker(&self, session_id: Uuid) -> Result<Bytes> {
        self.check_available("session")?;
        let push = self.session_entry(session_id)?.push.clone();
        let interval = self.ticker_interval;

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let update = json!({
                    "method": "notifications/resources/updated",
                    "params": { "uri": "ticker", "delta": { "price": quote() } },
                });
                if push.send(Bytes::from(update.to_string())).is_err() {
                    break;
                }
            }
        });

        Ok(Bytes::from(json!({ "subscribed": "ticker" }).to_string()))
    }

    /// Latest ticker value for the polling approximation. The version
    /// advances once per ticker interval, so pollers can tell a fresh value
    /// from a repeat.
    pub async fn ticker_value(&self) -> Result<Bytes> {
        self.check_available("ticker")?;
        let version = if self.ticker_interval.is_zero() {
            0
        } else {
            self.started.elapsed().as_nanos() / self.ticker_interval.as_nanos()
        };
        let body = json!({ "symbol": "TCK", "price": quote(), "version": version as u64 });
        Ok(Bytes::from(body.to_string()))
    }

    /// Execute one tool of the three-step workflow.
    pub async fn call_tool(&self, name: &str, input: &str) -> Result<Bytes> {
        self.check_available("tools")?;
        let (delay, output) = match name {
            "ingest" => (Duration::from_millis(50), format!("Ingested({input})")),
            "analyze" => (Duration::from_millis(100), format!("Analyzed({input})")),
            "summarize" => (Duration::from_millis(200), format!("Summary({input})")),
            other => {
                return Err(BenchError::Connection {
                    endpoint: "tools".into(),
                    reason: format!("unknown tool {other}"),
                })
            }
        };
        tokio::time::sleep(delay).await;
        Ok(Bytes::from(json!({ "output": output, "tool": name }).to_string()))
    }

    /// Tear down a session; any push loop feeding it stops on next send.
    pub fn close_session(&self, session_id: Uuid) {
        if let Some((_, session)) = self.sessions.remove(&session_id) {
            let age_ms = (Utc::now() - session.created_at).num_milliseconds();
            debug!(%session_id, age_ms, "session closed");
        }
    }

    fn session_entry(
        &self,
        session_id: Uuid,
    ) -> Result<dashmap::mapref::one::RefMut<'_, Uuid, Session>> {
        self.sessions.get_mut(&session_id).ok_or_else(|| BenchError::Connection {
            endpoint: "session".into(),
            reason: format!("unknown session {session_id}"),
        })
    }
}

fn quote() -> f64 {
    let jitter: f64 = rand::thread_rng().gen_range(-5.0..5.0);
    ((100.0 + jitter) * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_chat_delay_scales_with_context() {
        let server = ModelServer::new(Duration::from_secs(1));
        let history = vec![
            TurnMessage::user("x".repeat(1000)),
            TurnMessage::assistant("y".repeat(1000)),
        ];

        let start = Instant::now();
        server.chat(&[], "hi").await.unwrap();
        let short = start.elapsed();

        let start = Instant::now();
        server.chat(&history, "hi").await.unwrap();
        let long = start.elapsed();

        assert!(long > short);
        assert!(long >= CONTEXT_DELAY_PER_BYTE * 2000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_status_flips_at_deadline() {
        let server = ModelServer::new(Duration::from_secs(1));
        let body = server.start_task(Duration::from_secs(5)).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let task_id: Uuid = parsed["task_id"].as_str().unwrap().parse().unwrap();

        let status = server.task_status(task_id).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&status).unwrap();
        assert_eq!(parsed["status"], "running");

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = server.task_status(task_id).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&status).unwrap();
        assert_eq!(parsed["status"], "completed");
        assert_eq!(parsed["progress"], 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_task_pushes_completion() {
        let server = ModelServer::new(Duration::from_secs(1));
        let (session_id, mut events) = server.open_session().unwrap();
        server
            .start_session_task(session_id, Duration::from_millis(500))
            .await
            .unwrap();

        let pushed = events.recv().await.expect("completion notification");
        let parsed: serde_json::Value = serde_json::from_slice(&pushed).unwrap();
        assert_eq!(parsed["params"]["status"], "completed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_push_stops_when_session_closes() {
        let server = ModelServer::new(Duration::from_millis(100));
        let (session_id, mut events) = server.open_session().unwrap();
        server.subscribe_ticker(session_id).await.unwrap();

        assert!(events.recv().await.is_some());
        server.close_session(session_id);
        drop(events);
        // The push loop notices the dropped receiver on its next send.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(server.session_count(), 0);
    }

    #[tokio::test]
    async fn test_refusing_server_rejects_everything() {
        let server = ModelServer::new(Duration::from_secs(1));
        server.set_refusing(true);
        assert!(server.open_session().is_err());
        assert!(server.chat(&[], "hi").await.is_err());
        assert!(server.ticker_value().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_version_advances_per_interval() {
        let server = ModelServer::new(Duration::from_secs(1));
        let v0: serde_json::Value =
            serde_json::from_slice(&server.ticker_value().await.unwrap()).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let v1: serde_json::Value =
            serde_json::from_slice(&server.ticker_value().await.unwrap()).unwrap();
        assert!(v1["version"].as_u64().unwrap() >= v0["version"].as_u64().unwrap() + 2);
    }
}
