//! Network impairment shim
//!
//! Wraps every outbound client call with configurable one-way delay,
//! bandwidth-based transfer time, and probabilistic loss with bounded
//! retry. All waiting happens on the tokio clock, so impaired runs are
//! fully deterministic under paused time when the loss rate is zero.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::NetworkProfile;
use crate::error::{BenchError, Result};

/// Physical transmission attempts allowed per logical call.
pub const MAX_ATTEMPTS: u32 = 3;

/// Initial retry backoff; doubles after each dropped transmission.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// One physical transmission attempt within a logical call.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// Bytes offered to the link (charged even when dropped)
    pub bytes_sent: u64,
    /// Bytes delivered back on the response leg
    pub bytes_received: u64,
    /// Time this attempt occupied the link
    pub elapsed: Duration,
    /// Whether the attempt completed the round trip
    pub delivered: bool,
}

/// Outcome of one logical call through the shim.
///
/// A degraded outcome (`delivered == false`) is a normal return: retry
/// exhaustion produces a failed sample, never an error that would abort
/// the scenario.
#[derive(Debug, Clone)]
pub struct LinkOutcome {
    /// Response body, empty when the call degraded
    pub response: Bytes,
    /// Every physical attempt, in order
    pub attempts: Vec<Attempt>,
    /// Instant the logical call was issued
    pub started: Instant,
    /// Instant the final attempt resolved
    pub completed: Instant,
    /// Whether any attempt completed the round trip
    pub delivered: bool,
}

impl LinkOutcome {
    /// Bytes offered across all physical attempts, dropped ones included.
    pub fn bytes_sent(&self) -> u64 {
        self.attempts.iter().map(|a| a.bytes_sent).sum()
    }

    /// Bytes delivered on response legs.
    pub fn bytes_received(&self) -> u64 {
        self.attempts.iter().map(|a| a.bytes_received).sum()
    }

    /// Physical transmissions beyond the first.
    pub fn retries(&self) -> u32 {
        (self.attempts.len() as u32).saturating_sub(1)
    }

    /// Total time from issue to resolution, backoffs included.
    pub fn elapsed(&self) -> Duration {
        self.completed.duration_since(self.started)
    }
}

/// Retry progression for one logical call.
enum SendState {
    Sending { attempt: u32 },
    Backoff { attempt: u32 },
    Delivered { response: Bytes },
    Exhausted,
}

/// Impaired client-to-server link.
///
/// Every client call is driven through [`ImpairedLink::call`], which charges
/// the profile's delay and transfer time symmetrically on the request and
/// response legs and applies one loss draw per physical transmission.
#[derive(Debug, Clone)]
pub struct ImpairedLink {
    profile: NetworkProfile,
    call_timeout: Duration,
}

impl ImpairedLink {
    /// Create a link with the given impairment profile and per-call ceiling.
    pub fn new(profile: NetworkProfile, call_timeout: Duration) -> Self {
        Self { profile, call_timeout }
    }

    /// The profile this link charges against.
    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    /// Charge the receive leg for a server-pushed payload of `bytes`.
    ///
    /// Pushed events are not client-initiated transmissions, so no loss draw
    /// and no retry apply; only delay and transfer time are charged.
    pub async fn charge_push(&self, bytes: u64) {
        let wait = self.profile.one_way_delay() + self.profile.bandwidth.transfer_time(bytes);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Drive one logical call: transmit `request_bytes`, invoke `serve` for
    /// the response once a transmission gets through, and charge the
    /// response leg on the way back.
    ///
    /// Returns `Err(Timeout)` if the whole call exceeds the ceiling and
    /// propagates connection refusals from `serve`; loss-triggered retry
    /// exhaustion returns a degraded outcome instead.
    pub async fn call<F, Fut>(&self, request_bytes: u64, serve: F) -> Result<LinkOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        match tokio::time::timeout(self.call_timeout, self.drive(request_bytes, serve)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(BenchError::Timeout { ceiling: self.call_timeout }),
        }
    }

    async fn drive<F, Fut>(&self, request_bytes: u64, serve: F) -> Result<LinkOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let started = Instant::now();
        let one_way = self.profile.one_way_delay();
        let mut attempts = Vec::new();
        let mut state = SendState::Sending { attempt: 1 };

        loop {
            state = match state {
                SendState::Sending { attempt } => {
                    let attempt_start = Instant::now();
                    if self.transmission_dropped() {
                        // The send leg still occupies the link before the
                        // drop is observed.
                        tokio::time::sleep(one_way).await;
                        attempts.push(Attempt {
                            bytes_sent: request_bytes,
                            bytes_received: 0,
                            elapsed: attempt_start.elapsed(),
                            delivered: false,
                        });
                        trace!(attempt, "transmission dropped");
                        if attempt >= MAX_ATTEMPTS {
                            SendState::Exhausted
                        } else {
                            SendState::Backoff { attempt }
                        }
                    } else {
                        let request_leg =
                            one_way + self.profile.bandwidth.transfer_time(request_bytes);
                        tokio::time::sleep(request_leg).await;

                        let response = serve().await?;

                        let response_leg =
                            one_way + self.profile.bandwidth.transfer_time(response.len() as u64);
                        tokio::time::sleep(response_leg).await;

                        attempts.push(Attempt {
                            bytes_sent: request_bytes,
                            bytes_received: response.len() as u64,
                            elapsed: attempt_start.elapsed(),
                            delivered: true,
                        });
                        SendState::Delivered { response }
                    }
                }
                SendState::Backoff { attempt } => {
                    tokio::time::sleep(RETRY_BACKOFF * (1u32 << (attempt - 1))).await;
                    SendState::Sending { attempt: attempt + 1 }
                }
                SendState::Delivered { response } => {
                    return Ok(LinkOutcome {
                        response,
                        attempts,
                        started,
                        completed: Instant::now(),
                        delivered: true,
                    });
                }
                SendState::Exhausted => {
                    debug!(attempts = attempts.len(), "retry budget exhausted, returning degraded");
                    return Ok(LinkOutcome {
                        response: Bytes::new(),
                        attempts,
                        started,
                        completed: Instant::now(),
                        delivered: false,
                    });
                }
            };
        }
    }

    /// One uniform draw in [0, 100) per physical transmission. The RNG is
    /// never consulted on loss-free profiles.
    fn transmission_dropped(&self) -> bool {
        if self.profile.packet_loss_pct <= 0.0 {
            return false;
        }
        rand::thread_rng().gen_range(0.0..100.0) < self.profile.packet_loss_pct
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Bandwidth;

    fn serve_ok() -> impl Fn() -> std::future::Ready<Result<Bytes>> {
        || std::future::ready(Ok(Bytes::from_static(b"pong")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_charges_twice_the_latency() {
        let profile = NetworkProfile {
            latency_ms: 40.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 0.0,
        };
        let link = ImpairedLink::new(profile, Duration::from_secs(30));

        let outcome = link.call(128, serve_ok()).await.unwrap();
        assert!(outcome.delivered);
        assert!(outcome.elapsed() >= Duration::from_millis(80));
        assert_eq!(outcome.retries(), 0);
        assert_eq!(outcome.bytes_sent(), 128);
        assert_eq!(outcome.bytes_received(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bandwidth_charged_per_leg() {
        let profile = NetworkProfile {
            latency_ms: 0.0,
            bandwidth: Bandwidth::Mbps(8.0),
            packet_loss_pct: 0.0,
        };
        let link = ImpairedLink::new(profile, Duration::from_secs(120));

        // 1 MB request at 8 Mbps is one second; the 4-byte response is noise.
        let outcome = link.call(1_000_000, serve_ok()).await.unwrap();
        assert!(outcome.elapsed() >= Duration::from_secs(1));
        assert!(outcome.elapsed() < Duration::from_millis(1100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_loss_degrades_after_three_attempts() {
        let profile = NetworkProfile {
            latency_ms: 10.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 100.0,
        };
        let link = ImpairedLink::new(profile, Duration::from_secs(30));

        let outcome = link.call(256, serve_ok()).await.unwrap();
        assert!(!outcome.delivered);
        assert_eq!(outcome.attempts.len(), MAX_ATTEMPTS as usize);
        assert_eq!(outcome.retries(), MAX_ATTEMPTS - 1);
        // Dropped attempts still charge the bytes they offered.
        assert_eq!(outcome.bytes_sent(), 256 * MAX_ATTEMPTS as u64);
        assert_eq!(outcome.bytes_received(), 0);
        // Three send legs plus 100ms + 200ms backoff.
        assert!(outcome.elapsed() >= Duration::from_millis(330));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_matches_loss_probability_cubed() {
        let profile = NetworkProfile {
            latency_ms: 0.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 50.0,
        };
        let link = ImpairedLink::new(profile, Duration::from_secs(30));

        let trials = 10_000u32;
        let mut failed = 0u32;
        for _ in 0..trials {
            if !link.call(64, serve_ok()).await.unwrap().delivered {
                failed += 1;
            }
        }
        // p^3 = 0.125 at p = 0.5; allow generous sampling tolerance.
        let rate = failed as f64 / trials as f64;
        assert!((rate - 0.125).abs() < 0.02, "observed failure rate {rate}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_hard_stop() {
        let profile = NetworkProfile {
            latency_ms: 500.0,
            bandwidth: Bandwidth::Unlimited,
            packet_loss_pct: 0.0,
        };
        let link = ImpairedLink::new(profile, Duration::from_millis(100));

        let err = link.call(64, serve_ok()).await.unwrap_err();
        assert!(matches!(err, BenchError::Timeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_refusal_propagates() {
        let link = ImpairedLink::new(NetworkProfile::ideal(), Duration::from_secs(30));
        let err = link
            .call(64, || {
                std::future::ready(Err(BenchError::Connection {
                    endpoint: "chat".into(),
                    reason: "refused".into(),
                }))
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ideal_link_adds_no_time() {
        let link = ImpairedLink::new(NetworkProfile::ideal(), Duration::from_secs(30));
        let outcome = link.call(1024, serve_ok()).await.unwrap();
        assert!(outcome.delivered);
        assert_eq!(outcome.elapsed(), Duration::ZERO);
    }
}
