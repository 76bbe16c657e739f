//! One live worker connection: correlation ids, reply routing, deadlines.
//!
//! A session owns the wires to exactly one worker context. Callers submit
//! a [`Job`] and get back the reply object for *their* correlation id, no
//! matter how replies interleave on the wire. A background router task
//! reads inbound lines and settles the matching pending call; when the
//! stream hits EOF every pending call fails with
//! [`CallFailure::Disconnected`] at once, because a vanished worker must
//! not leave callers hanging until their deadline.
//!
//! Deadlines are per call. Long-running jobs get a heartbeat ticker that
//! extends the [`DeadlineClock`] while the job is outstanding; short admin
//! jobs just race reply against a fixed timer. A timeout on one call never
//! disturbs another: each call owns its clock and its ticker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::worker::deadline::{DeadlineClock, Tick, TimeoutPolicy};
use crate::worker::job::{self, Job, JobEnvelope};
use crate::worker::transport::{WorkerMonitor, WorkerWires};
use crate::error::CallFailure;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// A connection to one worker context.
///
/// Created by the lifecycle manager via [`WorkerSession::spawn`]; shared
/// behind an `Arc` so the gateway can issue calls while the lifecycle
/// manager keeps its own handle for teardown.
pub struct WorkerSession {
    next_id: AtomicU64,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    dead: Arc<AtomicBool>,
    monitor: Arc<dyn WorkerMonitor>,
    policy: TimeoutPolicy,
}

impl WorkerSession {
    /// Wrap freshly launched wires and start the reply router.
    pub fn spawn(wires: WorkerWires, policy: TimeoutPolicy) -> Arc<Self> {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let dead = Arc::new(AtomicBool::new(false));

        let session = Arc::new(WorkerSession {
            next_id: AtomicU64::new(1),
            outbound: wires.outbound,
            pending: Arc::clone(&pending),
            dead: Arc::clone(&dead),
            monitor: wires.monitor,
            policy,
        });

        let mut inbound = wires.inbound;
        tokio::spawn(async move {
            while let Some(line) = inbound.recv().await {
                let value: Value = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("ignoring non-JSON worker line: {e}");
                        continue;
                    }
                };
                let Some(id) = job::reply_id(&value) else {
                    debug!("ignoring worker line without correlation id");
                    continue;
                };
                match pending.lock().await.remove(&id) {
                    // a settled call (timeout) may receive a late reply;
                    // the dropped receiver makes this send a no-op
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => debug!(id, "reply for already-settled call dropped"),
                }
            }
            // EOF: the worker hung up. Fail everything still in flight.
            dead.store(true, Ordering::SeqCst);
            let drained = pending.lock().await.drain().count();
            if drained > 0 {
                debug!(drained, "worker disconnected with calls in flight");
            }
        });

        session
    }

    /// Liveness/teardown handle for the context behind this session.
    pub fn monitor(&self) -> Arc<dyn WorkerMonitor> {
        Arc::clone(&self.monitor)
    }

    /// True once the reply stream has closed. A dead session never
    /// recovers; the lifecycle manager replaces it wholesale.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst) || self.outbound.is_closed()
    }

    /// The worker context still exists and the wires are open.
    pub async fn is_attached(&self) -> bool {
        !self.is_dead() && self.monitor.is_alive().await
    }

    /// Send `job` and wait for its reply within `budget`.
    ///
    /// The reply is the raw object from the wire; `success`-flag handling
    /// is the gateway's business. Long-running jobs get the heartbeat
    /// treatment, everything else races against the budget as-is.
    pub async fn call(&self, job: &Job, budget: Duration) -> Result<Value, CallFailure> {
        if self.is_dead() {
            return Err(CallFailure::Disconnected {
                detail: "worker connection already closed".to_string(),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = JobEnvelope::new(id, job).to_line()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(line).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CallFailure::Disconnected {
                detail: "worker stdin closed before send".to_string(),
            });
        }
        debug!(id, kind = job.kind(), budget_secs = budget.as_secs(), "job dispatched");

        let mut clock = DeadlineClock::new(budget, self.policy.absolute_maximum);
        let result = if job.is_long_running() {
            self.wait_with_heartbeat(rx, &mut clock, job.kind()).await
        } else {
            Self::wait_plain(rx, &clock).await
        };

        if result.is_err() {
            // drop our slot so a late reply is discarded by the router
            self.pending.lock().await.remove(&id);
        }
        result
    }

    async fn wait_plain(
        mut rx: oneshot::Receiver<Value>,
        clock: &DeadlineClock,
    ) -> Result<Value, CallFailure> {
        tokio::select! {
            biased;
            reply = &mut rx => Self::settle(reply),
            _ = tokio::time::sleep_until(clock.deadline()) => {
                Err(CallFailure::TimedOut { elapsed: clock.elapsed() })
            }
        }
    }

    async fn wait_with_heartbeat(
        &self,
        mut rx: oneshot::Receiver<Value>,
        clock: &mut DeadlineClock,
        kind: &'static str,
    ) -> Result<Value, CallFailure> {
        let mut heartbeat = tokio::time::interval(self.policy.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                biased;
                reply = &mut rx => return Self::settle(reply),
                // the heartbeat outranks the deadline so a tick landing on
                // the same instant extends instead of timing out
                _ = heartbeat.tick() => {
                    match clock.tick(self.policy.extension_window) {
                        Tick::Extended => {
                            debug!(kind, elapsed_secs = clock.elapsed().as_secs(), "deadline extended");
                        }
                        Tick::Unchanged => {}
                        Tick::CeilingReached => {
                            return Err(CallFailure::Expired { elapsed: clock.elapsed() });
                        }
                    }
                }
                _ = tokio::time::sleep_until(clock.deadline()) => {
                    return Err(if clock.at_ceiling() {
                        CallFailure::Expired { elapsed: clock.elapsed() }
                    } else {
                        CallFailure::TimedOut { elapsed: clock.elapsed() }
                    });
                }
            }
        }
    }

    fn settle(reply: Result<Value, oneshot::error::RecvError>) -> Result<Value, CallFailure> {
        reply.map_err(|_| CallFailure::Disconnected {
            detail: "worker hung up mid-call".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct FakeMonitor {
        alive: AtomicBool,
    }

    #[async_trait]
    impl WorkerMonitor for FakeMonitor {
        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn terminate(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Wires plus the far ends a test scripts the worker with.
    fn fake_wires() -> (WorkerWires, mpsc::Receiver<String>, mpsc::Sender<String>) {
        let (out_tx, out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let wires = WorkerWires {
            outbound: out_tx,
            inbound: in_rx,
            monitor: Arc::new(FakeMonitor {
                alive: AtomicBool::new(true),
            }),
        };
        (wires, out_rx, in_tx)
    }

    fn short_policy() -> TimeoutPolicy {
        TimeoutPolicy {
            heartbeat_interval: Duration::from_secs(30),
            extension_window: Duration::from_secs(120),
            absolute_maximum: Duration::from_secs(300),
            ..TimeoutPolicy::default()
        }
    }

    #[tokio::test]
    async fn reply_routed_by_correlation_id() {
        let (wires, mut out_rx, in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        let worker = tokio::spawn(async move {
            let line = out_rx.recv().await.unwrap();
            let req: Value = serde_json::from_str(&line).unwrap();
            let id = req["id"].as_u64().unwrap();
            in_tx
                .send(json!({"id": id, "success": true, "pong": true}).to_string())
                .await
                .unwrap();
        });

        let reply = session.call(&Job::Ping, Duration::from_secs(10)).await.unwrap();
        assert_eq!(reply["pong"], true);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn interleaved_replies_reach_their_own_callers() {
        let (wires, mut out_rx, in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        // answer the two requests in reverse order
        let worker = tokio::spawn(async move {
            let first: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
            let second: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
            for req in [second, first] {
                let id = req["id"].as_u64().unwrap();
                in_tx
                    .send(json!({"id": id, "success": true, "echo": id}).to_string())
                    .await
                    .unwrap();
            }
        });

        let job_a = Job::Synthesize {
            text: "a".into(),
            voice: "v".into(),
        };
        let job_b = Job::Synthesize {
            text: "b".into(),
            voice: "v".into(),
        };
        let (a, b) = tokio::join!(
            session.call(&job_a, Duration::from_secs(10)),
            session.call(&job_b, Duration::from_secs(10)),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a["echo"], a["id"]);
        assert_eq!(b["echo"], b["id"]);
        assert_ne!(a["id"], b["id"]);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_calls() {
        let (wires, mut out_rx, in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        let worker = tokio::spawn(async move {
            let _ = out_rx.recv().await;
            drop(in_tx); // worker dies without answering
        });

        let err = session
            .call(&Job::Ping, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::Disconnected { .. }));
        assert!(session.is_dead());
        worker.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn admin_job_times_out_at_its_fixed_budget() {
        let (wires, _out_rx, _in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        let err = session
            .call(&Job::Ping, Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            CallFailure::TimedOut { elapsed } => {
                assert!(elapsed >= Duration::from_secs(10));
            }
            other => panic!("expected TimedOut, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn long_job_extends_until_the_ceiling_then_expires() {
        let (wires, _out_rx, _in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        let job = Job::Synthesize {
            text: "long".into(),
            voice: "v".into(),
        };
        // initial budget 100s, ceiling 300s: heartbeats keep it alive well
        // past 100s, the ceiling still wins exactly once
        let err = session.call(&job, Duration::from_secs(100)).await.unwrap_err();
        match err {
            CallFailure::Expired { elapsed } => {
                assert!(elapsed >= Duration::from_secs(300), "elapsed {elapsed:?}");
            }
            other => panic!("expected Expired, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_reply_after_settle_is_dropped() {
        let (wires, mut out_rx, in_tx) = fake_wires();
        let session = WorkerSession::spawn(wires, short_policy());

        // first call times out fast, then the worker answers late
        let err = session
            .call(&Job::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CallFailure::TimedOut { .. }));

        let stale: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        let stale_id = stale["id"].as_u64().unwrap();
        in_tx
            .send(json!({"id": stale_id, "success": true}).to_string())
            .await
            .unwrap();

        // a second call still works and gets its own reply
        let worker = tokio::spawn(async move {
            let req: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
            let id = req["id"].as_u64().unwrap();
            assert_ne!(id, stale_id);
            in_tx
                .send(json!({"id": id, "success": true, "fresh": true}).to_string())
                .await
                .unwrap();
        });
        let reply = session.call(&Job::Ping, Duration::from_secs(10)).await.unwrap();
        assert_eq!(reply["fresh"], true);
        worker.await.unwrap();
    }
}
