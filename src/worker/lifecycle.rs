//! Single-flight lifecycle for the worker context.
//!
//! The worker context is process-wide and expensive to create, so exactly
//! one creation attempt may be in flight at any time. Callers hitting
//! `ensure_ready` while an attempt runs await *that* attempt through a
//! watch channel instead of launching a duplicate; callers arriving after
//! it settled get the cached session. A failed attempt clears the state so
//! the next caller retries from scratch.
//!
//! Readiness confirmation is best-effort: after launch the worker gets a
//! fixed settle delay, then up to five ping polls 100ms apart. If it never
//! confirms, that is logged and the session is returned anyway. The worker
//! may simply be slow to warm up, and the gateway's pre-send existence
//! check catches the truly dead ones.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::error::PageloomError;
use crate::worker::deadline::TimeoutPolicy;
use crate::worker::job::Job;
use crate::worker::session::WorkerSession;
use crate::worker::transport::WorkerTransport;

/// Pause between launching the worker and the first readiness poll.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Readiness poll schedule: up to 5 pings, 100ms apart.
const READY_POLLS: u32 = 5;
const READY_POLL_GAP: Duration = Duration::from_millis(100);

type CreationResult = Result<Arc<WorkerSession>, String>;

enum LifecycleState {
    /// No context exists and nobody is creating one.
    Uncreated,
    /// One creation attempt is in flight; awaiters subscribe here.
    Creating(watch::Receiver<Option<CreationResult>>),
    /// A context exists and calls may be sent to it.
    Ready(Arc<WorkerSession>),
}

/// Owns the worker context state machine.
pub struct WorkerLifecycle {
    transport: Arc<dyn WorkerTransport>,
    policy: TimeoutPolicy,
    state: Mutex<LifecycleState>,
}

enum Plan {
    Use(Arc<WorkerSession>),
    Wait(watch::Receiver<Option<CreationResult>>),
    Create(watch::Sender<Option<CreationResult>>),
}

impl WorkerLifecycle {
    pub fn new(transport: Arc<dyn WorkerTransport>, policy: TimeoutPolicy) -> Self {
        WorkerLifecycle {
            transport,
            policy,
            state: Mutex::new(LifecycleState::Uncreated),
        }
    }

    /// Return a usable session, creating the worker context if needed.
    ///
    /// Idempotent and single-flight: concurrent callers share one creation
    /// attempt. A `Ready` session whose connection has since died is
    /// replaced transparently.
    pub async fn ensure_ready(&self) -> Result<Arc<WorkerSession>, PageloomError> {
        let plan = {
            let mut state = self.state.lock().await;
            match &*state {
                LifecycleState::Ready(session) if !session.is_dead() => {
                    Plan::Use(Arc::clone(session))
                }
                LifecycleState::Creating(rx) => Plan::Wait(rx.clone()),
                _ => {
                    if let LifecycleState::Ready(stale) = &*state {
                        // connection died behind our back; reap the old
                        // context while the replacement comes up
                        let monitor = stale.monitor();
                        tokio::spawn(async move { monitor.terminate().await });
                    }
                    let (tx, rx) = watch::channel(None);
                    *state = LifecycleState::Creating(rx);
                    Plan::Create(tx)
                }
            }
        };

        match plan {
            Plan::Use(session) => Ok(session),
            Plan::Wait(mut rx) => loop {
                let settled = rx.borrow_and_update().clone();
                if let Some(result) = settled {
                    return result.map_err(|detail| PageloomError::WorkerSetup { detail });
                }
                if rx.changed().await.is_err() {
                    return Err(PageloomError::WorkerSetup {
                        detail: "creation attempt abandoned".to_string(),
                    });
                }
            },
            Plan::Create(tx) => {
                let result = self.launch_and_settle().await;

                let mut state = self.state.lock().await;
                *state = match &result {
                    Ok(session) => LifecycleState::Ready(Arc::clone(session)),
                    Err(detail) => {
                        warn!("worker context creation failed: {detail}");
                        LifecycleState::Uncreated
                    }
                };
                drop(state);

                let _ = tx.send(Some(result.clone()));
                result.map_err(|detail| PageloomError::WorkerSetup { detail })
            }
        }
    }

    async fn launch_and_settle(&self) -> CreationResult {
        info!("creating worker context");
        let wires = self.transport.launch().await.map_err(|e| e.to_string())?;
        let session = WorkerSession::spawn(wires, self.policy.clone());

        tokio::time::sleep(SETTLE_DELAY).await;

        let mut confirmed = false;
        for attempt in 1..=READY_POLLS {
            match session.call(&Job::Ping, self.policy.admin_timeout).await {
                Ok(_) => {
                    debug!(attempt, "worker context confirmed ready");
                    confirmed = true;
                    break;
                }
                Err(e) => debug!(attempt, "readiness ping failed: {e}"),
            }
            if attempt < READY_POLLS {
                tokio::time::sleep(READY_POLL_GAP).await;
            }
        }
        if !confirmed {
            // not fatal: callers may still reach a slow-warming worker
            warn!("worker context never confirmed readiness, proceeding anyway");
        }
        Ok(session)
    }

    /// Forget the current context so the next `ensure_ready` starts fresh.
    ///
    /// Used by the gateway when the pre-send existence check finds the
    /// worker gone. Terminates the old context best-effort.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        if let LifecycleState::Ready(session) = &*state {
            let monitor = session.monitor();
            tokio::spawn(async move { monitor.terminate().await });
        }
        *state = LifecycleState::Uncreated;
    }

    /// Tear the context down for a configuration switch.
    ///
    /// Asks the worker to release its internal resources first, then
    /// terminates it. The next `ensure_ready` creates a fresh context.
    pub async fn retire(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, LifecycleState::Uncreated)
        };
        if let LifecycleState::Ready(session) = previous {
            info!("retiring worker context");
            if let Err(e) = session
                .call(&Job::ReleaseResources, self.policy.admin_timeout)
                .await
            {
                debug!("release_resources before retire failed: {e}");
            }
            session.monitor().terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::transport::{WorkerMonitor, WorkerWires};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

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

    /// A worker that answers every request with success.
    struct ObligingTransport {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl WorkerTransport for ObligingTransport {
        async fn launch(&self) -> Result<WorkerWires, PageloomError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            let (out_tx, mut out_rx) = mpsc::channel::<String>(16);
            let (in_tx, in_rx) = mpsc::channel::<String>(16);
            tokio::spawn(async move {
                while let Some(line) = out_rx.recv().await {
                    let req: Value = serde_json::from_str(&line).unwrap();
                    let id = req["id"].as_u64().unwrap();
                    if in_tx
                        .send(json!({"id": id, "success": true}).to_string())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
            Ok(WorkerWires {
                outbound: out_tx,
                inbound: in_rx,
                monitor: Arc::new(FakeMonitor {
                    alive: AtomicBool::new(true),
                }),
            })
        }
    }

    struct BrokenTransport {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl WorkerTransport for BrokenTransport {
        async fn launch(&self) -> Result<WorkerWires, PageloomError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Err(PageloomError::WorkerSetup {
                detail: "no such worker".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_creation() {
        let transport = Arc::new(ObligingTransport {
            launches: AtomicUsize::new(0),
        });
        let lifecycle = Arc::new(WorkerLifecycle::new(
            Arc::clone(&transport) as Arc<dyn WorkerTransport>,
            TimeoutPolicy::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lc = Arc::clone(&lifecycle);
            handles.push(tokio::spawn(async move { lc.ensure_ready().await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(transport.launches.load(Ordering::SeqCst), 1);

        // already Ready: still no new launch
        lifecycle.ensure_ready().await.unwrap();
        assert_eq!(transport.launches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_clears_state_for_retry() {
        let transport = Arc::new(BrokenTransport {
            launches: AtomicUsize::new(0),
        });
        let lifecycle = WorkerLifecycle::new(
            Arc::clone(&transport) as Arc<dyn WorkerTransport>,
            TimeoutPolicy::default(),
        );

        assert!(lifecycle.ensure_ready().await.is_err());
        assert!(lifecycle.ensure_ready().await.is_err());
        // each call got a fresh attempt rather than a cached failure
        assert_eq!(transport.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forces_a_new_context() {
        let transport = Arc::new(ObligingTransport {
            launches: AtomicUsize::new(0),
        });
        let lifecycle = WorkerLifecycle::new(
            Arc::clone(&transport) as Arc<dyn WorkerTransport>,
            TimeoutPolicy::default(),
        );

        let first = lifecycle.ensure_ready().await.unwrap();
        lifecycle.reset().await;
        let second = lifecycle.ensure_ready().await.unwrap();

        assert_eq!(transport.launches.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
