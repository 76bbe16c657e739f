//! The RPC surface the pipeline talks to the worker through.
//!
//! `call` wraps one job send in the full resilience protocol:
//!
//! 1. `ensure_ready` the lifecycle (sharing any in-flight creation);
//! 2. check the context still exists before sending; if it vanished,
//!    reset the lifecycle and try again after a short delay;
//! 3. size the timeout budget: long-running kinds from their input size,
//!    admin kinds from the fixed admin timeout;
//! 4. send through the session and wait;
//! 5. map the outcome: a *disconnect* consumes one unit of the two-attempt
//!    budget and loops back to step 1, everything else settles the call.
//!
//! The retry budget covers both failure points (absent before send,
//! disconnected mid-call) together, so a flapping worker cannot keep a
//! caller in the loop forever.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ReconstructionConfig;
use crate::error::{CallFailure, PageloomError};
use crate::worker::deadline::TimeoutPolicy;
use crate::worker::job::{
    self, InspectReply, Job, LayoutHints, PageBox, RenderReply, SynthesizeReply,
};
use crate::worker::lifecycle::WorkerLifecycle;
use crate::worker::payload::{PayloadRef, PayloadStore};
use crate::worker::transport::{ProcessTransport, WorkerTransport};

/// Total attempts per call when the worker keeps disappearing.
const SEND_ATTEMPTS: u8 = 2;

/// Pause before re-creating a vanished worker context.
const RESET_DELAY: Duration = Duration::from_millis(250);

/// Lifecycle, payload store and timeout policy behind one call surface.
pub struct WorkerGateway {
    lifecycle: WorkerLifecycle,
    policy: TimeoutPolicy,
    store: PayloadStore,
}

impl WorkerGateway {
    /// Build the gateway from config: an explicit transport if one was
    /// injected, otherwise the process sidecar over the spool dir.
    pub fn new(config: &ReconstructionConfig) -> Self {
        let store = PayloadStore::new(config.spool_dir.clone());
        let transport: Arc<dyn WorkerTransport> = match &config.transport {
            Some(t) => Arc::clone(t),
            None => Arc::new(ProcessTransport::new(
                config.worker_command.clone(),
                store.primary_dir().to_path_buf(),
            )),
        };
        WorkerGateway {
            lifecycle: WorkerLifecycle::new(transport, config.timeouts.clone()),
            policy: config.timeouts.clone(),
            store,
        }
    }

    /// The store job payloads travel through.
    pub fn payloads(&self) -> &PayloadStore {
        &self.store
    }

    /// Send one job and return its validated reply object.
    pub async fn call(&self, job: &Job) -> Result<Value, PageloomError> {
        let mut last_detail = String::new();

        for attempt in 1..=SEND_ATTEMPTS {
            let session = self.lifecycle.ensure_ready().await?;

            if !session.is_attached().await {
                last_detail = "worker context absent before send".to_string();
                warn!(attempt, kind = job.kind(), "worker context missing, resetting");
                self.lifecycle.reset().await;
                if attempt < SEND_ATTEMPTS {
                    tokio::time::sleep(RESET_DELAY).await;
                    continue;
                }
                break;
            }

            let budget = if job.is_long_running() {
                self.policy.budget_for(job.cost_units())
            } else {
                self.policy.admin_timeout
            };

            match session.call(job, budget).await {
                Ok(reply) => {
                    debug!(kind = job.kind(), "job settled");
                    return job::parse_reply(reply).map_err(|f| settle_failure(job, f));
                }
                Err(failure) if failure.is_retryable() => {
                    last_detail = failure.to_string();
                    warn!(
                        attempt,
                        kind = job.kind(),
                        "worker disconnected mid-call: {failure}"
                    );
                    self.lifecycle.reset().await;
                    if attempt < SEND_ATTEMPTS {
                        tokio::time::sleep(RESET_DELAY).await;
                        continue;
                    }
                }
                Err(failure) => return Err(settle_failure(job, failure)),
            }
        }

        Err(PageloomError::WorkerNotFound {
            attempts: SEND_ATTEMPTS,
            detail: last_detail,
        })
    }

    // ─── Typed helpers per job kind ───────────────────────────────────────

    pub async fn ping(&self) -> Result<(), PageloomError> {
        self.call(&Job::Ping).await.map(|_| ())
    }

    pub async fn inspect_source(&self, source: PayloadRef) -> Result<InspectReply, PageloomError> {
        let job = Job::InspectSource { source };
        let reply = self.call(&job).await?;
        job::decode_reply(reply).map_err(|f| settle_failure(&job, f))
    }

    pub async fn render_batch(
        &self,
        source: PayloadRef,
        boxes: Vec<PageBox>,
        hints: LayoutHints,
    ) -> Result<RenderReply, PageloomError> {
        let job = Job::RenderBatch { source, boxes, hints };
        let reply = self.call(&job).await?;
        job::decode_reply(reply).map_err(|f| settle_failure(&job, f))
    }

    pub async fn render_page(
        &self,
        source: PayloadRef,
        page_number: usize,
        bounds: PageBox,
        hints: LayoutHints,
    ) -> Result<RenderReply, PageloomError> {
        let job = Job::RenderPage {
            source,
            page_number,
            bounds,
            hints,
        };
        let reply = self.call(&job).await?;
        job::decode_reply(reply).map_err(|f| settle_failure(&job, f))
    }

    pub async fn synthesize(
        &self,
        text: String,
        voice: String,
    ) -> Result<SynthesizeReply, PageloomError> {
        let job = Job::Synthesize { text, voice };
        let reply = self.call(&job).await?;
        job::decode_reply(reply).map_err(|f| settle_failure(&job, f))
    }

    pub async fn release_resources(&self) -> Result<(), PageloomError> {
        self.call(&Job::ReleaseResources).await.map(|_| ())
    }

    /// Tear the worker context down (configuration switch).
    pub async fn retire(&self) {
        self.lifecycle.retire().await;
    }
}

/// Map a settled call failure onto the public error taxonomy.
fn settle_failure(job: &Job, failure: CallFailure) -> PageloomError {
    match failure {
        CallFailure::TimedOut { elapsed } => PageloomError::JobTimeout {
            kind: job.kind(),
            elapsed,
            hard: false,
        },
        CallFailure::Expired { elapsed } => PageloomError::JobTimeout {
            kind: job.kind(),
            elapsed,
            hard: true,
        },
        CallFailure::Rejected { message } => PageloomError::JobFailed {
            kind: job.kind(),
            detail: message,
        },
        CallFailure::Malformed { detail } => PageloomError::JobFailed {
            kind: job.kind(),
            detail,
        },
        // only reachable when the retry budget is already gone
        CallFailure::Disconnected { detail } => PageloomError::WorkerNotFound {
            attempts: SEND_ATTEMPTS,
            detail,
        },
    }
}
