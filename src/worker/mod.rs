//! Worker context management: lifecycle, RPC gateway, adaptive deadlines.
//!
//! The heavy rendering work runs in an isolated worker context (by default a
//! sidecar process speaking line-delimited JSON on stdio). The worker is slow
//! to start, may be torn down by the host at any time, and a single job may
//! legitimately run for hours. The submodules here exist to make that
//! environment look like an ordinary async call to the rest of the crate.
//!
//! ## Layering
//!
//! ```text
//! gateway ──▶ lifecycle ──▶ session ──▶ transport ──▶ worker
//!    │                         │
//!   job / payload           deadline
//! ```
//!
//! 1. [`job`] — typed jobs, the wire envelope, lenient reply parsing
//! 2. [`payload`] — size-based transport strategy for large payloads
//!    (inline / spooled / fallback spool)
//! 3. [`deadline`] — per-job budget sizing and the heartbeat-extended clock
//! 4. [`transport`] — where worker wires come from; the process sidecar
//!    lives here, tests plug in their own
//! 5. [`session`] — one live connection: correlation ids, reply routing,
//!    disconnect detection
//! 6. [`lifecycle`] — single-flight create / reset / retire of the session
//! 7. [`gateway`] — the call surface the pipeline uses: budgets, bounded
//!    retry-on-disconnect, typed helpers per job kind

pub mod deadline;
pub mod gateway;
pub mod job;
pub mod lifecycle;
pub mod payload;
pub mod session;
pub mod transport;
