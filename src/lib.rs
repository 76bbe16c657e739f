//! # pageloom
//!
//! Reconstruct documents page by page through a sidecar worker and a
//! conversational vision model.
//!
//! ## Why this crate?
//!
//! Extracting a document's real structure is two hard problems stacked on
//! top of each other. Rendering engines are native code that can crash,
//! leak, or hang on hostile inputs, so pageloom confines rendering to a
//! separate worker process it can watch, time out adaptively, and restart
//! mid-document. And page boundaries are printing artefacts: sentences,
//! lists and tables run straight across them. So instead of treating each
//! page as an independent transcription job, pageloom runs one
//! conversation per document — the model sees its own output for earlier
//! pages and reports, for every page, how its text attaches to what came
//! before. The fragments are then merged, the title deduplicated, and the
//! result parsed into typed content elements ready for an encoder.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Inspect   worker reports page count and page geometry
//!  ├─ 3. Render    batch rasterisation, sequential per-page fallback
//!  ├─ 4. Model     one conversational exchange per page, 2s/5s/10s/20s
//!  │               retry ladder, metadata discovery on early pages
//!  ├─ 5. Assemble  merge-hint joins, title reconciliation, line scan
//!  └─ 6. Output    typed content elements + Markdown + per-page stats
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pageloom::{reconstruct, ReconstructionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = ReconstructionConfig::default();
//!     let output = reconstruct("document.pdf", &config).await?;
//!     println!("{}", output.markdown);
//!     eprintln!("tokens: {} in / {} out",
//!         output.stats.total_input_tokens,
//!         output.stats.total_output_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## The worker sidecar
//!
//! Jobs travel to the worker as newline-delimited JSON over stdin/stdout;
//! large payloads are spooled to disk and passed by key (the worker learns
//! the spool directory from `PAGELOOM_SPOOL_DIR`). Long jobs get a
//! size-derived deadline that a heartbeat extends while the worker stays
//! alive, up to an absolute ceiling. If the worker dies mid-call, the
//! gateway restarts it and retries once before giving up. See
//! [`worker`] for the protocol types and [`TimeoutPolicy`] for the
//! deadline rules.
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pageloom` binary (clap + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only
//! deps:
//! ```toml
//! pageloom = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ReconstructionConfig, ReconstructionConfigBuilder, DEFAULT_PAGE_RETRY_DELAYS,
};
pub use convert::{inspect, reconstruct, Pageloom, SynthesisResult};
pub use error::{CallFailure, PageError, PageloomError};
pub use output::{
    ContentElement, DocumentMetadata, MergeHint, MetaValue, MetadataCandidate, PageOutcome,
    ReconstructedDocument, ReconstructionOutput, ReconstructionStats,
};
pub use pipeline::model::{ModelClient, ModelReply};
pub use progress::{NoopProgress, ProgressHook, ReconstructionProgress};
pub use worker::deadline::TimeoutPolicy;
pub use worker::job::{InspectReply, Job, LayoutHints, PageBox};
pub use worker::transport::{WorkerMonitor, WorkerTransport, WorkerWires};
