//! Error types for the pageloom library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PageloomError`] — **Fatal**: the reconstruction cannot proceed at all
//!   (bad input file, worker context never came up, page geometry unusable,
//!   every single page failed). Returned as `Err(PageloomError)` from the
//!   top-level `reconstruct*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed (render glitch,
//!   model call exhausted its retry ladder, unparseable reply) but all other
//!   pages are fine. Stored inside [`crate::output::PageOutcome`] so callers
//!   can inspect partial success rather than losing the whole document to
//!   one bad page.
//!
//! A third, crate-internal [`CallFailure`] tags the outcome of one worker
//! RPC so the gateway's retry decision is made on data rather than on
//! message-string matching: only [`CallFailure::Disconnected`] consumes
//! retry budget, every other tag settles the call.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// All fatal errors returned by the pageloom library.
///
/// Page-level failures use [`PageError`] and are stored in
/// [`crate::output::PageOutcome`] rather than propagated here.
#[derive(Debug, Error)]
pub enum PageloomError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Source file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── Worker errors ─────────────────────────────────────────────────────
    /// The worker context could not be launched.
    #[error("Worker context could not be created: {detail}\nCheck the worker command is installed and on PATH.")]
    WorkerSetup { detail: String },

    /// The worker context kept disappearing and could not be re-established
    /// within the per-call retry budget.
    #[error("Worker context not found after {attempts} attempts: {detail}")]
    WorkerNotFound { attempts: u8, detail: String },

    /// A worker job settled with a failure the gateway does not retry.
    #[error("Worker job '{kind}' failed: {detail}")]
    JobFailed { kind: &'static str, detail: String },

    /// A worker job ran past its deadline.
    ///
    /// `hard` is true when the absolute ceiling was hit: the job was still
    /// sending heartbeats but exceeded the longest run the timeout policy
    /// allows.
    #[error("Worker job '{kind}' timed out after {elapsed:?} (hard ceiling: {hard})")]
    JobTimeout {
        kind: &'static str,
        elapsed: Duration,
        hard: bool,
    },

    /// A spooled job payload could not be read back.
    #[error("Payload '{key}' could not be retrieved: {detail}")]
    PayloadUnavailable { key: String, detail: String },

    /// A job payload could not be written to any spool location.
    #[error("Payload could not be spooled: {detail}")]
    SpoolFailed { detail: String },

    // ── Geometry errors ───────────────────────────────────────────────────
    /// Page geometry is missing or incoherent; rendering cannot start.
    #[error("Page geometry is unusable: {detail}\nEvery page needs a non-degenerate page box before rendering.")]
    InvalidGeometry { detail: String },

    // ── Model errors ──────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Model provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Document-level outcomes ───────────────────────────────────────────
    /// Every page failed after all retries; output would be empty.
    #[error("All {total} pages failed after {retries} retries each.\nFirst error: {first_error}")]
    AllPagesFailed {
        total: usize,
        retries: u32,
        first_error: String,
    },

    /// Some pages succeeded but at least one failed.
    ///
    /// Returned by [`crate::output::ReconstructionOutput::into_result`] when
    /// the caller wants to treat any page failure as an error.
    #[error("{failed}/{total} pages failed during reconstruction")]
    PartialFailure {
        success: usize,
        failed: usize,
        total: usize,
    },

    /// The cancellation token fired and was observed at a checkpoint.
    #[error("Reconstruction cancelled")]
    Cancelled,

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// Stored alongside [`crate::output::PageOutcome`] when a page fails.
/// The overall reconstruction continues unless ALL pages fail.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The worker produced no usable image for this page.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: usize, detail: String },

    /// Model call failed after every rung of the retry ladder.
    #[error("Page {page}: model call failed after {retries} retries: {detail}")]
    ModelFailed {
        page: usize,
        retries: u8,
        detail: String,
    },

    /// The model replied, but not with the structured shape we asked for.
    #[error("Page {page}: could not parse model reply: {detail}")]
    ParseFailed { page: usize, detail: String },
}

impl PageError {
    /// 1-indexed page this error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ModelFailed { page, .. }
            | PageError::ParseFailed { page, .. } => *page,
        }
    }
}

/// Outcome tag for a single worker RPC.
///
/// The gateway matches on the tag to decide what happens next:
/// `Disconnected` consumes one unit of retry budget and re-sends, every
/// other tag settles the call immediately. Kept separate from
/// [`PageloomError`] so the retry path never inspects display strings.
#[derive(Debug, Clone, Error)]
pub enum CallFailure {
    /// The transport went away mid-call: channel closed, worker process
    /// exited, or the reply stream hit EOF before our correlation id was
    /// answered.
    #[error("Worker connection lost: {detail}")]
    Disconnected { detail: String },

    /// The adaptive deadline fired without a heartbeat extension saving it.
    #[error("Call timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },

    /// The absolute ceiling was reached while the job was still extending.
    #[error("Call exceeded the absolute deadline ceiling after {elapsed:?}")]
    Expired { elapsed: Duration },

    /// The worker answered with `success: false`.
    #[error("Worker rejected the job: {message}")]
    Rejected { message: String },

    /// The worker answered with something that is not a reply object.
    #[error("Malformed worker reply: {detail}")]
    Malformed { detail: String },
}

impl CallFailure {
    /// Whether the gateway may spend retry budget on this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallFailure::Disconnected { .. })
    }
}
