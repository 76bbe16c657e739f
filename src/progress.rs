//! Progress-callback trait for per-page reconstruction events.
//!
//! Inject an [`Arc<dyn ReconstructionProgress>`] via
//! [`crate::config::ReconstructionConfigBuilder::progress`] to receive
//! real-time events as the pipeline processes each page.
//!
//! ## Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers
//! can forward events to a Tokio broadcast channel, a WebSocket, a database
//! record, or a terminal progress bar — without the library knowing
//! anything about how the host application communicates. The trait is
//! `Send + Sync` so the config holding it stays freely clonable across
//! tasks.
//!
//! # Example
//!
//! ```rust
//! use pageloom::{ReconstructionProgress, ReconstructionConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingProgress {
//!     completed: Arc<AtomicUsize>,
//! }
//!
//! impl ReconstructionProgress for CountingProgress {
//!     fn on_page_complete(&self, page: usize, total_pages: usize, text_len: usize) {
//!         self.completed.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("Page {}/{} done ({} bytes)", page, total_pages, text_len);
//!     }
//! }
//!
//! let counter = Arc::new(CountingProgress {
//!     completed: Arc::new(AtomicUsize::new(0)),
//! });
//!
//! let config = ReconstructionConfig::builder()
//!     .progress(counter as Arc<dyn ReconstructionProgress>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// All methods have default no-op implementations so callers only
/// override what they care about. The page loop is sequential, so events
/// for one run arrive in order and never concurrently; implementations
/// still need `Send + Sync` because the config that carries them moves
/// across tasks.
pub trait ReconstructionProgress: Send + Sync {
    /// Called once after inspection, before any page is rendered.
    fn on_reconstruction_start(&self, total_pages: usize) {
        let _ = total_pages;
    }

    /// Called just before a page's model exchange begins.
    fn on_page_start(&self, page: usize, total_pages: usize) {
        let _ = (page, total_pages);
    }

    /// Called when a page commits successfully.
    ///
    /// `text_len` is the byte length of the produced fragment, useful for
    /// progress bars that track output size.
    fn on_page_complete(&self, page: usize, total_pages: usize, text_len: usize) {
        let _ = (page, total_pages, text_len);
    }

    /// Called when a page fails after all retries are exhausted, or could
    /// not be rendered at all.
    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let _ = (page, total_pages, error);
    }

    /// Called once after all pages have been attempted.
    fn on_reconstruction_complete(&self, total_pages: usize, success_count: usize) {
        let _ = (total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgress;

impl ReconstructionProgress for NoopProgress {}

/// Convenience alias matching the type stored in
/// [`crate::config::ReconstructionConfig`].
pub type ProgressHook = Arc<dyn ReconstructionProgress>;
