//! Pipeline stages for page-by-page document reconstruction.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. script the model in tests) without touching
//! other stages.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ model ──▶ assemble
//! (URL/path) (worker)   (base64)  (VLM)     (merge + scan)
//!                                   │
//!                                metadata
//!                               (accumulate)
//! ```
//!
//! 1. [`input`]    — canonicalise the user-supplied path or URL into bytes
//! 2. [`render`]   — rasterise pages through the worker gateway; batch
//!    first, sequential per-page fallback
//! 3. [`encode`]   — PNG-encode and base64-wrap each raw RGBA page for the
//!    multimodal request body
//! 4. [`model`]    — drive the conversational exchange with retry ladder
//!    and reply parsing; the only stage with provider network I/O
//! 5. [`metadata`] — accumulate title/author/date candidates while the
//!    search window is open
//! 6. [`assemble`] — join fragments by merge hint, reconcile the title,
//!    scan the result into typed content elements

pub mod assemble;
pub mod encode;
pub mod input;
pub mod metadata;
pub mod model;
pub mod render;
