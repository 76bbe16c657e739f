//! Document reconstruction entry points.
//!
//! ## Why a sequential page loop?
//!
//! Every page is one turn in a single conversation: the model sees its own
//! replies for earlier pages and keeps numbering, heading levels and
//! running sentences consistent across page boundaries. That only works if
//! pages are submitted strictly in order, so the orchestrator never
//! processes two pages of one document concurrently. Rendering, by
//! contrast, is batched up front because page images have no ordering
//! dependency.
//!
//! [`Pageloom`] owns the worker gateway and the model client and can be
//! reused across documents (the worker context persists between runs). The
//! free [`reconstruct`] function is the one-shot convenience wrapper.

use crate::config::ReconstructionConfig;
use crate::error::{PageError, PageloomError};
use crate::output::{
    PageOutcome, ReconstructedDocument, ReconstructionOutput, ReconstructionStats,
};
use crate::pipeline::input::{self, SourceInput};
use crate::pipeline::metadata::MetadataSearch;
use crate::pipeline::model::{self, ExchangeError, ModelClient, TranscriptLog};
use crate::pipeline::{assemble, encode, render};
use crate::prompts;
use crate::worker::gateway::WorkerGateway;
use crate::worker::job::InspectReply;
use edgequake_llm::ChatMessage;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Audio produced by a synthesis job.
#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub audio: Vec<u8>,
    pub duration_ms: u64,
}

/// A reusable reconstruction engine.
///
/// Construction resolves the model client eagerly so a missing API key
/// fails fast, before any worker is spawned or source downloaded. The
/// worker context itself is created lazily on first use and reused across
/// documents until [`Pageloom::shutdown`] or a voice switch retires it.
pub struct Pageloom {
    config: ReconstructionConfig,
    gateway: WorkerGateway,
    client: Arc<dyn ModelClient>,
    last_voice: Mutex<Option<String>>,
}

impl Pageloom {
    pub fn new(config: ReconstructionConfig) -> Result<Self, PageloomError> {
        let client = model::resolve_client(&config)?;
        let gateway = WorkerGateway::new(&config);
        Ok(Pageloom {
            config,
            gateway,
            client,
            last_voice: Mutex::new(None),
        })
    }

    /// Reconstruct a document from a local path or HTTP/HTTPS URL.
    ///
    /// Returns `Ok` even if some pages failed (check
    /// `output.stats.failed_pages` or [`ReconstructionOutput::failed_pages`]);
    /// errors are reserved for document-level failures: unreadable input,
    /// worker setup, invalid geometry, cancellation, or every page failing.
    pub async fn reconstruct(
        &self,
        input_str: impl AsRef<str>,
    ) -> Result<ReconstructionOutput, PageloomError> {
        let input_str = input_str.as_ref();
        info!("Starting reconstruction: {}", input_str);
        let resolved =
            input::resolve_input(input_str, self.config.download_timeout_secs).await?;
        self.run(resolved).await
    }

    /// Reconstruct a document already held in memory.
    ///
    /// `name` stands in for the filename: it seeds the title fallback and
    /// appears in logs.
    pub async fn reconstruct_from_bytes(
        &self,
        bytes: Vec<u8>,
        name: impl Into<String>,
    ) -> Result<ReconstructionOutput, PageloomError> {
        let resolved = SourceInput::from_bytes(bytes, name)?;
        info!("Starting reconstruction from bytes: {}", resolved.name);
        self.run(resolved).await
    }

    /// Reconstruct and write the Markdown to a file.
    ///
    /// Uses an atomic write (temp file + rename) to prevent partial files.
    pub async fn reconstruct_to_file(
        &self,
        input_str: impl AsRef<str>,
        output_path: impl AsRef<Path>,
    ) -> Result<ReconstructionOutput, PageloomError> {
        let output = self.reconstruct(input_str).await?;
        let path = output_path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    PageloomError::OutputWriteFailed {
                        path: path.to_path_buf(),
                        source: e,
                    }
                })?;
            }
        }

        let tmp_path = path.with_extension("md.tmp");
        tokio::fs::write(&tmp_path, &output.markdown)
            .await
            .map_err(|e| PageloomError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| PageloomError::OutputWriteFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(output)
    }

    /// Synthesize speech for `text` in the given voice.
    ///
    /// Changing the voice is a context switch: the current worker is asked
    /// to release its resources and is torn down, and the next job starts
    /// a fresh one. Calls are serialized on the voice lock, so callers can
    /// share one `Pageloom` across a job queue.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &str,
    ) -> Result<SynthesisResult, PageloomError> {
        let mut last = self.last_voice.lock().await;
        match last.as_deref() {
            Some(prev) if prev != voice => {
                info!("Voice changed from {} to {}; recycling worker context", prev, voice);
                self.gateway.retire().await;
            }
            _ => {}
        }
        *last = Some(voice.to_string());

        let reply = self
            .gateway
            .synthesize(text.to_string(), voice.to_string())
            .await?;
        let audio = self.gateway.payloads().fetch(&reply.audio).await?;
        self.gateway.payloads().schedule_cleanup(&reply.audio);
        Ok(SynthesisResult {
            audio,
            duration_ms: reply.duration_ms,
        })
    }

    /// Release worker resources and terminate the worker context.
    ///
    /// The engine stays usable; the next job simply starts a fresh worker.
    pub async fn shutdown(&self) {
        self.gateway.retire().await;
    }

    async fn run(&self, source: SourceInput) -> Result<ReconstructionOutput, PageloomError> {
        let total_start = Instant::now();
        let title_fallback = source.title_fallback();

        // ── Step 1: Store the source where the worker can reach it ───────
        let payload = self.gateway.payloads().store(&source.bytes).await?;

        // ── Step 2: Inspect geometry ─────────────────────────────────────
        let inspection = self.gateway.inspect_source(payload.clone()).await?;
        render::validate_geometry(&inspection)?;
        let total_pages = inspection.page_count;
        info!("Source has {} pages", total_pages);

        if let Some(ref hook) = self.config.progress {
            hook.on_reconstruction_start(total_pages);
        }

        // ── Step 3: Rasterise pages ──────────────────────────────────────
        let render_start = Instant::now();
        let images = render::render_all(&self.gateway, &payload, &inspection).await?;
        let render_duration_ms = render_start.elapsed().as_millis() as u64;
        info!(
            "Rendered {}/{} pages in {}ms",
            images.iter().flatten().count(),
            total_pages,
            render_duration_ms
        );

        // ── Step 4: Page loop — one conversation, strictly in order ──────
        let system = self
            .config
            .system_prompt
            .as_deref()
            .unwrap_or(prompts::DEFAULT_SYSTEM_PROMPT);
        let mut search = MetadataSearch::new(Some(title_fallback));
        let mut log = TranscriptLog::new();
        let mut pages: Vec<PageOutcome> = Vec::with_capacity(total_pages);
        let mut skipped = 0usize;
        let model_start = Instant::now();

        for (index, slot) in images.into_iter().enumerate() {
            let page_number = index + 1;

            if self.config.cancel.is_cancelled() {
                warn!("Reconstruction cancelled at page {}", page_number);
                return Err(PageloomError::Cancelled);
            }

            let Some(image) = slot else {
                warn!("Page {} has no image, skipping", page_number);
                skipped += 1;
                let error = PageError::RenderFailed {
                    page: page_number,
                    detail: "No image produced".to_string(),
                };
                if let Some(ref hook) = self.config.progress {
                    hook.on_page_error(page_number, total_pages, &error.to_string());
                }
                pages.push(PageOutcome::failed(page_number, 0, error));
                continue;
            };

            if let Some(ref hook) = self.config.progress {
                hook.on_page_start(page_number, total_pages);
            }
            let page_start = Instant::now();

            let image_data = match encode::encode_page(&image) {
                Ok(data) => data,
                Err(e) => {
                    let error = PageError::RenderFailed {
                        page: page_number,
                        detail: format!("Image encoding failed: {}", e),
                    };
                    warn!("{}", error);
                    if let Some(ref hook) = self.config.progress {
                        hook.on_page_error(page_number, total_pages, &error.to_string());
                    }
                    pages.push(PageOutcome::failed(page_number, 0, error));
                    continue;
                }
            };

            let want_metadata = search.is_active();
            let instruction = if page_number == 1 {
                prompts::first_page_instruction()
            } else {
                prompts::continuation_instruction(page_number, want_metadata)
            };
            let user_turn = ChatMessage::user_with_images(instruction.as_str(), vec![image_data]);

            match model::exchange_page(
                &self.client,
                system,
                &log,
                user_turn.clone(),
                page_number,
                &self.config.page_retry_delays,
                &self.config.cancel,
            )
            .await
            {
                Ok(exchange) => {
                    log = log.with_exchange(user_turn, &exchange.parsed.text);
                    if want_metadata {
                        search.observe(exchange.parsed.metadata.as_ref());
                    }
                    let outcome = PageOutcome {
                        page_number,
                        text: exchange.parsed.text,
                        merge_hint: exchange.parsed.merge_hint,
                        metadata_candidate: exchange.parsed.metadata,
                        retries: exchange.retries,
                        duration_ms: page_start.elapsed().as_millis() as u64,
                        input_tokens: exchange.input_tokens,
                        output_tokens: exchange.output_tokens,
                        error: None,
                    };
                    if let Some(ref hook) = self.config.progress {
                        hook.on_page_complete(page_number, total_pages, outcome.text.len());
                    }
                    pages.push(outcome);
                }
                Err(ExchangeError::Cancelled) => {
                    warn!("Reconstruction cancelled during page {}", page_number);
                    return Err(PageloomError::Cancelled);
                }
                Err(ExchangeError::Exhausted(error)) => {
                    warn!("Page {} abandoned: {}", page_number, error);
                    if let Some(ref hook) = self.config.progress {
                        hook.on_page_error(page_number, total_pages, &error.to_string());
                    }
                    pages.push(PageOutcome::failed(
                        page_number,
                        self.config.max_page_retries(),
                        error,
                    ));
                }
            }
        }
        let model_duration_ms = model_start.elapsed().as_millis() as u64;

        // ── Step 5: Require at least one page ────────────────────────────
        let processed = pages.iter().filter(|p| p.error.is_none()).count();
        let failed = pages
            .iter()
            .filter(|p| p.error.is_some())
            .count()
            .saturating_sub(skipped);

        if processed == 0 {
            let first_error = pages
                .iter()
                .find_map(|p| p.error.as_ref())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(PageloomError::AllPagesFailed {
                total: pages.len(),
                retries: self.config.max_page_retries() as u32,
                first_error,
            });
        }

        // ── Step 6: Reassemble ───────────────────────────────────────────
        let mut metadata = search.into_metadata();
        let combined = assemble::combine(&pages);
        let body = assemble::reconcile_title(&mut metadata, combined);
        let elements = assemble::parse_elements(&body);
        let markdown = assemble::render_markdown(&metadata, &body);

        // ── Step 7: Stats and settle ─────────────────────────────────────
        let stats = ReconstructionStats {
            total_pages,
            processed_pages: processed,
            failed_pages: failed,
            skipped_pages: skipped,
            total_input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
            total_output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
            total_retries: pages.iter().map(|p| u64::from(p.retries)).sum(),
            total_duration_ms: total_start.elapsed().as_millis() as u64,
            render_duration_ms,
            model_duration_ms,
        };

        if failed + skipped > 0 {
            warn!(
                "Reconstruction is partial: {} failed, {} skipped of {} pages",
                failed, skipped, total_pages
            );
        }
        info!(
            "Reconstruction complete: {}/{} pages, {}ms total",
            processed, total_pages, stats.total_duration_ms
        );
        if let Some(ref hook) = self.config.progress {
            hook.on_reconstruction_complete(total_pages, processed);
        }

        self.gateway.payloads().schedule_cleanup(&payload);

        Ok(ReconstructionOutput {
            document: ReconstructedDocument { metadata, elements },
            markdown,
            pages,
            stats,
        })
    }
}

/// Reconstruct a document in one shot.
///
/// Builds an engine, runs the document, and retires the worker before
/// returning. Use [`Pageloom`] directly to amortise worker startup across
/// multiple documents.
///
/// # Example
/// ```rust,no_run
/// use pageloom::{reconstruct, ReconstructionConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ReconstructionConfig::default();
/// let output = reconstruct("document.pdf", &config).await?;
/// println!("{}", output.markdown);
/// # Ok(())
/// # }
/// ```
pub async fn reconstruct(
    input_str: impl AsRef<str>,
    config: &ReconstructionConfig,
) -> Result<ReconstructionOutput, PageloomError> {
    let engine = Pageloom::new(config.clone())?;
    let result = engine.reconstruct(input_str).await;
    engine.shutdown().await;
    result
}

/// Inspect a document's geometry without any model involvement.
///
/// Does not require an API key; only the worker is spawned, and it is
/// retired before returning.
pub async fn inspect(
    input_str: impl AsRef<str>,
    config: &ReconstructionConfig,
) -> Result<InspectReply, PageloomError> {
    let resolved = input::resolve_input(input_str.as_ref(), config.download_timeout_secs).await?;
    let gateway = WorkerGateway::new(config);
    let payload = gateway.payloads().store(&resolved.bytes).await?;
    let inspection = gateway.inspect_source(payload.clone()).await;
    gateway.payloads().schedule_cleanup(&payload);
    gateway.retire().await;
    inspection
}
