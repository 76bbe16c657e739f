//! Page rasterisation through the worker context.
//!
//! ## Why batch first, sequential second?
//!
//! The batch job loads the source once and rasterises every page in a
//! single pass, which is far cheaper than re-loading per page. But one bad
//! page can sink a whole batch on some sources, so when the batch call
//! fails the renderer degrades to one `render_page` job per page and
//! tolerates individual failures. Either way the result is a fixed-size
//! array indexed by `page_number - 1`: whatever order the worker produced
//! pages in, the orchestrator sees them in page order, and a missing page
//! is an explicit `None` rather than a shifted index.
//!
//! Geometry is a hard precondition. Every capture needs the page box (and
//! the chrome offsets to exclude); without it the worker would capture
//! viewer furniture into every single page, so the whole operation aborts
//! before any page work starts.

use tracing::{debug, warn};

use crate::error::PageloomError;
use crate::worker::gateway::WorkerGateway;
use crate::worker::job::{InspectReply, RenderedPage};
use crate::worker::payload::PayloadRef;

/// One rasterised page, decoded and validated.
///
/// Produced once, consumed once by the orchestrator, never mutated.
pub struct PageImage {
    /// 1-indexed page number.
    pub page_number: usize,
    pub width: u32,
    pub height: u32,
    /// Raw pixels, exactly `width * height * 4` bytes.
    pub rgba: Vec<u8>,
}

/// Abort-before-work check on inspected geometry.
pub fn validate_geometry(geometry: &InspectReply) -> Result<(), PageloomError> {
    if geometry.page_count == 0 {
        return Err(PageloomError::InvalidGeometry {
            detail: "source reports zero pages".to_string(),
        });
    }
    if geometry.boxes.len() != geometry.page_count {
        return Err(PageloomError::InvalidGeometry {
            detail: format!(
                "{} pages but {} page boxes",
                geometry.page_count,
                geometry.boxes.len()
            ),
        });
    }
    for (i, b) in geometry.boxes.iter().enumerate() {
        if b.is_degenerate() {
            return Err(PageloomError::InvalidGeometry {
                detail: format!("page {} has a degenerate box {}x{}", i + 1, b.width, b.height),
            });
        }
    }
    Ok(())
}

/// Rasterise every page of the source.
///
/// Returns one slot per page; `None` marks a render failure for that page
/// (the orchestrator records it and moves on). Only geometry problems and
/// worker setup failures abort the whole call.
pub async fn render_all(
    gateway: &WorkerGateway,
    source: &PayloadRef,
    geometry: &InspectReply,
) -> Result<Vec<Option<PageImage>>, PageloomError> {
    validate_geometry(geometry)?;

    let mut slots: Vec<Option<PageImage>> = (0..geometry.page_count).map(|_| None).collect();

    match gateway
        .render_batch(source.clone(), geometry.boxes.clone(), geometry.hints)
        .await
    {
        Ok(reply) => {
            for page in reply.pages {
                settle_page(gateway, &mut slots, page).await;
            }
        }
        Err(e) if is_setup_failure(&e) => return Err(e),
        Err(e) => {
            warn!("batch render failed, falling back to per-page: {e}");
            for page_number in 1..=geometry.page_count {
                let bounds = geometry.boxes[page_number - 1];
                match gateway
                    .render_page(source.clone(), page_number, bounds, geometry.hints)
                    .await
                {
                    Ok(reply) => {
                        for page in reply.pages {
                            settle_page(gateway, &mut slots, page).await;
                        }
                    }
                    Err(e) if is_setup_failure(&e) => return Err(e),
                    Err(e) => warn!(page_number, "page render failed: {e}"),
                }
            }
        }
    }

    let rendered = slots.iter().filter(|s| s.is_some()).count();
    debug!(rendered, total = geometry.page_count, "rendering finished");
    Ok(slots)
}

/// A no-worker condition is terminal for the whole document; falling back
/// to per-page calls would just fail the same way N more times.
fn is_setup_failure(e: &PageloomError) -> bool {
    matches!(
        e,
        PageloomError::WorkerSetup { .. } | PageloomError::WorkerNotFound { .. }
    )
}

/// Decode one rendered page into its slot, dropping it on any mismatch.
async fn settle_page(gateway: &WorkerGateway, slots: &mut [Option<PageImage>], page: RenderedPage) {
    let Some(slot) = page.page_number.checked_sub(1).and_then(|i| slots.get_mut(i)) else {
        warn!(
            page = page.page_number,
            total = slots.len(),
            "worker rendered a page outside the document"
        );
        return;
    };

    let rgba = match gateway.payloads().fetch(&page.image).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(page = page.page_number, "rendered pixels unavailable: {e}");
            return;
        }
    };
    gateway.payloads().schedule_cleanup(&page.image);

    let expected = page.width as usize * page.height as usize * 4;
    if rgba.len() != expected {
        warn!(
            page = page.page_number,
            got = rgba.len(),
            expected,
            "rendered pixel buffer has the wrong size"
        );
        return;
    }

    debug!(page = page.page_number, width = page.width, height = page.height, "page rendered");
    *slot = Some(PageImage {
        page_number: page.page_number,
        width: page.width,
        height: page.height,
        rgba,
    });
}
