//! Opportunistic metadata accumulation across the first pages.
//!
//! Title, author and date usually live on page 1 or 2; scanning a whole
//! book for them wastes model calls. The search therefore runs only while
//! [`MetadataSearch::is_active`] holds: it stops as soon as all three
//! fields are discovered, after a fixed page ceiling, or after too many
//! consecutive pages reported nothing at all.
//!
//! Merging is first-wins with one exception: a *fallback* value (title
//! derived from the filename) counts as a placeholder and a discovered
//! candidate replaces it. Once a field is `Discovered` it never changes,
//! so a stray "About the author" page deep in the document cannot
//! overwrite the real front-matter.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::output::{DocumentMetadata, MetaValue, MetadataCandidate};

/// Stop searching after this many pages even if fields are still open.
pub const METADATA_PAGE_CEILING: usize = 8;

/// Stop searching after this many consecutive candidate-free pages.
pub const MAX_CONSECUTIVE_EMPTY: usize = 3;

/// Already in `YYYY`, `YYYY-MM` or `YYYY-MM-DD` form.
static NORMALIZED_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").expect("valid regex"));

/// A plausible 4-digit year inside free-form text.
static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(1\d{3}|2\d{3})\b").expect("valid regex"));

/// Normalise a date candidate.
///
/// Keeps `YYYY`, `YYYY-MM`, `YYYY-MM-DD` as-is, extracts a 4-digit year
/// out of anything else ("March 5, 2021" → "2021"), and falls back to the
/// raw trimmed text when no year is found.
pub fn normalise_date(raw: &str) -> String {
    let trimmed = raw.trim();
    if NORMALIZED_DATE.is_match(trimmed) {
        return trimmed.to_string();
    }
    if let Some(year) = YEAR.find(trimmed) {
        return year.as_str().to_string();
    }
    trimmed.to_string()
}

fn fill(slot: &mut MetaValue, candidate: Option<&str>) {
    if slot.is_set() {
        return;
    }
    if let Some(v) = candidate {
        let v = v.trim();
        if !v.is_empty() {
            *slot = MetaValue::Discovered(v.to_string());
        }
    }
}

/// Merge one page's candidate into the accumulated metadata.
///
/// Pure: fields already `Discovered` are left alone, open fields (missing
/// or fallback) take the candidate's value, dates are normalised on entry.
pub fn merge_candidate(
    mut current: DocumentMetadata,
    candidate: &MetadataCandidate,
) -> DocumentMetadata {
    fill(&mut current.title, candidate.title.as_deref());
    fill(&mut current.author, candidate.author.as_deref());
    let date = candidate.date.as_deref().map(normalise_date);
    fill(&mut current.date, date.as_deref());
    current
}

/// Tracks the metadata search window across the page loop.
#[derive(Debug)]
pub struct MetadataSearch {
    metadata: DocumentMetadata,
    pages_seen: usize,
    consecutive_empty: usize,
}

impl MetadataSearch {
    /// Start a search, optionally seeding the title with a filename-derived
    /// placeholder.
    pub fn new(title_fallback: Option<String>) -> Self {
        let mut metadata = DocumentMetadata::default();
        if let Some(fallback) = title_fallback.filter(|s| !s.trim().is_empty()) {
            metadata.title = MetaValue::Fallback(fallback);
        }
        MetadataSearch {
            metadata,
            pages_seen: 0,
            consecutive_empty: 0,
        }
    }

    /// Whether the orchestrator should still ask pages for metadata.
    pub fn is_active(&self) -> bool {
        !self.metadata.is_complete()
            && self.pages_seen < METADATA_PAGE_CEILING
            && self.consecutive_empty < MAX_CONSECUTIVE_EMPTY
    }

    /// Record what one successfully processed page reported.
    pub fn observe(&mut self, candidate: Option<&MetadataCandidate>) {
        self.pages_seen += 1;
        match candidate {
            Some(c) if !c.is_empty() => {
                self.consecutive_empty = 0;
                self.metadata = merge_candidate(std::mem::take(&mut self.metadata), c);
            }
            _ => self.consecutive_empty += 1,
        }
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn into_metadata(self) -> DocumentMetadata {
        self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: Option<&str>, author: Option<&str>, date: Option<&str>) -> MetadataCandidate {
        MetadataCandidate {
            title: title.map(String::from),
            author: author.map(String::from),
            date: date.map(String::from),
        }
    }

    #[test]
    fn first_discovery_wins() {
        let m = merge_candidate(
            DocumentMetadata::default(),
            &candidate(Some("Title A"), None, None),
        );
        let m = merge_candidate(m, &candidate(Some("Title B"), Some("Author"), None));
        assert_eq!(m.title, MetaValue::Discovered("Title A".into()));
        assert_eq!(m.author, MetaValue::Discovered("Author".into()));
    }

    #[test]
    fn discovery_replaces_filename_fallback() {
        let mut search = MetadataSearch::new(Some("report-final-v2".into()));
        assert_eq!(
            search.metadata().title,
            MetaValue::Fallback("report-final-v2".into())
        );
        search.observe(Some(&candidate(Some("The Real Title"), None, None)));
        assert_eq!(
            search.metadata().title,
            MetaValue::Discovered("The Real Title".into())
        );
    }

    #[test]
    fn blank_candidates_do_not_claim_a_slot() {
        let m = merge_candidate(
            DocumentMetadata::default(),
            &candidate(Some("   "), None, None),
        );
        assert_eq!(m.title, MetaValue::Missing);
        // a later real value still lands
        let m = merge_candidate(m, &candidate(Some("Title"), None, None));
        assert!(m.title.is_discovered());
    }

    #[test]
    fn date_normalisation() {
        assert_eq!(normalise_date("2021"), "2021");
        assert_eq!(normalise_date("2021-03"), "2021-03");
        assert_eq!(normalise_date("2021-03-05"), "2021-03-05");
        assert_eq!(normalise_date("March 5, 2021"), "2021");
        assert_eq!(normalise_date("© 1998 Example Press"), "1998");
        assert_eq!(normalise_date("Spring issue"), "Spring issue");
    }

    #[test]
    fn search_stops_when_complete() {
        let mut search = MetadataSearch::new(None);
        assert!(search.is_active());
        search.observe(Some(&candidate(Some("T"), Some("A"), Some("2020"))));
        assert!(!search.is_active());
    }

    #[test]
    fn search_stops_after_consecutive_empty_pages() {
        let mut search = MetadataSearch::new(None);
        search.observe(Some(&candidate(Some("T"), None, None)));
        for _ in 0..MAX_CONSECUTIVE_EMPTY {
            assert!(search.is_active());
            search.observe(None);
        }
        assert!(!search.is_active());
        // the discovered title survives the stop
        assert!(search.metadata().title.is_discovered());
    }

    #[test]
    fn one_hit_resets_the_empty_counter() {
        let mut search = MetadataSearch::new(None);
        search.observe(None);
        search.observe(None);
        search.observe(Some(&candidate(None, Some("A"), None)));
        search.observe(None);
        search.observe(None);
        assert!(search.is_active(), "counter should have reset on the hit");
    }

    #[test]
    fn search_stops_at_the_page_ceiling() {
        let mut search = MetadataSearch::new(None);
        for i in 0..METADATA_PAGE_CEILING {
            assert!(search.is_active(), "inactive after {i} pages");
            // author-only hits keep the empty counter at zero without
            // ever completing all three fields
            search.observe(Some(&candidate(None, Some("A"), None)));
        }
        assert!(!search.is_active());
    }
}
