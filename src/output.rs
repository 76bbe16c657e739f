//! Output types: reconstructed document, per-page outcomes, statistics.
//!
//! Everything the library hands back to callers lives here. The shape
//! mirrors how downstream encoders consume a reconstruction:
//!
//! * [`ReconstructionOutput`] — the top-level bundle: the typed
//!   [`ReconstructedDocument`], the flat Markdown string it was parsed
//!   from, the per-page [`PageOutcome`] records, and run statistics.
//! * [`ContentElement`] — the typed block list external encoders (PDF,
//!   EPUB, audio) iterate over. Serialized with a `type` tag so the list
//!   survives a JSON hop unambiguously.
//! * [`MetaValue`] — a tri-state metadata slot. The distinction between
//!   *fallback* (derived from a filename) and *discovered* (reported by
//!   the model from page content) drives the duplicate-title removal in
//!   the reassembler, so it is part of the type rather than a side flag.
//!
//! All types serialize with serde; [`PageOutcome`] keeps its error inline
//! so a JSON dump of a run is a complete post-mortem record.

use serde::{Deserialize, Serialize};

use crate::error::{PageError, PageloomError};

// ─── Content model ────────────────────────────────────────────────────────

/// One typed block of reconstructed document content.
///
/// Produced by the reassembler's line scanner and consumed by external
/// encoders. The order of elements is the reading order of the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentElement {
    /// A heading. `level` is 1..=6, matching the number of `#` markers.
    Heading { level: u8, text: String },
    /// A plain paragraph. Interior line breaks are preserved as spaces.
    Paragraph { text: String },
    /// An ordered or unordered list.
    List { ordered: bool, items: Vec<String> },
    /// A table. `headers` comes from the first `|` row; separator rows
    /// (`|---|---|`) are never stored.
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

/// How a page's text joins the text of the page before it.
///
/// Reported by the model per page. Unknown tags deserialize as
/// [`MergeHint::Paragraph`], which is also the default: a wrong guess at
/// worst inserts a harmless blank line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum MergeHint {
    /// The page starts mid-sentence; join with a single space so words
    /// split across a page boundary do not fuse.
    Direct,
    /// Same paragraph continues on a new line; join with `\n`.
    Newline,
    /// A fresh paragraph; join with a blank line.
    #[default]
    Paragraph,
}

impl MergeHint {
    /// Parse a model-reported tag, defaulting unknowns to `Paragraph`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "direct" => MergeHint::Direct,
            "newline" => MergeHint::Newline,
            _ => MergeHint::Paragraph,
        }
    }

    /// The literal separator inserted before a fragment carrying this hint.
    pub fn separator(self) -> &'static str {
        match self {
            MergeHint::Direct => " ",
            MergeHint::Newline => "\n",
            MergeHint::Paragraph => "\n\n",
        }
    }
}

impl From<String> for MergeHint {
    fn from(s: String) -> Self {
        MergeHint::from_tag(&s)
    }
}

// ─── Metadata ─────────────────────────────────────────────────────────────

/// A single metadata slot with provenance.
///
/// `Fallback` values (e.g. a title derived from the filename) count as
/// placeholders: a later `Discovered` candidate replaces them. `Discovered`
/// values are final; first discovery wins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum MetaValue {
    /// Nothing known yet.
    #[default]
    Missing,
    /// A placeholder derived heuristically, replaceable by discovery.
    Fallback(String),
    /// Reported by the model from actual page content. Final.
    Discovered(String),
}

impl MetaValue {
    /// The value, if any, regardless of provenance.
    pub fn get(&self) -> Option<&str> {
        match self {
            MetaValue::Missing => None,
            MetaValue::Fallback(s) | MetaValue::Discovered(s) => Some(s),
        }
    }

    /// True only for model-discovered values.
    pub fn is_discovered(&self) -> bool {
        matches!(self, MetaValue::Discovered(_))
    }

    /// True once the slot no longer accepts candidates.
    pub fn is_set(&self) -> bool {
        self.is_discovered()
    }
}

/// Document metadata accumulated opportunistically during reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: MetaValue,
    pub author: MetaValue,
    pub date: MetaValue,
}

impl DocumentMetadata {
    /// True once every field holds a discovered value and the search can
    /// stop early.
    pub fn is_complete(&self) -> bool {
        self.title.is_set() && self.author.is_set() && self.date.is_set()
    }
}

/// Raw metadata fields as reported by the model for one page.
///
/// All fields optional; a page deep inside a document usually reports none.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataCandidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl MetadataCandidate {
    /// True when the model reported nothing usable for this page.
    pub fn is_empty(&self) -> bool {
        fn blank(f: &Option<String>) -> bool {
            f.as_deref().map_or(true, |s| s.trim().is_empty())
        }
        blank(&self.title) && blank(&self.author) && blank(&self.date)
    }
}

// ─── Per-page and document results ────────────────────────────────────────

/// The outcome of reconstructing a single page.
///
/// Always produced, success or failure: a failed page carries `error`
/// and an empty `text`, so `pages.len()` equals the number of pages
/// attempted and nothing is silently dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 1-indexed page number.
    pub page_number: usize,
    /// Reconstructed text for this page (empty on failure).
    pub text: String,
    /// How `text` joins the previous page's text.
    pub merge_hint: MergeHint,
    /// Metadata the model reported for this page, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_candidate: Option<MetadataCandidate>,
    /// Retries consumed before this outcome settled.
    pub retries: u8,
    /// Wall-clock time spent on this page, including retries and backoff.
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Set when the page ultimately failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl PageOutcome {
    /// A terminal failure record for a page that never produced text.
    pub fn failed(page_number: usize, retries: u8, error: PageError) -> Self {
        PageOutcome {
            page_number,
            text: String::new(),
            merge_hint: MergeHint::default(),
            metadata_candidate: None,
            retries,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            error: Some(error),
        }
    }
}

/// The typed document handed to external encoders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedDocument {
    pub metadata: DocumentMetadata,
    pub elements: Vec<ContentElement>,
}

// ─── Statistics ───────────────────────────────────────────────────────────

/// Aggregate statistics for one reconstruction run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconstructionStats {
    /// Pages in the source document.
    pub total_pages: usize,
    /// Pages that produced usable text.
    pub processed_pages: usize,
    /// Pages that exhausted the retry ladder.
    pub failed_pages: usize,
    /// Pages for which the renderer produced no image at all.
    pub skipped_pages: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Retries consumed across all pages.
    pub total_retries: u64,
    pub total_duration_ms: u64,
    pub render_duration_ms: u64,
    pub model_duration_ms: u64,
}

// ─── Top-level output ─────────────────────────────────────────────────────

/// Everything a reconstruction run produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionOutput {
    /// The typed content list plus accumulated metadata.
    pub document: ReconstructedDocument,
    /// The flat Markdown the document was parsed from.
    pub markdown: String,
    /// One record per attempted page, ascending by page number.
    pub pages: Vec<PageOutcome>,
    pub stats: ReconstructionStats,
}

impl ReconstructionOutput {
    /// 1-indexed numbers of every page that ended in an error.
    pub fn failed_pages(&self) -> Vec<usize> {
        self.pages
            .iter()
            .filter(|p| p.error.is_some())
            .map(|p| p.page_number)
            .collect()
    }

    /// Treat any page failure as a hard error.
    ///
    /// `Ok(self)` when every attempted page succeeded, otherwise
    /// [`PageloomError::PartialFailure`].
    pub fn into_result(self) -> Result<Self, PageloomError> {
        let failed = self.pages.iter().filter(|p| p.error.is_some()).count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(PageloomError::PartialFailure {
                success: self.pages.len() - failed,
                failed,
                total: self.pages.len(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_hint_separators() {
        assert_eq!(MergeHint::Direct.separator(), " ");
        assert_eq!(MergeHint::Newline.separator(), "\n");
        assert_eq!(MergeHint::Paragraph.separator(), "\n\n");
    }

    #[test]
    fn merge_hint_unknown_deserializes_as_paragraph() {
        let h: MergeHint = serde_json::from_str("\"direct\"").unwrap();
        assert_eq!(h, MergeHint::Direct);
        let h: MergeHint = serde_json::from_str("\"sideways\"").unwrap();
        assert_eq!(h, MergeHint::Paragraph);
    }

    #[test]
    fn meta_value_accessors() {
        assert_eq!(MetaValue::Missing.get(), None);
        assert_eq!(MetaValue::Fallback("doc.pdf".into()).get(), Some("doc.pdf"));
        assert!(!MetaValue::Fallback("doc.pdf".into()).is_set());
        assert!(MetaValue::Discovered("Real Title".into()).is_set());
    }

    #[test]
    fn candidate_emptiness_ignores_whitespace() {
        let c = MetadataCandidate {
            title: Some("  ".into()),
            author: None,
            date: None,
        };
        assert!(c.is_empty());

        let c = MetadataCandidate {
            title: None,
            author: Some("A. Author".into()),
            date: None,
        };
        assert!(!c.is_empty());
    }

    #[test]
    fn content_element_serializes_with_type_tag() {
        let el = ContentElement::Heading {
            level: 2,
            text: "Results".into(),
        };
        let json = serde_json::to_value(&el).unwrap();
        assert_eq!(json["type"], "heading");
        assert_eq!(json["level"], 2);

        let el = ContentElement::Table {
            headers: vec!["a".into(), "b".into()],
            rows: vec![vec!["1".into(), "2".into()]],
        };
        let json = serde_json::to_value(&el).unwrap();
        assert_eq!(json["type"], "table");
    }

    #[test]
    fn into_result_flags_partial_failure() {
        let output = ReconstructionOutput {
            document: ReconstructedDocument {
                metadata: DocumentMetadata::default(),
                elements: vec![],
            },
            markdown: String::new(),
            pages: vec![
                PageOutcome {
                    page_number: 1,
                    text: "ok".into(),
                    merge_hint: MergeHint::Paragraph,
                    metadata_candidate: None,
                    retries: 0,
                    duration_ms: 10,
                    input_tokens: 5,
                    output_tokens: 5,
                    error: None,
                },
                PageOutcome::failed(
                    2,
                    4,
                    crate::error::PageError::ModelFailed {
                        page: 2,
                        retries: 4,
                        detail: "503".into(),
                    },
                ),
            ],
            stats: ReconstructionStats::default(),
        };

        assert_eq!(output.failed_pages(), vec![2]);
        let err = output.into_result().unwrap_err();
        assert!(err.to_string().contains("1/2"));
    }
}
