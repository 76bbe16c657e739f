//! Reassembly of per-page fragments into the final document.
//!
//! ## Why merge hints?
//!
//! A page boundary is a printing artefact, not a semantic one: a sentence,
//! a paragraph, even a word can run across it. The model sees the page and
//! tells us how its fragment attaches to the previous one (`direct`,
//! `newline` or `paragraph`), and [`combine`] joins fragments accordingly
//! instead of blindly inserting blank lines.
//!
//! ## Title reconciliation
//!
//! The first page usually repeats the document title as a big heading. When
//! metadata discovery already found the title, keeping that heading would
//! duplicate it in every downstream rendering, so [`reconcile_title`]
//! removes the one heading that fuzzily matches. When discovery found
//! nothing, the first top-level heading is promoted into the title instead,
//! unless it looks like a filename that leaked out of the source.
//!
//! The reconciled body is finally parsed by a line-oriented scanner into
//! typed [`ContentElement`]s for the downstream encoder.

use crate::output::{ContentElement, DocumentMetadata, MetaValue, PageOutcome};
use tracing::debug;

// ── Fragment combination ─────────────────────────────────────────────────

/// Join per-page fragments in page order, honouring each fragment's hint.
///
/// Failed and empty pages are skipped; the hint of each *incoming*
/// fragment decides how it attaches to everything before it. Fragments
/// are trimmed so the separator alone controls the join.
pub fn combine(pages: &[PageOutcome]) -> String {
    let mut ordered: Vec<&PageOutcome> = pages
        .iter()
        .filter(|p| p.error.is_none() && !p.text.trim().is_empty())
        .collect();
    ordered.sort_by_key(|p| p.page_number);

    let mut combined = String::new();
    for page in ordered {
        if !combined.is_empty() {
            combined.push_str(page.merge_hint.separator());
        }
        combined.push_str(page.text.trim());
    }
    combined
}

// ── Title reconciliation ─────────────────────────────────────────────────

/// Bidirectional substring match with an 80% length-overlap floor.
///
/// "Deep Learning" matches "# Deep Learning!" but not "# Introduction";
/// a heading that merely *contains* the title as a small part of a much
/// longer line does not count as a duplicate.
fn title_matches(heading: &str, title: &str) -> bool {
    let h = heading.trim().to_lowercase();
    let t = title.trim().to_lowercase();
    if h.is_empty() || t.is_empty() {
        return false;
    }
    let (short, long) = if h.len() <= t.len() { (&h, &t) } else { (&t, &h) };
    long.contains(short.as_str()) && short.len() * 100 >= long.len() * 80
}

/// Parse an ATX heading line into (level, text).
fn parse_heading(line: &str) -> Option<(u8, &str)> {
    let trimmed = line.trim_start();
    let hashes = trimmed.bytes().take_while(|&b| b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &trimmed[hashes..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        // "#hashtag" style, not a heading
        return None;
    }
    let text = rest.trim();
    if text.is_empty() {
        return None;
    }
    Some((hashes as u8, text))
}

/// Heuristic for headings that are really a leaked source filename,
/// e.g. "report_final_v2" or "scan-2021-03".
fn looks_like_filename(text: &str) -> bool {
    let t = text.trim();
    if let Some((_, ext)) = t.rsplit_once('.') {
        let alnum = ext.chars().all(|c| c.is_ascii_alphanumeric());
        let digits = ext.chars().all(|c| c.is_ascii_digit());
        if (2..=4).contains(&ext.len()) && alnum && !digits {
            return true;
        }
    }
    !t.contains(' ') && (t.contains('_') || t.chars().any(|c| c.is_ascii_digit()))
}

fn strip_matching_heading(combined: &str, title: &str) -> Option<String> {
    let mut removed = false;
    let mut kept: Vec<&str> = Vec::new();
    for line in combined.lines() {
        if !removed {
            if let Some((1, text)) = parse_heading(line) {
                if title_matches(text, title) {
                    debug!("Removed duplicate title heading: {}", text);
                    removed = true;
                    continue;
                }
            }
        }
        kept.push(line);
    }
    removed.then(|| kept.join("\n").trim().to_string())
}

fn promote_first_heading(combined: &str) -> Option<(String, String)> {
    let mut title: Option<String> = None;
    let mut kept: Vec<&str> = Vec::new();
    for line in combined.lines() {
        if title.is_none() {
            if let Some((1, text)) = parse_heading(line) {
                if looks_like_filename(text) {
                    // not a real title, keep the heading where it is
                    return None;
                }
                title = Some(text.to_string());
                continue;
            }
        }
        kept.push(line);
    }
    title.map(|t| (t, kept.join("\n").trim().to_string()))
}

/// Remove a duplicated title heading, or promote one into the title.
///
/// With a discovered title: the first top-level heading that fuzzily
/// matches it (80% bidirectional overlap) is removed, exactly once.
/// Without one: the first top-level heading becomes the document title
/// and is stripped from the body, unless it looks filename-like.
pub fn reconcile_title(metadata: &mut DocumentMetadata, combined: String) -> String {
    match metadata.title.clone() {
        MetaValue::Discovered(title) => {
            strip_matching_heading(&combined, &title).unwrap_or(combined)
        }
        _ => match promote_first_heading(&combined) {
            Some((title, body)) => {
                debug!("Promoted heading to document title: {}", title);
                metadata.title = MetaValue::Discovered(title);
                body
            }
            None => combined,
        },
    }
}

/// Render the document as standalone Markdown, title heading included.
pub fn render_markdown(metadata: &DocumentMetadata, body: &str) -> String {
    match &metadata.title {
        MetaValue::Discovered(title) => format!("# {}\n\n{}\n", title, body.trim_end()),
        _ => format!("{}\n", body.trim_end()),
    }
}

// ── Line scanner ─────────────────────────────────────────────────────────

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

/// A separator row contains only `|`, `-`, `:` and spaces, with at least
/// one dash.
fn is_separator_line(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|')
        && t.contains('-')
        && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

fn parse_list_item(line: &str) -> Option<(bool, String)> {
    let t = line.trim_start();
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = t.strip_prefix(marker) {
            return Some((false, rest.trim().to_string()));
        }
    }
    let digits = t.bytes().take_while(u8::is_ascii_digit).count();
    if digits > 0 {
        let rest = &t[digits..];
        if let Some(body) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some((true, body.trim().to_string()));
        }
    }
    None
}

fn flush_paragraph(paragraph: &mut Vec<&str>, elements: &mut Vec<ContentElement>) {
    if !paragraph.is_empty() {
        elements.push(ContentElement::Paragraph {
            text: paragraph.join(" "),
        });
        paragraph.clear();
    }
}

fn flush_list(items: &mut Vec<String>, ordered: bool, elements: &mut Vec<ContentElement>) {
    if !items.is_empty() {
        elements.push(ContentElement::List {
            ordered,
            items: std::mem::take(items),
        });
    }
}

fn scan_table(lines: &[&str]) -> (Option<ContentElement>, usize) {
    let mut consumed = 0;
    let mut rows: Vec<Vec<String>> = Vec::new();
    for line in lines {
        if !is_table_line(line) {
            break;
        }
        consumed += 1;
        if is_separator_line(line) {
            continue;
        }
        rows.push(split_cells(line));
    }
    if rows.is_empty() {
        return (None, consumed);
    }
    let headers = rows.remove(0);
    (Some(ContentElement::Table { headers, rows }), consumed)
}

/// Parse reconciled Markdown into typed content elements.
///
/// A single pass over the lines: `#` prefixes become headings, contiguous
/// `|` lines become one table (first row as header, separator rows
/// discarded), list runs become one list per marker style, and everything
/// else accumulates into a paragraph that flushes on a blank line or when
/// a different element type begins.
pub fn parse_elements(markdown: &str) -> Vec<ContentElement> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut elements: Vec<ContentElement> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut list_items: Vec<String> = Vec::new();
    let mut list_ordered = false;

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];

        if line.trim().is_empty() {
            flush_paragraph(&mut paragraph, &mut elements);
            flush_list(&mut list_items, list_ordered, &mut elements);
            i += 1;
            continue;
        }

        if let Some((level, text)) = parse_heading(line) {
            flush_paragraph(&mut paragraph, &mut elements);
            flush_list(&mut list_items, list_ordered, &mut elements);
            elements.push(ContentElement::Heading {
                level,
                text: text.to_string(),
            });
            i += 1;
            continue;
        }

        if is_table_line(line) {
            flush_paragraph(&mut paragraph, &mut elements);
            flush_list(&mut list_items, list_ordered, &mut elements);
            let (table, consumed) = scan_table(&lines[i..]);
            if let Some(t) = table {
                elements.push(t);
            }
            i += consumed;
            continue;
        }

        if let Some((ordered, item)) = parse_list_item(line) {
            flush_paragraph(&mut paragraph, &mut elements);
            if !list_items.is_empty() && ordered != list_ordered {
                flush_list(&mut list_items, list_ordered, &mut elements);
            }
            list_ordered = ordered;
            list_items.push(item);
            i += 1;
            continue;
        }

        flush_list(&mut list_items, list_ordered, &mut elements);
        paragraph.push(line.trim());
        i += 1;
    }

    flush_paragraph(&mut paragraph, &mut elements);
    flush_list(&mut list_items, list_ordered, &mut elements);
    elements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PageError;
    use crate::output::MergeHint;

    fn page(number: usize, text: &str, hint: MergeHint) -> PageOutcome {
        PageOutcome {
            page_number: number,
            text: text.to_string(),
            merge_hint: hint,
            metadata_candidate: None,
            retries: 0,
            duration_ms: 0,
            input_tokens: 0,
            output_tokens: 0,
            error: None,
        }
    }

    #[test]
    fn combine_orders_by_page_number() {
        let pages = vec![
            page(3, "third", MergeHint::Paragraph),
            page(1, "first", MergeHint::Paragraph),
            page(2, "second", MergeHint::Paragraph),
        ];
        assert_eq!(combine(&pages), "first\n\nsecond\n\nthird");
    }

    #[test]
    fn combine_honours_each_fragments_hint() {
        let pages = vec![
            page(1, "hyphen-", MergeHint::Paragraph),
            page(2, "ated", MergeHint::Direct),
            page(3, "same paragraph", MergeHint::Newline),
            page(4, "new paragraph", MergeHint::Paragraph),
        ];
        assert_eq!(
            combine(&pages),
            "hyphen- ated\nsame paragraph\n\nnew paragraph"
        );
    }

    #[test]
    fn combine_skips_failed_and_empty_pages() {
        let mut failed = PageOutcome::failed(
            2,
            4,
            PageError::ModelFailed {
                page: 2,
                retries: 4,
                detail: "went away".into(),
            },
        );
        failed.text = "should never appear".into();
        let pages = vec![
            page(1, "Intro", MergeHint::Paragraph),
            failed,
            page(3, "Conclusion", MergeHint::Paragraph),
            page(4, "   ", MergeHint::Paragraph),
        ];
        assert_eq!(combine(&pages), "Intro\n\nConclusion");
    }

    #[test]
    fn title_match_is_fuzzy_and_bidirectional() {
        assert!(title_matches("Deep Learning", "Deep Learning"));
        assert!(title_matches("DEEP LEARNING!", "deep learning"));
        assert!(title_matches("Deep Learning", "Deep Learning!"));
        assert!(!title_matches("Introduction", "Deep Learning"));
        // containment alone is not enough below the 80% floor
        assert!(!title_matches(
            "Deep Learning",
            "Deep Learning and Its Many Applications in Modern Science"
        ));
    }

    #[test]
    fn discovered_title_removes_exactly_one_heading() {
        let mut metadata = DocumentMetadata {
            title: MetaValue::Discovered("Deep Learning".into()),
            ..Default::default()
        };
        let combined = "# Deep Learning\n\nBody text.\n\n# Deep Learning".to_string();
        let body = reconcile_title(&mut metadata, combined);
        assert_eq!(body, "Body text.\n\n# Deep Learning");
        assert_eq!(metadata.title, MetaValue::Discovered("Deep Learning".into()));
    }

    #[test]
    fn unmatched_title_leaves_body_alone() {
        let mut metadata = DocumentMetadata {
            title: MetaValue::Discovered("Annual Report".into()),
            ..Default::default()
        };
        let combined = "# Completely Different\n\nBody.".to_string();
        let body = reconcile_title(&mut metadata, combined.clone());
        assert_eq!(body, combined);
    }

    #[test]
    fn first_heading_is_promoted_when_no_title_found() {
        let mut metadata = DocumentMetadata::default();
        let combined = "# A Real Title\n\nFirst paragraph.".to_string();
        let body = reconcile_title(&mut metadata, combined);
        assert_eq!(metadata.title, MetaValue::Discovered("A Real Title".into()));
        assert_eq!(body, "First paragraph.");
    }

    #[test]
    fn filename_like_headings_are_not_promoted() {
        let mut metadata = DocumentMetadata {
            title: MetaValue::Fallback("report_final_v2".into()),
            ..Default::default()
        };
        let combined = "# report_final_v2\n\nBody.".to_string();
        let body = reconcile_title(&mut metadata, combined.clone());
        assert_eq!(body, combined);
        assert_eq!(metadata.title, MetaValue::Fallback("report_final_v2".into()));
    }

    #[test]
    fn render_markdown_prepends_discovered_titles_only() {
        let discovered = DocumentMetadata {
            title: MetaValue::Discovered("The Title".into()),
            ..Default::default()
        };
        assert_eq!(
            render_markdown(&discovered, "Body."),
            "# The Title\n\nBody.\n"
        );
        let fallback = DocumentMetadata {
            title: MetaValue::Fallback("some_file".into()),
            ..Default::default()
        };
        assert_eq!(render_markdown(&fallback, "Body."), "Body.\n");
    }

    #[test]
    fn scanner_recognises_headings_and_paragraphs() {
        let md = "## Section\n\nLine one\nline two.\n\nNext paragraph.";
        let elements = parse_elements(md);
        assert_eq!(
            elements,
            vec![
                ContentElement::Heading {
                    level: 2,
                    text: "Section".into()
                },
                ContentElement::Paragraph {
                    text: "Line one line two.".into()
                },
                ContentElement::Paragraph {
                    text: "Next paragraph.".into()
                },
            ]
        );
    }

    #[test]
    fn scanner_parses_tables_and_discards_separators() {
        let md = "| Name | Age |\n| --- | --- |\n| Ada | 36 |\n| Alan | 41 |";
        let elements = parse_elements(md);
        assert_eq!(
            elements,
            vec![ContentElement::Table {
                headers: vec!["Name".into(), "Age".into()],
                rows: vec![
                    vec!["Ada".into(), "36".into()],
                    vec!["Alan".into(), "41".into()],
                ],
            }]
        );
    }

    #[test]
    fn scanner_splits_list_runs_by_marker_style() {
        let md = "- alpha\n- beta\n1. one\n2) two\n\nTail.";
        let elements = parse_elements(md);
        assert_eq!(
            elements,
            vec![
                ContentElement::List {
                    ordered: false,
                    items: vec!["alpha".into(), "beta".into()],
                },
                ContentElement::List {
                    ordered: true,
                    items: vec!["one".into(), "two".into()],
                },
                ContentElement::Paragraph {
                    text: "Tail.".into()
                },
            ]
        );
    }

    #[test]
    fn scanner_flushes_paragraph_when_table_begins() {
        let md = "Before the table\n| A |\n| 1 |\nAfter the table";
        let elements = parse_elements(md);
        assert_eq!(elements.len(), 3);
        assert!(matches!(elements[0], ContentElement::Paragraph { .. }));
        assert!(matches!(elements[1], ContentElement::Table { .. }));
        assert!(matches!(elements[2], ContentElement::Paragraph { .. }));
    }

    #[test]
    fn heading_levels_follow_the_hash_count() {
        let elements = parse_elements("### Three\n###### Six\n####### Seven hashes");
        assert_eq!(
            elements[0],
            ContentElement::Heading {
                level: 3,
                text: "Three".into()
            }
        );
        assert_eq!(
            elements[1],
            ContentElement::Heading {
                level: 6,
                text: "Six".into()
            }
        );
        // beyond six hashes it is plain text
        assert!(matches!(elements[2], ContentElement::Paragraph { .. }));
    }
}
