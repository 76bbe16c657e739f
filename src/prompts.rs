//! Prompts for conversational page reconstruction.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — the JSON reply contract lives in one
//!    place, so the parser in [`crate::pipeline::model`] and the prompt
//!    can never drift apart silently.
//!
//! 2. **Testability** — unit tests can import and inspect prompts directly
//!    without spinning up a real model, making prompt regressions easy to
//!    catch.
//!
//! Callers can override the default via
//! [`crate::config::ReconstructionConfig::system_prompt`]; the constants
//! here are used only when no override is provided.

/// Default system prompt for reconstructing a page image.
///
/// Demands a single JSON object per page so the orchestrator can parse
/// the text, the merge hint and any metadata in one pass.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert document reconstruction engine. You receive one page image per turn, in order, and you reply with a single JSON object and nothing else:

{"text": "...", "merge_hint": "...", "metadata": {"title": "...", "author": "...", "date": "..."}}

Follow these rules precisely:

1. TEXT
   - Transcribe ALL page content into clean Markdown, in reading order
   - Use # for the page's main title only, ## and ### for sections
   - Use - for unordered lists, 1. 2. 3. for ordered lists
   - Convert tables to GFM pipe format with a header row
   - Ignore page numbers, repeated headers/footers, and decorative rules

2. MERGE HINT
   How does this page's text attach to the previous page's text?
   - "direct": it begins mid-sentence or mid-word (join with a space)
   - "newline": it continues the same paragraph, list, or table
   - "paragraph": it starts fresh content (the default)

3. METADATA
   - Include the "metadata" object only when the instruction asks for it
   - Report title, author, and date exactly as printed on the page
   - Omit any field you cannot actually see; NEVER guess or invent

4. OUTPUT FORMAT
   - Reply with ONE valid JSON object, nothing before or after it
   - Do NOT wrap the object in ```json fences
   - Escape newlines inside "text" as \n
   - Earlier pages of this conversation show your prior replies; keep
     numbering, heading levels, and running sentences consistent with them"#;

/// User-turn text for the opening page.
///
/// The first page gets distinct framing: there is no previous page to
/// attach to, and the front matter is where metadata lives.
pub fn first_page_instruction() -> String {
    "This is page 1, the first page of the document. Reconstruct it. \
     There is no previous page, so merge_hint must be \"paragraph\". \
     Include the \"metadata\" object with any title, author, or date \
     printed on this page."
        .to_string()
}

/// User-turn text for every page after the first.
///
/// `request_metadata` is set while the metadata search window is still
/// open; afterwards the model is explicitly told to stop reporting it.
pub fn continuation_instruction(page_number: usize, request_metadata: bool) -> String {
    let metadata_clause = if request_metadata {
        "Include the \"metadata\" object with any title, author, or date printed on this page."
    } else {
        "Omit the \"metadata\" object."
    };
    format!(
        "This is page {page_number}, continuing the same document. \
         Reconstruct it and choose merge_hint by how its text attaches \
         to the previous page. {metadata_clause}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_prompt_states_the_json_contract() {
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"merge_hint\""));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("\"metadata\""));
        assert!(DEFAULT_SYSTEM_PROMPT.contains("ONE valid JSON object"));
    }

    #[test]
    fn first_page_framing_pins_the_hint() {
        let text = first_page_instruction();
        assert!(text.contains("page 1"));
        assert!(text.contains("\"paragraph\""));
    }

    #[test]
    fn continuation_framing_gates_metadata() {
        let asking = continuation_instruction(4, true);
        assert!(asking.contains("page 4"));
        assert!(asking.contains("Include the \"metadata\""));

        let done = continuation_instruction(9, false);
        assert!(done.contains("Omit the \"metadata\""));
    }
}
