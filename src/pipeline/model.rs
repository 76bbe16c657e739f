//! Conversational model interaction for page reconstruction.
//!
//! Each page is one exchange in a running conversation: the user turn
//! carries the page image plus instructions, the assistant turn is the
//! text the model produced for it. Keeping the whole conversation in
//! every request lets the model carry numbering, heading levels and
//! running sentences across page boundaries.
//!
//! ## Why a [`ModelClient`] seam?
//!
//! The orchestrator never talks to a provider directly. Everything goes
//! through the small `ModelClient` trait so tests can script replies
//! without a network and callers can inject middleware (caching, rate
//! limiting) without touching retry logic here.
//!
//! ## Retry Strategy
//!
//! Page failures are retried on a fixed ladder (2s, 5s, 10s, 20s by
//! default) rather than exponential doubling: the first retry comes fast
//! because most failures are a single dropped response, the later ones
//! stretch out far enough for a rate-limited provider to recover. A
//! malformed reply burns a retry the same way a network error does, since
//! re-asking is the only recovery for either.

use crate::config::ReconstructionConfig;
use crate::error::{PageError, PageloomError};
use crate::output::{MergeHint, MetadataCandidate};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many times a `text` field that is itself the JSON envelope gets
/// unwrapped before we give up and take it literally.
const MAX_ECHO_DEPTH: usize = 3;

// ── Client seam ──────────────────────────────────────────────────────────

/// One model reply with its token accounting.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A conversational completion backend.
///
/// `history` is the full conversation so far, newest user turn last; the
/// system prompt travels separately so implementations can place it
/// wherever their API expects. Errors are human-readable details; the
/// caller owns all retry policy.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn ask(&self, system: &str, history: &[ChatMessage]) -> Result<ModelReply, String>;
}

/// [`ModelClient`] backed by an edgequake-llm provider.
pub struct EdgequakeModel {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl EdgequakeModel {
    pub fn new(provider: Arc<dyn LLMProvider>, temperature: f32, max_tokens: usize) -> Self {
        let options = CompletionOptions {
            temperature: Some(temperature),
            max_tokens: Some(max_tokens),
            ..Default::default()
        };
        EdgequakeModel { provider, options }
    }
}

#[async_trait]
impl ModelClient for EdgequakeModel {
    async fn ask(&self, system: &str, history: &[ChatMessage]) -> Result<ModelReply, String> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::system(system));
        messages.extend_from_slice(history);

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| format!("{e}"))?;

        Ok(ModelReply {
            text: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

// ── Provider resolution ──────────────────────────────────────────────────

/// Instantiate a named provider with the given model.
fn create_vision_client(
    provider_name: &str,
    model: &str,
    config: &ReconstructionConfig,
) -> Result<Arc<dyn ModelClient>, PageloomError> {
    let provider = ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PageloomError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(EdgequakeModel::new(
        provider,
        config.temperature,
        config.max_tokens,
    )))
}

/// Resolve the model client, from most-specific to least-specific.
///
/// The fallback chain lets library users and CLI users each set exactly as
/// much or as little as they need:
///
/// 1. **Pre-built client** (`config.model_client`) — used as-is. This is
///    how tests script replies.
///
/// 2. **Pre-built provider** (`config.provider`) — wrapped in
///    [`EdgequakeModel`] with the configured sampling options.
///
/// 3. **Named provider + model** (`config.provider_name`) — created via
///    [`ProviderFactory::create_llm_provider`], which reads the matching
///    API key (`OPENAI_API_KEY`, etc.) from the environment.
///
/// 4. **Environment pair** (`PAGELOOM_LLM_PROVIDER` + `PAGELOOM_MODEL`) —
///    both set means the execution environment (Makefile, CI) chose for
///    us; honoured before auto-detection so the choice sticks even when
///    several API keys are present.
///
/// 5. **Full auto-detection** — prefer OpenAI when `OPENAI_API_KEY` is
///    set, otherwise let [`ProviderFactory::from_env`] scan all known key
///    variables and take the first hit.
pub fn resolve_client(config: &ReconstructionConfig) -> Result<Arc<dyn ModelClient>, PageloomError> {
    if let Some(ref client) = config.model_client {
        return Ok(Arc::clone(client));
    }

    if let Some(ref provider) = config.provider {
        return Ok(Arc::new(EdgequakeModel::new(
            Arc::clone(provider),
            config.temperature,
            config.max_tokens,
        )));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
        return create_vision_client(name, model, config);
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("PAGELOOM_LLM_PROVIDER"),
        std::env::var("PAGELOOM_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_client(&prov, &model, config);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            let model = config.model.as_deref().unwrap_or("gpt-4.1-nano");
            return create_vision_client("openai", model, config);
        }
    }

    let (provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PageloomError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(Arc::new(EdgequakeModel::new(
        provider,
        config.temperature,
        config.max_tokens,
    )))
}

// ── Conversation history ─────────────────────────────────────────────────

/// Append-only conversation log, two turns per committed page.
///
/// The log is a value, not shared state: extending it consumes the old
/// log and returns the new one, so page-processing steps stay pure and a
/// failed page provably leaves the history untouched.
#[derive(Debug, Clone, Default)]
pub struct TranscriptLog {
    turns: Vec<ChatMessage>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All turns so far, oldest first.
    pub fn turns(&self) -> &[ChatMessage] {
        &self.turns
    }

    /// Number of committed exchanges (half the turn count).
    pub fn exchanges(&self) -> usize {
        self.turns.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Record one committed exchange. The assistant turn stores only the
    /// emitted text, never the raw JSON envelope, so the model sees its
    /// own prior output without structural noise.
    #[must_use]
    pub fn with_exchange(mut self, user: ChatMessage, assistant_text: &str) -> Self {
        self.turns.push(user);
        self.turns.push(ChatMessage::assistant(assistant_text));
        self
    }
}

// ── Reply parsing ────────────────────────────────────────────────────────

/// The structured per-page payload extracted from a model reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPage {
    pub text: String,
    pub merge_hint: MergeHint,
    pub metadata: Option<MetadataCandidate>,
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(after) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") up to the first newline
    let body = match after.find('\n') {
        Some(i) => &after[i + 1..],
        None => after,
    };
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
}

fn string_field(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse a raw model reply into a [`ParsedPage`].
///
/// Accepts the reply with or without a Markdown code fence. Models
/// occasionally echo the entire JSON envelope *inside* the `text` field;
/// that case is detected (the text itself parses as an object with a
/// `text` key) and unwrapped, at most [`MAX_ECHO_DEPTH`] times.
pub fn parse_transcript(raw: &str) -> Result<ParsedPage, String> {
    let body = strip_code_fence(raw);
    let mut value: Value =
        serde_json::from_str(body).map_err(|e| format!("Reply is not valid JSON: {e}"))?;
    if !value.is_object() {
        return Err("Reply is not a JSON object".to_string());
    }

    for _ in 0..MAX_ECHO_DEPTH {
        let inner = value
            .get("text")
            .and_then(Value::as_str)
            .and_then(|t| serde_json::from_str::<Value>(strip_code_fence(t)).ok())
            .filter(|v| v.get("text").map_or(false, Value::is_string));
        match inner {
            Some(v) => value = v,
            None => break,
        }
    }

    let object = value.as_object().ok_or_else(|| "Reply is not a JSON object".to_string())?;

    let text = object
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| "Reply has no text field".to_string())?
        .to_string();

    let merge_hint = object
        .get("merge_hint")
        .and_then(Value::as_str)
        .map(MergeHint::from_tag)
        .unwrap_or_default();

    let metadata = object
        .get("metadata")
        .and_then(Value::as_object)
        .map(|m| MetadataCandidate {
            title: string_field(m, "title"),
            author: string_field(m, "author"),
            date: string_field(m, "date"),
        })
        .filter(|c| !c.is_empty());

    Ok(ParsedPage {
        text,
        merge_hint,
        metadata,
    })
}

// ── Per-page exchange with retry ladder ──────────────────────────────────

/// A successful page exchange: the parsed payload plus what it cost.
///
/// Token counts are summed across attempts, so a page that needed a retry
/// after an unparseable reply still accounts for both calls.
#[derive(Debug)]
pub struct PageExchange {
    pub parsed: ParsedPage,
    pub retries: u8,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Why an exchange did not produce a page.
#[derive(Debug)]
pub enum ExchangeError {
    /// Cancellation was observed before a retry; the page and everything
    /// after it are abandoned.
    Cancelled,
    /// The ladder is exhausted; the page is recorded as failed and the
    /// document continues.
    Exhausted(PageError),
}

enum Failure {
    Model(String),
    Parse(String),
}

/// Run one page's exchange against the model, retrying on the ladder.
///
/// `user_turn` is the new turn for this page; `history` supplies the
/// prior conversation and is not modified (committing the exchange is the
/// caller's decision). Cancellation is re-checked before every retry
/// sleep, so a cancelled run never waits out a backoff delay.
pub async fn exchange_page(
    client: &Arc<dyn ModelClient>,
    system: &str,
    history: &TranscriptLog,
    user_turn: ChatMessage,
    page_number: usize,
    delays: &[Duration],
    cancel: &CancellationToken,
) -> Result<PageExchange, ExchangeError> {
    let mut turns: Vec<ChatMessage> = history.turns().to_vec();
    turns.push(user_turn);

    let max_retries = delays.len();
    let mut last_failure: Option<Failure> = None;
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            let delay = delays[attempt - 1];
            warn!(
                "Page {}: retry {}/{} after {:?}",
                page_number, attempt, max_retries, delay
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
                _ = sleep(delay) => {}
            }
        }

        match client.ask(system, &turns).await {
            Ok(reply) => {
                input_tokens += reply.input_tokens;
                output_tokens += reply.output_tokens;
                match parse_transcript(&reply.text) {
                    Ok(parsed) => {
                        debug!(
                            "Page {}: {} input tokens, {} output tokens, {} retries",
                            page_number, input_tokens, output_tokens, attempt
                        );
                        return Ok(PageExchange {
                            parsed,
                            retries: attempt.min(u8::MAX as usize) as u8,
                            input_tokens,
                            output_tokens,
                        });
                    }
                    Err(detail) => {
                        warn!(
                            "Page {}: attempt {} returned an unparseable reply — {}",
                            page_number,
                            attempt + 1,
                            detail
                        );
                        last_failure = Some(Failure::Parse(detail));
                    }
                }
            }
            Err(detail) => {
                warn!(
                    "Page {}: attempt {} failed — {}",
                    page_number,
                    attempt + 1,
                    detail
                );
                last_failure = Some(Failure::Model(detail));
            }
        }
    }

    let retries = max_retries.min(u8::MAX as usize) as u8;
    let error = match last_failure {
        Some(Failure::Parse(detail)) => PageError::ParseFailed {
            page: page_number,
            detail,
        },
        Some(Failure::Model(detail)) => PageError::ModelFailed {
            page: page_number,
            retries,
            detail,
        },
        None => PageError::ModelFailed {
            page: page_number,
            retries,
            detail: "Unknown error".to_string(),
        },
    };
    Err(ExchangeError::Exhausted(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    struct ScriptedClient {
        replies: Mutex<VecDeque<Result<String, String>>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<String, String>>) -> Arc<dyn ModelClient> {
            Arc::new(ScriptedClient {
                replies: Mutex::new(replies.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn ask(&self, _system: &str, _history: &[ChatMessage]) -> Result<ModelReply, String> {
            match self.replies.lock().unwrap().pop_front() {
                Some(Ok(text)) => Ok(ModelReply {
                    text,
                    input_tokens: 10,
                    output_tokens: 20,
                }),
                Some(Err(detail)) => Err(detail),
                None => Err("script exhausted".to_string()),
            }
        }
    }

    fn good_reply() -> String {
        r#"{"text": "Hello world.", "merge_hint": "paragraph"}"#.to_string()
    }

    #[test]
    fn parses_a_full_reply() {
        let raw = r##"{
            "text": "# Chapter 1\n\nIt begins.",
            "merge_hint": "newline",
            "metadata": {"title": "The Book", "author": "A. Writer", "date": "2021-03"}
        }"##;
        let parsed = parse_transcript(raw).unwrap();
        assert_eq!(parsed.text, "# Chapter 1\n\nIt begins.");
        assert_eq!(parsed.merge_hint, MergeHint::Newline);
        let meta = parsed.metadata.unwrap();
        assert_eq!(meta.title.as_deref(), Some("The Book"));
        assert_eq!(meta.date.as_deref(), Some("2021-03"));
    }

    #[test]
    fn missing_hint_defaults_to_paragraph() {
        let parsed = parse_transcript(r#"{"text": "body"}"#).unwrap();
        assert_eq!(parsed.merge_hint, MergeHint::Paragraph);
        assert!(parsed.metadata.is_none());
    }

    #[test]
    fn unknown_hint_defaults_to_paragraph() {
        let parsed = parse_transcript(r#"{"text": "b", "merge_hint": "sideways"}"#).unwrap();
        assert_eq!(parsed.merge_hint, MergeHint::Paragraph);
    }

    #[test]
    fn strips_code_fences() {
        let raw = "```json\n{\"text\": \"fenced\", \"merge_hint\": \"direct\"}\n```";
        let parsed = parse_transcript(raw).unwrap();
        assert_eq!(parsed.text, "fenced");
        assert_eq!(parsed.merge_hint, MergeHint::Direct);
    }

    #[test]
    fn unwraps_an_echoed_envelope() {
        let inner = r#"{"text": "actual content", "merge_hint": "newline"}"#;
        let raw = serde_json::json!({ "text": inner, "merge_hint": "paragraph" }).to_string();
        let parsed = parse_transcript(&raw).unwrap();
        assert_eq!(parsed.text, "actual content");
        assert_eq!(parsed.merge_hint, MergeHint::Newline);
    }

    #[test]
    fn echo_unwrap_is_bounded() {
        let mut raw = r#"{"text": "innermost"}"#.to_string();
        for _ in 0..6 {
            raw = serde_json::json!({ "text": raw }).to_string();
        }
        // terminates and still yields a reply
        let parsed = parse_transcript(&raw).unwrap();
        assert!(parsed.text.contains("text"), "stopped before the innermost layer");
    }

    #[test]
    fn rejects_non_json_and_non_objects() {
        assert!(parse_transcript("just some prose").is_err());
        assert!(parse_transcript("[1, 2, 3]").is_err());
        assert!(parse_transcript(r#"{"content": "wrong key"}"#).is_err());
    }

    #[test]
    fn blank_metadata_fields_are_dropped() {
        let raw = r#"{"text": "b", "metadata": {"title": "  ", "author": "", "date": "2020"}}"#;
        let parsed = parse_transcript(raw).unwrap();
        let meta = parsed.metadata.unwrap();
        assert!(meta.title.is_none());
        assert_eq!(meta.date.as_deref(), Some("2020"));
    }

    #[test]
    fn transcript_grows_two_turns_per_exchange() {
        let log = TranscriptLog::new();
        assert!(log.is_empty());
        let log = log.with_exchange(ChatMessage::user("page 1 please"), "page one text");
        let log = log.with_exchange(ChatMessage::user("page 2 please"), "page two text");
        assert_eq!(log.turns().len(), 4);
        assert_eq!(log.exchanges(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_on_the_ladder_then_succeeds() {
        let client = ScriptedClient::new(vec![
            Err("connection reset".into()),
            Err("HTTP 429".into()),
            Ok(good_reply()),
        ]);
        let delays = [Duration::from_secs(2), Duration::from_secs(5), Duration::from_secs(10)];
        let started = Instant::now();
        let exchange = exchange_page(
            &client,
            "system",
            &TranscriptLog::new(),
            ChatMessage::user("page 1"),
            1,
            &delays,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(exchange.retries, 2);
        assert_eq!(exchange.parsed.text, "Hello world.");
        // two ladder steps slept: 2s + 5s
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_a_model_failure() {
        let client = ScriptedClient::new(vec![
            Err("a".into()),
            Err("b".into()),
            Err("final failure".into()),
        ]);
        let delays = [Duration::from_secs(2), Duration::from_secs(5)];
        let err = exchange_page(
            &client,
            "system",
            &TranscriptLog::new(),
            ChatMessage::user("page 3"),
            3,
            &delays,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        match err {
            ExchangeError::Exhausted(PageError::ModelFailed { page, retries, detail }) => {
                assert_eq!(page, 3);
                assert_eq!(retries, 2);
                assert_eq!(detail, "final failure");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unparseable_replies_burn_retries_too() {
        let client = ScriptedClient::new(vec![
            Ok("not json at all".into()),
            Ok("still not json".into()),
        ]);
        let delays = [Duration::from_secs(2)];
        let err = exchange_page(
            &client,
            "system",
            &TranscriptLog::new(),
            ChatMessage::user("page 2"),
            2,
            &delays,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Exhausted(PageError::ParseFailed { page: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_is_checked_before_each_retry() {
        let client = ScriptedClient::new(vec![Err("boom".into()), Ok(good_reply())]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        let err = exchange_page(
            &client,
            "system",
            &TranscriptLog::new(),
            ChatMessage::user("page 1"),
            1,
            &[Duration::from_secs(20)],
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExchangeError::Cancelled));
        // never slept out the 20s backoff
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[test]
    fn fence_stripping_tolerates_ragged_fences() {
        assert_eq!(strip_code_fence("plain"), "plain");
        assert_eq!(strip_code_fence("```json\n{}\n```"), "{}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        // missing closing fence
        assert_eq!(strip_code_fence("```json\n{\"a\": 1}"), "{\"a\": 1}");
    }
}
