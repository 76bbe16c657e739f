//! Configuration types for document reconstruction.
//!
//! All reconstruction behaviour is controlled through
//! [`ReconstructionConfig`], built via its [`ReconstructionConfigBuilder`].
//! Keeping every knob in one struct makes it trivial to share configs across
//! tasks, log them, and diff two runs to understand why their outputs differ.
//!
//! ## Why a builder?
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! well-documented defaults for the rest.

use crate::error::PageloomError;
use crate::pipeline::model::ModelClient;
use crate::progress::ReconstructionProgress;
use crate::worker::deadline::TimeoutPolicy;
use crate::worker::transport::WorkerTransport;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The retry ladder for a failed page: four retries with increasing delay.
///
/// The steps are deliberately not a clean doubling. The first retry comes
/// quickly (most failures are one dropped response), the later ones stretch
/// out far enough for a rate-limited provider to recover.
pub const DEFAULT_PAGE_RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(20),
];

/// Configuration for a document reconstruction run.
///
/// Built via [`ReconstructionConfig::builder()`] or using
/// [`ReconstructionConfig::default()`].
///
/// # Example
/// ```rust
/// use pageloom::ReconstructionConfig;
///
/// let config = ReconstructionConfig::builder()
///     .model("gpt-4o-mini")
///     .download_timeout_secs(60)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ReconstructionConfig {
    /// Model identifier, e.g. "gpt-4o", "claude-sonnet-4-20250514".
    /// If None, uses provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "openai", "anthropic", "ollama").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed model client. Takes precedence over everything else
    /// in the provider resolution chain. This is the seam tests use to
    /// script model replies without a network.
    pub model_client: Option<Arc<dyn ModelClient>>,

    /// Sampling temperature for the model completion. Default: 0.1.
    ///
    /// Low temperature keeps the model deterministic and faithful to what it
    /// sees on the page. Higher values introduce creativity that worsens
    /// transcription accuracy.
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 4096.
    ///
    /// Dense pages (tables, code listings) can exceed 2 000 output tokens.
    /// Setting this too low silently truncates the reply mid-sentence.
    pub max_tokens: usize,

    /// Delays between page retry attempts. Default: 2s, 5s, 10s, 20s.
    ///
    /// The ladder length IS the retry count: a page is attempted once, then
    /// once more after each delay, so the default allows 4 retries. An empty
    /// ladder means fail-fast with no retries.
    pub page_retry_delays: Vec<Duration>,

    /// Timeout and heartbeat policy for worker jobs.
    ///
    /// See [`TimeoutPolicy`] for the adaptive-deadline rules. The default
    /// policy sizes each job's budget from its payload and extends it while
    /// the worker stays alive, up to an absolute ceiling.
    pub timeouts: TimeoutPolicy,

    /// Command line used to launch the worker sidecar. Default:
    /// `["pageloom-worker"]`. First element is the program, the rest are
    /// arguments. Ignored when `transport` is set.
    pub worker_command: Vec<String>,

    /// Directory for spooled job payloads. Default: None (system temp dir).
    ///
    /// Payloads above the inline ceiling are written here and passed to the
    /// worker by key. Point this at a ramdisk for large documents.
    pub spool_dir: Option<PathBuf>,

    /// Pre-constructed worker transport. Takes precedence over
    /// `worker_command`. This is the seam tests use to script worker
    /// replies without spawning a process.
    pub transport: Option<Arc<dyn WorkerTransport>>,

    /// Custom system prompt. If None, uses built-in default.
    pub system_prompt: Option<String>,

    /// Cancellation signal checked at every page boundary and before every
    /// retry sleep. Default: a fresh token nobody cancels.
    pub cancel: CancellationToken,

    /// Progress callbacks. Default: None (silent).
    pub progress: Option<Arc<dyn ReconstructionProgress>>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            model: None,
            provider_name: None,
            provider: None,
            model_client: None,
            temperature: 0.1,
            max_tokens: 4096,
            page_retry_delays: DEFAULT_PAGE_RETRY_DELAYS.to_vec(),
            timeouts: TimeoutPolicy::default(),
            worker_command: vec!["pageloom-worker".to_string()],
            spool_dir: None,
            transport: None,
            system_prompt: None,
            cancel: CancellationToken::new(),
            progress: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for ReconstructionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconstructionConfig")
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field(
                "model_client",
                &self.model_client.as_ref().map(|_| "<dyn ModelClient>"),
            )
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("page_retry_delays", &self.page_retry_delays)
            .field("timeouts", &self.timeouts)
            .field("worker_command", &self.worker_command)
            .field("spool_dir", &self.spool_dir)
            .field(
                "transport",
                &self.transport.as_ref().map(|_| "<dyn WorkerTransport>"),
            )
            .field("download_timeout_secs", &self.download_timeout_secs)
            .finish()
    }
}

impl ReconstructionConfig {
    /// Create a new builder for `ReconstructionConfig`.
    pub fn builder() -> ReconstructionConfigBuilder {
        ReconstructionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Number of retries a page gets after its first attempt.
    pub fn max_page_retries(&self) -> u8 {
        self.page_retry_delays.len().min(u8::MAX as usize) as u8
    }
}

/// Builder for [`ReconstructionConfig`].
#[derive(Debug)]
pub struct ReconstructionConfigBuilder {
    config: ReconstructionConfig,
}

impl ReconstructionConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn model_client(mut self, client: Arc<dyn ModelClient>) -> Self {
        self.config.model_client = Some(client);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn page_retry_delays(mut self, delays: Vec<Duration>) -> Self {
        self.config.page_retry_delays = delays;
        self
    }

    pub fn timeouts(mut self, policy: TimeoutPolicy) -> Self {
        self.config.timeouts = policy;
        self
    }

    pub fn worker_command(mut self, parts: Vec<String>) -> Self {
        self.config.worker_command = parts;
        self
    }

    pub fn spool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.spool_dir = Some(dir.into());
        self
    }

    pub fn transport(mut self, transport: Arc<dyn WorkerTransport>) -> Self {
        self.config.transport = Some(transport);
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.config.cancel = token;
        self
    }

    pub fn progress(mut self, progress: Arc<dyn ReconstructionProgress>) -> Self {
        self.config.progress = Some(progress);
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ReconstructionConfig, PageloomError> {
        let c = &self.config;
        if c.transport.is_none() && c.worker_command.is_empty() {
            return Err(PageloomError::InvalidConfig(
                "Worker command must name a program (or set a transport)".into(),
            ));
        }
        if c.page_retry_delays.len() > u8::MAX as usize {
            return Err(PageloomError::InvalidConfig(format!(
                "Retry ladder too long: {} steps",
                c.page_retry_delays.len()
            )));
        }
        c.timeouts
            .validate()
            .map_err(PageloomError::InvalidConfig)?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_retry_ladder_is_2_5_10_20() {
        let config = ReconstructionConfig::default();
        let secs: Vec<u64> = config
            .page_retry_delays
            .iter()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(secs, vec![2, 5, 10, 20]);
        assert_eq!(config.max_page_retries(), 4);
    }

    #[test]
    fn builder_clamps_temperature() {
        let config = ReconstructionConfig::builder()
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(config.temperature, 2.0);
    }

    #[test]
    fn empty_worker_command_rejected_without_transport() {
        let err = ReconstructionConfig::builder()
            .worker_command(vec![])
            .build()
            .unwrap_err();
        assert!(matches!(err, PageloomError::InvalidConfig(_)));
    }

    #[test]
    fn debug_does_not_require_debug_providers() {
        let config = ReconstructionConfig::default();
        let s = format!("{config:?}");
        assert!(s.contains("page_retry_delays"));
    }
}
