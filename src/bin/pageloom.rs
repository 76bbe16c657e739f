//! CLI binary for pageloom.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ReconstructionConfig` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pageloom::{
    inspect, reconstruct, Pageloom, ReconstructionConfig, ReconstructionProgress,
    DEFAULT_PAGE_RETRY_DELAYS,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress hook using indicatif ────────────────────────────────────────

/// Terminal progress hook: renders a live progress bar and per-page log
/// lines using [indicatif]. Pages are processed strictly in order, so a
/// single slot is enough to time the page in flight.
struct CliProgress {
    /// The single progress bar anchored at the bottom of the terminal.
    bar: ProgressBar,
    /// Wall-clock start of the page currently in flight.
    page_started: Mutex<Option<Instant>>,
    /// Count of pages that errored out.
    errors: AtomicUsize,
}

impl CliProgress {
    /// Create a hook whose progress-bar length is set dynamically by
    /// `on_reconstruction_start` (called once the page count is known).
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_reconstruction_start

        // Initial style: spinner only (no counter until we know the total).
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            page_started: Mutex::new(None),
            errors: AtomicUsize::new(0),
        })
    }

    /// Switch to the full progress-bar style once we know `total`.
    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Reconstructing");
        self.bar.reset_eta();
    }

    fn take_elapsed_ms(&self) -> u128 {
        self.page_started
            .lock()
            .unwrap()
            .take()
            .map(|t| t.elapsed().as_millis())
            .unwrap_or(0)
    }
}

impl ReconstructionProgress for CliProgress {
    fn on_reconstruction_start(&self, total_pages: usize) {
        // Switch from spinner-only style to full progress bar now that we
        // know the actual page count.
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Reconstructing {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page: usize, _total_pages: usize) {
        *self.page_started.lock().unwrap() = Some(Instant::now());
        self.bar.set_message(format!("page {page}"));
    }

    fn on_page_complete(&self, page: usize, total_pages: usize, text_len: usize) {
        let elapsed_ms = self.take_elapsed_ms();

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page,
            total_pages,
            dim(&format!("{text_len:>5} chars")),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: usize, total_pages: usize, error: &str) {
        let elapsed_ms = self.take_elapsed_ms();

        self.errors.fetch_add(1, Ordering::SeqCst);

        // Truncate very long error messages to keep output tidy.
        let msg = if error.len() > 80 {
            let cut = error
                .char_indices()
                .take_while(|(i, _)| *i < 79)
                .map(|(i, c)| i + c.len_utf8())
                .last()
                .unwrap_or(0);
            format!("{}\u{2026}", &error[..cut])
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page,
            total_pages,
            red(&msg),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
        self.bar.inc(1);
    }

    fn on_reconstruction_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages reconstructed successfully",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages reconstructed  ({} failed)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Basic reconstruction (stdout)
  pageloom document.pdf

  # Reconstruct to file
  pageloom document.pdf -o output.md

  # Use a specific model
  pageloom --model gpt-4.1 --provider openai document.pdf

  # Reconstruct from URL
  pageloom https://arxiv.org/pdf/1706.03762 -o attention.md

  # Inspect page geometry (no API key needed)
  pageloom --inspect-only document.pdf

  # Custom worker sidecar and spool directory
  pageloom --worker "my-render-worker --headless" --spool-dir /dev/shm/pageloom doc.pdf

  # JSON output with per-page results and stats
  pageloom --json document.pdf > output.json

SUPPORTED PROVIDERS & MODELS:
  Provider     Model                  Vision
  ─────────    ─────────────────────  ──────
  openai       gpt-4.1-nano (default) ✓
  openai       gpt-4.1-mini           ✓
  openai       gpt-4.1                ✓
  anthropic    claude-sonnet-4-20250514  ✓
  gemini       gemini-2.0-flash       ✓
  ollama       llava, llama3.2-vision ✓

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  PAGELOOM_LLM_PROVIDER   Override provider (openai, anthropic, gemini, ollama)
  PAGELOOM_MODEL          Override model ID
  PAGELOOM_SPOOL_DIR      Directory for spooled worker payloads

SETUP:
  1. Set API key:     export OPENAI_API_KEY=sk-...
  2. Reconstruct:     pageloom document.pdf -o output.md

  Rendering runs in a worker sidecar (`pageloom-worker` by default) that is
  spawned on demand and restarted once if it crashes mid-document. Use
  --worker to point at your own sidecar binary.
"#;

/// Reconstruct documents into structured Markdown using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "pageloom",
    version,
    about = "Reconstruct documents into structured Markdown using Vision LLMs",
    long_about = "Reconstruct documents (local files or URLs) into clean, well-structured \
Markdown by walking their pages through a Vision Language Model conversation. Rendering is \
delegated to a crash-isolated worker sidecar; supports OpenAI, Anthropic, Google Gemini, and \
any OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local document file path or HTTP/HTTPS URL.
    input: String,

    /// Write Markdown to this file instead of stdout.
    #[arg(short, long, env = "PAGELOOM_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4.1-nano, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(
        long,
        env = "PAGELOOM_MODEL",
        long_help = "Vision LLM model to use. Default: gpt-4.1-nano.\n\
          The model must accept image inputs; text-only models fail on every page."
    )]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "PAGELOOM_LLM_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// Worker sidecar command line, whitespace-separated.
    #[arg(
        long,
        env = "PAGELOOM_WORKER",
        long_help = "Command used to launch the render worker, split on whitespace.\n\
          Default: \"pageloom-worker\". The worker speaks newline-delimited JSON on stdio."
    )]
    worker: Option<String>,

    /// Directory for spooled worker payloads (default: system temp dir).
    #[arg(long, env = "PAGELOOM_SPOOL_DIR")]
    spool_dir: Option<PathBuf>,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "PAGELOOM_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per page.
    #[arg(long, env = "PAGELOOM_MAX_TOKENS", default_value_t = 4096)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "PAGELOOM_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Retries per page on model failure (0 disables the retry ladder).
    #[arg(long, env = "PAGELOOM_MAX_RETRIES", default_value_t = 4,
          value_parser = clap::value_parser!(u8).range(0..=4))]
    max_retries: u8,

    /// Output structured JSON (ReconstructionOutput) instead of Markdown.
    #[arg(long, env = "PAGELOOM_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGELOOM_NO_PROGRESS")]
    no_progress: bool,

    /// Print page count and geometry only, no reconstruction.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGELOOM_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGELOOM_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "PAGELOOM_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    // In verbose mode we always want all logs regardless of progress.
    let filter = if cli.verbose { "debug" } else { filter };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    // Geometry comes straight from the worker; no model client is needed,
    // so this path works without any API key configured.
    if cli.inspect_only {
        let config = build_config(&cli, None).await?;
        let geometry = inspect(&cli.input, &config)
            .await
            .context("Failed to inspect document")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&geometry).context("Failed to serialize geometry")?
            );
        } else {
            println!("Source:       {}", cli.input);
            println!("Pages:        {}", geometry.page_count);
            if let Some(first) = geometry.boxes.first() {
                println!("First page:   {:.1} × {:.1} pt", first.width, first.height);
            }
            if geometry.hints.sidebar_width > 0.0 || geometry.hints.toolbar_height > 0.0 {
                println!(
                    "Chrome:       sidebar {:.0}px, toolbar {:.0}px",
                    geometry.hints.sidebar_width, geometry.hints.toolbar_height
                );
            }
        }
        return Ok(());
    }

    // ── Build config ─────────────────────────────────────────────────────
    // The progress bar is initialised with a spinner (no page count yet);
    // `on_reconstruction_start` resizes it to the correct total once the
    // document has been inspected.
    let progress: Option<Arc<dyn ReconstructionProgress>> = if show_progress {
        Some(CliProgress::new_dynamic() as Arc<dyn ReconstructionProgress>)
    } else {
        None
    };

    let config = build_config(&cli, progress).await?;

    // ── Run reconstruction ───────────────────────────────────────────────
    if let Some(ref output_path) = cli.output {
        let engine = Pageloom::new(config).context("Failed to initialise")?;
        let result = engine.reconstruct_to_file(&cli.input, output_path).await;
        engine.shutdown().await;
        let output = result.context("Reconstruction failed")?;

        // Summary line (the hook already printed the per-page log).
        if !cli.quiet {
            let stats = &output.stats;
            eprintln!(
                "{}  {}/{} pages  {}ms  →  {}",
                if stats.failed_pages == 0 {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                stats.processed_pages,
                stats.total_pages,
                stats.total_duration_ms,
                bold(&output_path.display().to_string()),
            );
            eprintln!(
                "   {} tokens in  /  {} tokens out",
                dim(&stats.total_input_tokens.to_string()),
                dim(&stats.total_output_tokens.to_string()),
            );
            let failed = output.failed_pages();
            if !failed.is_empty() {
                eprintln!("   failed pages: {failed:?}");
            }
        }
    } else {
        let output = reconstruct(&cli.input, &config)
            .await
            .context("Reconstruction failed")?;

        if cli.json {
            let json =
                serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
            println!("{json}");
        } else {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            handle
                .write_all(output.markdown.as_bytes())
                .context("Failed to write to stdout")?;
            // Ensure a trailing newline on stdout.
            if !output.markdown.ends_with('\n') {
                handle.write_all(b"\n").ok();
            }
        }

        // Summary (the hook already printed the final green/red tick).
        if !cli.quiet && !show_progress {
            // Only print inline stats when the progress hook is disabled.
            eprintln!(
                "Reconstructed {}/{} pages in {}ms",
                output.stats.processed_pages, output.stats.total_pages, output.stats.total_duration_ms
            );
            if output.stats.failed_pages > 0 {
                eprintln!("  failed pages: {:?}", output.failed_pages());
            }
        } else if !cli.quiet && !cli.json {
            eprintln!(
                "   {} tokens in  /  {} tokens out  —  {}ms total",
                dim(&output.stats.total_input_tokens.to_string()),
                dim(&output.stats.total_output_tokens.to_string()),
                output.stats.total_duration_ms,
            );
        }
    }

    Ok(())
}

/// Map CLI args to `ReconstructionConfig`.
async fn build_config(
    cli: &Cli,
    progress: Option<Arc<dyn ReconstructionProgress>>,
) -> Result<ReconstructionConfig> {
    let mut builder = ReconstructionConfig::builder()
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .page_retry_delays(DEFAULT_PAGE_RETRY_DELAYS[..cli.max_retries as usize].to_vec())
        .download_timeout_secs(cli.download_timeout);

    if let Some(ref model) = cli.model {
        builder = builder.model(model.clone());
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider.clone());
    }
    if let Some(ref worker) = cli.worker {
        let parts: Vec<String> = worker.split_whitespace().map(str::to_string).collect();
        builder = builder.worker_command(parts);
    }
    if let Some(ref dir) = cli.spool_dir {
        builder = builder.spool_dir(dir.clone());
    }
    if let Some(ref path) = cli.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {path:?}"))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(hook) = progress {
        builder = builder.progress(hook);
    }

    builder.build().context("Invalid configuration")
}
