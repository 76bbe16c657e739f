//! Input resolution: normalise a user-supplied path or URL to source bytes.
//!
//! ## Why bytes instead of a path?
//!
//! The worker context receives the source through the payload store, which
//! wants bytes regardless of where they came from. Resolving to a byte
//! buffer up front also means URL inputs never touch the local filesystem
//! outside the spool. We validate the PDF magic bytes (`%PDF`) before
//! returning so callers get a meaningful error rather than a worker-side
//! failure on a mis-pasted path.

use crate::error::PageloomError;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A resolved source: its bytes plus the best-known display name.
///
/// `name` feeds the metadata title fallback when no page ever reports a
/// real title, so it keeps its extension for display but the fallback
/// strips it.
#[derive(Debug)]
pub struct SourceInput {
    pub bytes: Vec<u8>,
    pub name: String,
}

impl SourceInput {
    /// Wrap in-memory bytes, validating the magic.
    pub fn from_bytes(bytes: Vec<u8>, name: impl Into<String>) -> Result<Self, PageloomError> {
        let name = name.into();
        check_magic(&bytes, Path::new(&name))?;
        Ok(SourceInput { bytes, name })
    }

    /// The name without its extension, for use as a title placeholder.
    pub fn title_fallback(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to source bytes.
///
/// If the input is a URL, download it. If the input is a local file,
/// validate it exists and is readable.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<SourceInput, PageloomError> {
    if input.trim().is_empty() {
        return Err(PageloomError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input).await
    }
}

async fn resolve_local(path_str: &str) -> Result<SourceInput, PageloomError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(PageloomError::FileNotFound { path });
    }

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(PageloomError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(PageloomError::FileNotFound { path });
        }
    };

    check_magic(&bytes, &path)?;

    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path_str.to_string());
    debug!("Resolved local source: {} ({} bytes)", path.display(), bytes.len());
    Ok(SourceInput { bytes, name })
}

async fn download_url(url: &str, timeout_secs: u64) -> Result<SourceInput, PageloomError> {
    info!("Downloading source from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PageloomError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PageloomError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PageloomError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PageloomError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let name = filename_from_url(url);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PageloomError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_vec();

    check_magic(&bytes, Path::new(&name))?;

    info!("Downloaded {} bytes as '{}'", bytes.len(), name);
    Ok(SourceInput { bytes, name })
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), PageloomError> {
    let mut magic = [0u8; 4];
    let head = bytes.get(..4).unwrap_or_default();
    magic[..head.len()].copy_from_slice(head);
    if &magic != b"%PDF" {
        return Err(PageloomError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

/// Extract a reasonable filename from the URL, or a generic default.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}
