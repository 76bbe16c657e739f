//! Size-based transport strategy for job payloads.
//!
//! A payload (source document bytes, rendered pixels, synthesised audio)
//! can cross the worker boundary three ways:
//!
//! * **Inline** — base64 inside the JSON line itself. Only below a fixed
//!   ceiling; a multi-megabyte line stalls the whole stdio pipe.
//! * **Spooled** — written to the shared spool directory under a generated
//!   key, with a paired `<key>.json` record `{timestamp, size}`. The JSON
//!   line carries only the key; the receiver reads the bytes back and
//!   schedules cleanup roughly five minutes later.
//! * **Fallback** — same scheme in a secondary spool under the OS temp
//!   dir, used when the primary spool cannot be written.
//!
//! The choice is made exactly once per payload by [`choose_transport`],
//! a pure function of size and primary availability, so there are no
//! scattered size checks at call sites.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::PageloomError;

/// Largest payload embedded directly in a JSON line: 2 MiB.
pub const INLINE_CEILING: usize = 2 * 1024 * 1024;

/// How long spooled payloads stay on disk after delivery.
///
/// Long enough for a retried call to re-read them, short enough that an
/// interrupted run does not leak gigabytes of pixels.
pub const CLEANUP_DELAY: Duration = Duration::from_secs(300);

/// Where a payload travels. Chosen once per payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Inline,
    Spooled,
    Fallback,
}

/// Pick the transport for a payload of `size` bytes.
///
/// Pure so the decision is testable without touching a filesystem:
/// small payloads go inline, large ones to the primary spool, and to the
/// fallback spool when the primary is unavailable.
pub fn choose_transport(size: usize, primary_available: bool) -> TransportKind {
    if size <= INLINE_CEILING {
        TransportKind::Inline
    } else if primary_available {
        TransportKind::Spooled
    } else {
        TransportKind::Fallback
    }
}

/// A payload as it appears on the wire.
///
/// `Spooled` and `Fallback` carry the record fields (`size`, `timestamp`)
/// inline so the receiver can validate the bytes it reads back without a
/// second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum PayloadRef {
    Inline { data: String },
    Spooled { key: String, size: u64, timestamp: u64 },
    Fallback { key: String, size: u64, timestamp: u64 },
}

impl PayloadRef {
    /// Approximate decoded size in bytes, for timeout budgeting.
    pub fn size_hint(&self) -> u64 {
        match self {
            // base64 inflates by 4/3
            PayloadRef::Inline { data } => (data.len() as u64 / 4) * 3,
            PayloadRef::Spooled { size, .. } | PayloadRef::Fallback { size, .. } => *size,
        }
    }

    /// The spool key, if this payload lives on disk.
    pub fn key(&self) -> Option<&str> {
        match self {
            PayloadRef::Inline { .. } => None,
            PayloadRef::Spooled { key, .. } | PayloadRef::Fallback { key, .. } => Some(key),
        }
    }
}

/// The paired metadata record written next to each spooled payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpoolRecord {
    timestamp: u64,
    size: u64,
}

/// Reads and writes payloads according to their transport.
///
/// Both ends of the wire construct one of these over the same directories:
/// the gateway passes the primary dir to the worker process through its
/// environment, and the fallback dir is a fixed derivation of the OS temp
/// dir so it needs no coordination.
#[derive(Debug, Clone)]
pub struct PayloadStore {
    primary: PathBuf,
    fallback: PathBuf,
    primary_available: bool,
}

/// Default primary spool when the config names none.
pub fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("pageloom-spool")
}

fn fallback_spool_dir() -> PathBuf {
    std::env::temp_dir().join("pageloom-spool-fallback")
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PayloadStore {
    /// Open a store over `primary` (or the default spool dir).
    ///
    /// Primary availability is probed once here; if the directory cannot
    /// be created, every oversized payload goes to the fallback spool.
    pub fn new(primary: Option<PathBuf>) -> Self {
        let primary = primary.unwrap_or_else(default_spool_dir);
        let primary_available = match std::fs::create_dir_all(&primary) {
            Ok(()) => true,
            Err(e) => {
                warn!(dir = %primary.display(), "primary spool unavailable: {e}");
                false
            }
        };
        PayloadStore {
            primary,
            fallback: fallback_spool_dir(),
            primary_available,
        }
    }

    /// The primary spool directory, as handed to the worker process.
    pub fn primary_dir(&self) -> &Path {
        &self.primary
    }

    /// Persist `bytes` and return the wire reference for them.
    pub async fn store(&self, bytes: &[u8]) -> Result<PayloadRef, PageloomError> {
        match choose_transport(bytes.len(), self.primary_available) {
            TransportKind::Inline => Ok(PayloadRef::Inline {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
            }),
            TransportKind::Spooled => match self.write_spool(&self.primary, bytes).await {
                Ok((key, timestamp)) => Ok(PayloadRef::Spooled {
                    key,
                    size: bytes.len() as u64,
                    timestamp,
                }),
                // Degrade at runtime too: a full disk on the primary spool
                // should not fail the job while the fallback still works.
                Err(e) => {
                    warn!("primary spool write failed, using fallback: {e}");
                    self.store_fallback(bytes).await
                }
            },
            TransportKind::Fallback => self.store_fallback(bytes).await,
        }
    }

    async fn store_fallback(&self, bytes: &[u8]) -> Result<PayloadRef, PageloomError> {
        let (key, timestamp) = self
            .write_spool(&self.fallback, bytes)
            .await
            .map_err(|e| PageloomError::SpoolFailed {
                detail: format!("fallback spool '{}': {e}", self.fallback.display()),
            })?;
        Ok(PayloadRef::Fallback {
            key,
            size: bytes.len() as u64,
            timestamp,
        })
    }

    async fn write_spool(&self, dir: &Path, bytes: &[u8]) -> std::io::Result<(String, u64)> {
        tokio::fs::create_dir_all(dir).await?;
        let key = Uuid::new_v4().to_string();
        let timestamp = now_millis();
        let record = SpoolRecord {
            timestamp,
            size: bytes.len() as u64,
        };
        tokio::fs::write(dir.join(format!("{key}.bin")), bytes).await?;
        tokio::fs::write(
            dir.join(format!("{key}.json")),
            serde_json::to_vec(&record).unwrap_or_default(),
        )
        .await?;
        debug!(key, size = bytes.len(), dir = %dir.display(), "payload spooled");
        Ok((key, timestamp))
    }

    /// Read a payload back, validating spooled sizes against the record.
    pub async fn fetch(&self, payload: &PayloadRef) -> Result<Vec<u8>, PageloomError> {
        match payload {
            PayloadRef::Inline { data } => base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| PageloomError::PayloadUnavailable {
                    key: "<inline>".to_string(),
                    detail: format!("invalid base64: {e}"),
                }),
            PayloadRef::Spooled { key, size, .. } => {
                self.read_spool(&self.primary, key, *size).await
            }
            PayloadRef::Fallback { key, size, .. } => {
                self.read_spool(&self.fallback, key, *size).await
            }
        }
    }

    async fn read_spool(
        &self,
        dir: &Path,
        key: &str,
        expected: u64,
    ) -> Result<Vec<u8>, PageloomError> {
        let path = dir.join(format!("{key}.bin"));
        let bytes =
            tokio::fs::read(&path)
                .await
                .map_err(|e| PageloomError::PayloadUnavailable {
                    key: key.to_string(),
                    detail: format!("read '{}': {e}", path.display()),
                })?;
        if bytes.len() as u64 != expected {
            return Err(PageloomError::PayloadUnavailable {
                key: key.to_string(),
                detail: format!("size mismatch: record says {expected}, file has {}", bytes.len()),
            });
        }
        Ok(bytes)
    }

    /// Delete a delivered payload's files after [`CLEANUP_DELAY`].
    ///
    /// Best-effort: the files may already be gone (worker restarts share
    /// the spool) and that is fine.
    pub fn schedule_cleanup(&self, payload: &PayloadRef) {
        let Some(key) = payload.key() else { return };
        let dir = match payload {
            PayloadRef::Inline { .. } => return,
            PayloadRef::Spooled { .. } => self.primary.clone(),
            PayloadRef::Fallback { .. } => self.fallback.clone(),
        };
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(CLEANUP_DELAY).await;
            for ext in ["bin", "json"] {
                let path = dir.join(format!("{key}.{ext}"));
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    debug!(key, "spool cleanup skipped {}: {e}", path.display());
                }
            }
        });
    }
}
