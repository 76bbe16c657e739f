//! Typed jobs and the wire protocol spoken with the worker.
//!
//! Every request crosses the wire as one JSON line:
//!
//! ```json
//! {"target":"worker","id":7,"kind":"render_page","payload":{...}}
//! ```
//!
//! and every reply as one JSON object carrying the same `id` plus a
//! `success` flag:
//!
//! ```json
//! {"id":7,"success":true,"pages":[...]}
//! {"id":7,"success":false,"error":"page 3 out of range"}
//! ```
//!
//! Replies are parsed leniently: routing only needs the `id`, and
//! [`parse_reply`] accepts any object with a boolean `success`. Anything
//! else (non-object, missing flag) is a protocol violation reported as
//! [`CallFailure::Malformed`] rather than a panic, because the worker is a
//! separate program we do not control.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CallFailure;
use crate::worker::payload::PayloadRef;

/// Width and height of one page's content box, in source units (points).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageBox {
    pub width: f64,
    pub height: f64,
}

impl PageBox {
    /// A box is usable only when both dimensions are finite and positive.
    pub fn is_degenerate(&self) -> bool {
        !(self.width.is_finite() && self.height.is_finite())
            || self.width <= 0.0
            || self.height <= 0.0
    }
}

/// Pixel offsets of viewer chrome the worker must exclude when capturing
/// a page region (sidebars, toolbars). All zero for a chromeless source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LayoutHints {
    #[serde(default)]
    pub sidebar_width: f64,
    #[serde(default)]
    pub toolbar_height: f64,
}

/// One request unit sent to the worker context.
///
/// `kind` strings are the protocol contract; the worker dispatches on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Job {
    /// Readiness probe. The worker answers as soon as its event loop runs.
    Ping,
    /// Load the source and report page count and per-page boxes.
    InspectSource { source: PayloadRef },
    /// Rasterise every page in one pass over the source.
    RenderBatch {
        source: PayloadRef,
        boxes: Vec<PageBox>,
        hints: LayoutHints,
    },
    /// Rasterise a single page. Fallback path when the batch call fails.
    RenderPage {
        source: PayloadRef,
        page_number: usize,
        bounds: PageBox,
        hints: LayoutHints,
    },
    /// Synthesise speech for a block of text with a named voice.
    Synthesize { text: String, voice: String },
    /// Ask the worker to drop caches and loaded models before teardown.
    ReleaseResources,
}

impl Job {
    /// Stable kind string, matching the wire tag. Used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Job::Ping => "ping",
            Job::InspectSource { .. } => "inspect_source",
            Job::RenderBatch { .. } => "render_batch",
            Job::RenderPage { .. } => "render_page",
            Job::Synthesize { .. } => "synthesize",
            Job::ReleaseResources => "release_resources",
        }
    }

    /// Whether this kind gets a size-derived budget and a heartbeat ticker.
    ///
    /// Everything that touches the loaded source or runs synthesis can take
    /// arbitrarily long on big inputs. `Ping` and `ReleaseResources` finish
    /// in one event-loop turn and get the fixed admin timeout instead.
    pub fn is_long_running(&self) -> bool {
        matches!(
            self,
            Job::InspectSource { .. }
                | Job::RenderBatch { .. }
                | Job::RenderPage { .. }
                | Job::Synthesize { .. }
        )
    }

    /// Input-size estimate the timeout budget scales with.
    ///
    /// Render-family jobs cost one unit per KiB of source payload;
    /// synthesis costs one unit per character of text.
    pub fn cost_units(&self) -> u64 {
        match self {
            Job::Ping | Job::ReleaseResources => 0,
            Job::InspectSource { source } => source.size_hint() / 1024,
            Job::RenderBatch { source, .. } => source.size_hint() / 1024,
            Job::RenderPage { source, .. } => source.size_hint() / 1024,
            Job::Synthesize { text, .. } => text.chars().count() as u64,
        }
    }
}

/// The envelope actually written to the wire.
#[derive(Debug, Serialize)]
pub struct JobEnvelope<'a> {
    target: &'static str,
    pub id: u64,
    #[serde(flatten)]
    job: &'a Job,
}

impl<'a> JobEnvelope<'a> {
    pub fn new(id: u64, job: &'a Job) -> Self {
        JobEnvelope {
            target: "worker",
            id,
            job,
        }
    }

    /// Serialise to a single wire line (no trailing newline).
    pub fn to_line(&self) -> Result<String, CallFailure> {
        serde_json::to_string(self).map_err(|e| CallFailure::Malformed {
            detail: format!("could not serialise job '{}': {e}", self.job.kind()),
        })
    }
}

/// Correlation id of a reply line, if it has one.
///
/// Lines without an id (worker chatter, log spill on stdout) are ignored
/// by the router rather than treated as errors.
pub fn reply_id(value: &Value) -> Option<u64> {
    value.get("id").and_then(Value::as_u64)
}

/// Validate the reply shape and the `success` flag.
///
/// Returns the whole reply object so kind-specific helpers can pull their
/// fields out of it.
pub fn parse_reply(value: Value) -> Result<Value, CallFailure> {
    let Some(obj) = value.as_object() else {
        return Err(CallFailure::Malformed {
            detail: format!("reply is not an object: {value}"),
        });
    };
    match obj.get("success").and_then(Value::as_bool) {
        Some(true) => Ok(value),
        Some(false) => {
            let message = obj
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("worker reported failure without detail")
                .to_string();
            Err(CallFailure::Rejected { message })
        }
        None => Err(CallFailure::Malformed {
            detail: "reply has no boolean 'success' flag".to_string(),
        }),
    }
}

// ─── Typed reply payloads ─────────────────────────────────────────────────

/// Reply to [`Job::InspectSource`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectReply {
    pub page_count: usize,
    /// One box per page, in page order.
    pub boxes: Vec<PageBox>,
    /// Chrome offsets the worker wants excluded from captures.
    #[serde(default)]
    pub hints: LayoutHints,
}

/// One rendered page inside a [`RenderReply`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPage {
    pub page_number: usize,
    pub width: u32,
    pub height: u32,
    /// Raw RGBA pixels, `width * height * 4` bytes.
    pub image: PayloadRef,
}

/// Reply to [`Job::RenderBatch`] and [`Job::RenderPage`].
///
/// The batch reply may omit pages the worker could not render; the
/// renderer records those as per-page failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderReply {
    pub pages: Vec<RenderedPage>,
}

/// Reply to [`Job::Synthesize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizeReply {
    /// Encoded audio for the submitted text.
    pub audio: PayloadRef,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Deserialise a kind-specific reply out of a validated reply object.
pub fn decode_reply<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, CallFailure> {
    serde_json::from_value(value).map_err(|e| CallFailure::Malformed {
        detail: format!("reply did not match expected shape: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_has_target_id_kind_and_payload() {
        let job = Job::Synthesize {
            text: "hello".into(),
            voice: "amber".into(),
        };
        let line = JobEnvelope::new(42, &job).to_line().unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["target"], "worker");
        assert_eq!(v["id"], 42);
        assert_eq!(v["kind"], "synthesize");
        assert_eq!(v["payload"]["voice"], "amber");
    }

    #[test]
    fn ping_envelope_omits_payload() {
        let line = JobEnvelope::new(1, &Job::Ping).to_line().unwrap();
        let v: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["kind"], "ping");
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn parse_reply_accepts_success() {
        let reply = json!({"id": 1, "success": true, "page_count": 3});
        let v = parse_reply(reply).unwrap();
        assert_eq!(v["page_count"], 3);
    }

    #[test]
    fn parse_reply_rejects_failure_with_message() {
        let reply = json!({"id": 1, "success": false, "error": "out of range"});
        match parse_reply(reply) {
            Err(CallFailure::Rejected { message }) => assert_eq!(message, "out of range"),
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn parse_reply_flags_non_objects_and_missing_flags() {
        assert!(matches!(
            parse_reply(json!("nope")),
            Err(CallFailure::Malformed { .. })
        ));
        assert!(matches!(
            parse_reply(json!({"id": 1})),
            Err(CallFailure::Malformed { .. })
        ));
    }

    #[test]
    fn long_running_split_matches_job_kinds() {
        assert!(!Job::Ping.is_long_running());
        assert!(!Job::ReleaseResources.is_long_running());
        assert!(Job::Synthesize {
            text: String::new(),
            voice: String::new()
        }
        .is_long_running());
    }

    #[test]
    fn synthesize_costs_one_unit_per_character() {
        let job = Job::Synthesize {
            text: "a".repeat(50_000),
            voice: "amber".into(),
        };
        assert_eq!(job.cost_units(), 50_000);
    }

    #[test]
    fn degenerate_boxes_detected() {
        assert!(PageBox {
            width: 0.0,
            height: 100.0
        }
        .is_degenerate());
        assert!(PageBox {
            width: f64::NAN,
            height: 100.0
        }
        .is_degenerate());
        assert!(!PageBox {
            width: 612.0,
            height: 792.0
        }
        .is_degenerate());
    }

    #[test]
    fn reply_id_ignores_chatter() {
        assert_eq!(reply_id(&json!({"id": 9, "success": true})), Some(9));
        assert_eq!(reply_id(&json!({"log": "worker started"})), None);
        assert_eq!(reply_id(&json!(null)), None);
    }
}
