//! Server-side enrichment for hook ingress.
//!
//! Producers stay trivial: they POST whatever the hook runtime handed them
//! and the pipeline maps kebab-case hook names onto canonical event types,
//! normalizes snake_case payload fields into the per-type camelCase shape,
//! and truncates oversized previews before the envelope is built.

use beacon_protocol::{create_event, Envelope, EventContext, Source};
use serde_json::{Map, Value};

const PREVIEW_MAX_CHARS: usize = 2000;
const PREVIEW_ELLIPSIS: &str = "...";

/// Server defaults applied when the payload does not carry its own
/// app label or working directory.
#[derive(Debug, Clone)]
pub struct EnrichDefaults {
    pub app: String,
    pub app_root: String,
}

/// Outcome of running a raw hook payload through the pipeline.
#[derive(Debug)]
pub enum Enriched {
    Event(Envelope),
    /// Recursion guard tripped: acknowledge with 200 and emit nothing.
    Skipped { reason: &'static str },
}

/// Map a kebab-case hook name and parsed payload to an envelope.
pub fn enrich(name: &str, payload: &Map<String, Value>, defaults: &EnrichDefaults) -> Enriched {
    // A stop hook that reports stop_hook_active is itself running inside a
    // stop hook; emitting would re-trigger it.
    if name == "stop" && payload.get("stop_hook_active").and_then(Value::as_bool) == Some(true) {
        return Enriched::Skipped {
            reason: "stop_hook_active",
        };
    }

    let hook_event = kebab_to_snake(name);
    let event_type = canonical_type(name, &hook_event);
    let data = normalize_payload(&event_type, &hook_event, payload);

    let ctx = EventContext {
        app: payload
            .get("app")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&defaults.app)
            .to_string(),
        app_root: payload
            .get("cwd")
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or(&defaults.app_root)
            .to_string(),
        source: Source::Hook,
        correlation_id: payload
            .get("correlation_id")
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    Enriched::Event(create_event(&event_type, data, &ctx))
}

/// Known names map to the canonical table; unknown names fall through to
/// the forward-compatible `hook.<snake>` form.
fn canonical_type(name: &str, hook_event: &str) -> String {
    match name {
        "session-start" => "hook.session_start".to_string(),
        "pre-tool-use" => "hook.pre_tool_use".to_string(),
        "post-tool-use" => "hook.post_tool_use".to_string(),
        "post-tool-use-failure" => "hook.post_tool_use_failure".to_string(),
        "stop" => "hook.stop".to_string(),
        _ => format!("hook.{}", hook_event),
    }
}

fn kebab_to_snake(name: &str) -> String {
    name.to_ascii_lowercase().replace('-', "_")
}

fn normalize_payload(event_type: &str, hook_event: &str, payload: &Map<String, Value>) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("hookEvent".to_string(), Value::String(hook_event.to_string()));
    copy_string(payload, "session_id", &mut data, "sessionId");

    match event_type {
        "hook.session_start" => {
            copy_string(payload, "source", &mut data, "source");
            copy_string(payload, "model", &mut data, "model");
            copy_string(payload, "agent_type", &mut data, "agentType");
        }
        "hook.pre_tool_use" | "hook.post_tool_use" | "hook.post_tool_use_failure" => {
            copy_string(payload, "tool_name", &mut data, "toolName");
            copy_string(payload, "tool_use_id", &mut data, "toolUseId");
            copy_string(payload, "permission_mode", &mut data, "permissionMode");
            if let Some(input) = payload.get("tool_input") {
                data.insert("toolInputPreview".to_string(), preview(input));
            }
            let result = payload
                .get("tool_response")
                .or_else(|| payload.get("tool_result"))
                .or_else(|| payload.get("error"));
            if let Some(result) = result {
                data.insert("toolResultPreview".to_string(), preview(result));
            }
        }
        "hook.stop" => {
            copy_string(payload, "transcript_path", &mut data, "transcriptPath");
        }
        // Unmapped names keep their payload verbatim so new hook kinds
        // survive the pipeline without a mapping entry.
        _ => {
            for (key, value) in payload {
                if matches!(key.as_str(), "cwd" | "app" | "correlation_id" | "session_id") {
                    continue;
                }
                data.insert(key.clone(), value.clone());
            }
        }
    }

    data
}

fn copy_string(payload: &Map<String, Value>, from: &str, data: &mut Map<String, Value>, to: &str) {
    if let Some(value) = payload.get(from).and_then(Value::as_str) {
        data.insert(to.to_string(), Value::String(value.to_string()));
    }
}

/// Serialize a routed value to JSON and cap it at the preview length.
fn preview(value: &Value) -> Value {
    let serialized = value.to_string();
    if serialized.chars().count() > PREVIEW_MAX_CHARS {
        let prefix: String = serialized.chars().take(PREVIEW_MAX_CHARS).collect();
        Value::String(format!("{}{}", prefix, PREVIEW_ELLIPSIS))
    } else {
        Value::String(serialized)
    }
}
