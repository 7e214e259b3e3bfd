//! Lossy normalization of app-server items and notifications into the fixed
//! downstream item schema.
//!
//! The upstream schema drifts across releases (camelCase vs snake_case tags,
//! strings vs nested content blocks), so extraction here is tolerant by
//! construction: unknown shapes degrade to plan items rather than vanishing.

use durango_protocol::{ClientMessage, CommandStatus, DurangoItem};
use serde_json::Value;

use crate::config::current_timestamp_ms;

/// Normalized turn lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

/// Assigns `{id, timestamp}` pairs to emitted items. Live forwarding stamps
/// wall-clock time; hydration replay hands out a strictly increasing series
/// so playback order survives.
#[derive(Debug)]
pub enum Stamper {
    Live,
    Replay { next: u64 },
}

impl Stamper {
    pub fn replay_starting_at(start: u64) -> Self {
        Self::Replay { next: start }
    }

    pub(crate) fn stamp(&mut self) -> (String, u64) {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = match self {
            Self::Live => current_timestamp_ms(),
            Self::Replay { next } => {
                let t = *next;
                *next += 1;
                t
            }
        };
        (id, timestamp)
    }
}

/// Recursive text extraction. Strings are taken as-is, arrays newline-join
/// their non-empty extractions, and objects yield the first of `text`,
/// `value`, `delta`, `summaryText`, then recurse into `content`, `summary`,
/// `output`.
pub fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Array(entries) => {
            let parts: Vec<String> = entries
                .iter()
                .filter_map(extract_text)
                .filter(|part| !part.trim().is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join("\n"))
            }
        }
        Value::Object(map) => {
            for key in ["text", "value", "delta", "summaryText"] {
                if let Some(Value::String(text)) = map.get(key) {
                    return Some(text.clone());
                }
            }
            for key in ["content", "summary", "output"] {
                if let Some(inner) = map.get(key) {
                    if let Some(text) = extract_text(inner) {
                        return Some(text);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn normalize_status(raw: &str) -> Option<TurnStatus> {
    match raw.trim().to_lowercase().as_str() {
        "in_progress" | "inprogress" | "running" | "queued" => Some(TurnStatus::Running),
        "completed" | "complete" | "success" | "succeeded" => Some(TurnStatus::Completed),
        "cancelled" | "canceled" | "aborted" | "interrupted" => Some(TurnStatus::Interrupted),
        "failed" | "error" | "errored" => Some(TurnStatus::Failed),
        _ => None,
    }
}

/// Commands only have three downstream states; everything unrecognized is
/// treated as failed.
pub fn normalize_command_status(raw: &str) -> CommandStatus {
    match normalize_status(raw) {
        Some(TurnStatus::Running) => CommandStatus::Running,
        Some(TurnStatus::Completed) => CommandStatus::Completed,
        _ => CommandStatus::Failed,
    }
}

/// Turn statuses stay unmapped when unrecognized; the caller decides whether
/// to synthesize anything.
pub fn normalize_turn_status(raw: &str) -> Option<TurnStatus> {
    normalize_status(raw)
}

fn item_kind(raw: &Value) -> Option<String> {
    raw.get("type")
        .and_then(Value::as_str)
        .map(|kind| kind.to_lowercase().replace('_', ""))
}

fn text_from(raw: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find_map(extract_text)
        .filter(|text| !text.trim().is_empty())
}

fn command_text(raw: &Value) -> Option<String> {
    match raw.get("command") {
        Some(Value::String(command)) => Some(command.clone()),
        Some(Value::Array(argv)) => {
            let parts: Vec<&str> = argv.iter().filter_map(Value::as_str).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        Some(other) => extract_text(other),
        None => None,
    }
    .filter(|command| !command.trim().is_empty())
}

fn exit_code_of(raw: &Value) -> Option<i32> {
    raw.get("exitCode")
        .or_else(|| raw.get("exit_code"))
        .and_then(Value::as_i64)
        .map(|code| code as i32)
}

/// Map one upstream item to zero or more downstream items. Unknown types are
/// preserved losslessly as a plan item carrying the raw JSON.
pub fn map_item(raw: &Value, turn_id: &str, stamper: &mut Stamper) -> Vec<DurangoItem> {
    let Some(kind) = item_kind(raw) else {
        return vec![plan_fallback(raw, turn_id, stamper)];
    };

    match kind.as_str() {
        "usermessage" => text_from(raw, &["content", "text"])
            .map(|text| {
                let (id, timestamp) = stamper.stamp();
                vec![DurangoItem::UserMessage {
                    id,
                    turn_id: turn_id.to_string(),
                    timestamp,
                    text,
                }]
            })
            .unwrap_or_default(),
        "agentmessage" | "assistantmessage" => text_from(raw, &["text", "content"])
            .map(|text| {
                let (id, timestamp) = stamper.stamp();
                vec![DurangoItem::AgentMessage {
                    id,
                    turn_id: turn_id.to_string(),
                    timestamp,
                    text,
                }]
            })
            .unwrap_or_default(),
        "reasoning" => {
            let source = raw.get("summary").or_else(|| raw.get("content"));
            let summary: Vec<String> = source
                .and_then(extract_text)
                .map(|text| {
                    text.lines()
                        .map(str::trim)
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            if summary.is_empty() {
                return Vec::new();
            }
            let (id, timestamp) = stamper.stamp();
            vec![DurangoItem::Reasoning {
                id,
                turn_id: turn_id.to_string(),
                timestamp,
                summary,
            }]
        }
        "commandexecution" => {
            let Some(command) = command_text(raw) else {
                return Vec::new();
            };
            let status = normalize_command_status(
                raw.get("status").and_then(Value::as_str).unwrap_or(""),
            );
            let (id, timestamp) = stamper.stamp();
            vec![DurangoItem::CommandExecution {
                id,
                turn_id: turn_id.to_string(),
                timestamp,
                command,
                cwd: raw
                    .get("cwd")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status,
                output: raw
                    .get("output")
                    .or_else(|| raw.get("aggregatedOutput"))
                    .and_then(extract_text),
                exit_code: exit_code_of(raw),
            }]
        }
        "filechange" => {
            let Some(changes) = raw.get("changes").and_then(Value::as_array) else {
                return Vec::new();
            };
            changes
                .iter()
                .filter_map(|change| {
                    let path = change.get("path").and_then(Value::as_str)?;
                    let patch = change
                        .get("patch")
                        .or_else(|| change.get("diff"))
                        .and_then(extract_text)
                        .unwrap_or_else(|| "(no patch text)".to_string());
                    let (id, timestamp) = stamper.stamp();
                    Some(DurangoItem::FileChange {
                        id,
                        turn_id: turn_id.to_string(),
                        timestamp,
                        path: path.to_string(),
                        patch,
                    })
                })
                .collect()
        }
        "plan" => text_from(raw, &["text", "content"])
            .map(|text| {
                let (id, timestamp) = stamper.stamp();
                vec![DurangoItem::Plan {
                    id,
                    turn_id: turn_id.to_string(),
                    timestamp,
                    text,
                }]
            })
            .unwrap_or_default(),
        _ => vec![plan_fallback(raw, turn_id, stamper)],
    }
}

fn plan_fallback(raw: &Value, turn_id: &str, stamper: &mut Stamper) -> DurangoItem {
    let (id, timestamp) = stamper.stamp();
    DurangoItem::Plan {
        id,
        turn_id: turn_id.to_string(),
        timestamp,
        text: raw.to_string(),
    }
}

fn param_str<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| params.get(*key))
        .and_then(Value::as_str)
}

fn codex_thread_id(params: &Value) -> Option<String> {
    param_str(params, &["threadId", "thread_id", "codexThreadId"])
        .map(str::to_string)
        .or_else(|| {
            params
                .get("thread")
                .and_then(|thread| thread.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

fn turn_id_of(params: &Value) -> String {
    param_str(params, &["turnId", "turn_id"])
        .map(str::to_string)
        .or_else(|| {
            params
                .get("turn")
                .and_then(|turn| turn.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Translate one agent notification into relay frames. `resolve` looks up
/// the downstream thread id for an agent thread id; unbound threads are
/// dropped wholesale.
pub fn forward_notification(
    method: &str,
    params: Option<&Value>,
    machine_id: &str,
    resolve: impl Fn(&str) -> Option<String>,
) -> Vec<ClientMessage> {
    let Some(params) = params else {
        return Vec::new();
    };
    let Some(agent_thread_id) = codex_thread_id(params) else {
        return Vec::new();
    };
    let Some(thread_id) = resolve(&agent_thread_id) else {
        return Vec::new();
    };

    let method_lower = method.to_lowercase();
    let turn_id = turn_id_of(params);

    if method_lower.starts_with("thread/")
        && (method_lower.contains("updated")
            || method_lower.contains("renamed")
            || method_lower.contains("title"))
    {
        let title = text_from(params, &["title", "name"]).or_else(|| {
            params
                .get("thread")
                .and_then(|thread| text_from(thread, &["title", "name"]))
        });
        return match title {
            Some(title) => vec![ClientMessage::ThreadUpdate {
                machine_id: machine_id.to_string(),
                thread_id,
                title,
            }],
            None => Vec::new(),
        };
    }

    let upsert = |item: DurangoItem| ClientMessage::EventUpsert {
        request_id: item.turn_id().to_string(),
        machine_id: machine_id.to_string(),
        thread_id: thread_id.clone(),
        run_id: None,
        item,
    };

    match method_lower.as_str() {
        "item/started" => {
            let Some(item) = params.get("item") else {
                return Vec::new();
            };
            // Started items are suppressed except command executions; other
            // kinds carry their content only on completion.
            map_item(item, &turn_id, &mut Stamper::Live)
                .into_iter()
                .filter(|mapped| matches!(mapped, DurangoItem::CommandExecution { .. }))
                .map(upsert)
                .collect()
        }
        "item/completed" => {
            let Some(item) = params.get("item") else {
                return Vec::new();
            };
            map_item(item, &turn_id, &mut Stamper::Live)
                .into_iter()
                .map(upsert)
                .collect()
        }
        "turn/completed" => {
            let raw_status = params
                .get("turn")
                .and_then(|turn| turn.get("status"))
                .or_else(|| params.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if matches!(normalize_turn_status(raw_status), Some(TurnStatus::Completed)) {
                return Vec::new();
            }
            let message = params
                .get("error")
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str);
            let text = match message {
                Some(message) => format!("turn ended with status {raw_status}: {message}"),
                None => format!("turn ended with status {raw_status}"),
            };
            let (id, timestamp) = Stamper::Live.stamp();
            vec![upsert(DurangoItem::Plan {
                id,
                turn_id: turn_id.clone(),
                timestamp,
                text,
            })]
        }
        "thread/started" | "turn/started" => Vec::new(),
        _ if method_lower.contains("delta") || method_lower.contains("updated") => Vec::new(),
        _ => {
            // Catch-all: surface unknown notifications rather than dropping
            // them silently.
            let text = serde_json::json!({ "method": method, "params": params }).to_string();
            let (id, timestamp) = Stamper::Live.stamp();
            vec![upsert(DurangoItem::Plan {
                id,
                turn_id: turn_id.clone(),
                timestamp,
                text,
            })]
        }
    }
}
