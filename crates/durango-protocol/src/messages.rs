use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::items::DurangoItem;

/// Error codes shared by `dispatch.ack` and `session.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MachineOffline,
    CodexUnauthenticated,
    ProjectNotFound,
    DispatchTimeout,
    AppServerError,
    Unauthorized,
    ValidationError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Dispatch acknowledgement ladder. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineDescriptor {
    pub machine_id: String,
    pub user_id: String,
    pub hostname: String,
    pub platform: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub cli_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codex_version: Option<String>,
}

/// Thread row pushed to the relay during bootstrap discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub id: String,
    pub project_id: String,
    pub codex_thread_id: String,
    pub title: String,
    pub status: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// An upload carried inside a dispatch. The bridge materializes `data`
/// (base64) to disk and never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub data: String,
}

/// Relay-originated command. The `type` tag doubles as the action name used
/// in diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DispatchAction {
    #[serde(rename = "thread.start", rename_all = "camelCase")]
    ThreadStart {
        request_id: String,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    #[serde(rename = "thread.hydrate", rename_all = "camelCase")]
    ThreadHydrate {
        request_id: String,
        thread_id: String,
        codex_thread_id: String,
    },
    #[serde(rename = "turn.start", rename_all = "camelCase")]
    TurnStart {
        request_id: String,
        thread_id: String,
        codex_thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    #[serde(rename = "model.list", rename_all = "camelCase")]
    ModelList { request_id: String },
    #[serde(rename = "turn.interrupt", rename_all = "camelCase")]
    TurnInterrupt {
        request_id: String,
        codex_thread_id: String,
    },
}

impl DispatchAction {
    pub fn request_id(&self) -> &str {
        match self {
            Self::ThreadStart { request_id, .. }
            | Self::ThreadHydrate { request_id, .. }
            | Self::TurnStart { request_id, .. }
            | Self::ModelList { request_id }
            | Self::TurnInterrupt { request_id, .. } => request_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ThreadStart { .. } => "thread.start",
            Self::ThreadHydrate { .. } => "thread.hydrate",
            Self::TurnStart { .. } => "turn.start",
            Self::ModelList { .. } => "model.list",
            Self::TurnInterrupt { .. } => "turn.interrupt",
        }
    }
}

/// Frames the bridge sends to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "machine.hello", rename_all = "camelCase")]
    MachineHello {
        token: String,
        machine: MachineDescriptor,
    },
    #[serde(rename = "machine.heartbeat", rename_all = "camelCase")]
    MachineHeartbeat { machine_id: String, timestamp: u64 },
    #[serde(rename = "dispatch.ack", rename_all = "camelCase")]
    DispatchAck {
        request_id: String,
        machine_id: String,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorEnvelope>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
    #[serde(rename = "event.upsert", rename_all = "camelCase")]
    EventUpsert {
        request_id: String,
        machine_id: String,
        thread_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        item: DurangoItem,
    },
    #[serde(rename = "thread.update", rename_all = "camelCase")]
    ThreadUpdate {
        machine_id: String,
        thread_id: String,
        title: String,
    },
    #[serde(rename = "thread.upsert", rename_all = "camelCase")]
    ThreadUpsert {
        machine_id: String,
        thread: ThreadRecord,
    },
}

/// Frames the relay sends to the bridge. Unknown `type` tags are skipped by
/// the caller before deserializing into this union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "session.ready", rename_all = "camelCase")]
    SessionReady {
        machine_id: String,
        user_id: String,
        heartbeat_interval_ms: u64,
    },
    #[serde(rename = "dispatch.request", rename_all = "camelCase")]
    DispatchRequest { action: DispatchAction },
    #[serde(rename = "session.error", rename_all = "camelCase")]
    SessionError {
        error: ErrorEnvelope,
        recoverable: bool,
    },
}
