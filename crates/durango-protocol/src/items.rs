use serde::{Deserialize, Serialize};

/// Terminal and in-flight states of a command execution item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Completed,
    Failed,
}

/// One observable event within a turn, normalized for the web product.
///
/// The schema is frozen: new upstream item kinds are folded into `Plan`
/// rather than growing this union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DurangoItem {
    #[serde(rename_all = "camelCase")]
    UserMessage {
        id: String,
        turn_id: String,
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    AgentMessage {
        id: String,
        turn_id: String,
        timestamp: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Reasoning {
        id: String,
        turn_id: String,
        timestamp: u64,
        summary: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    CommandExecution {
        id: String,
        turn_id: String,
        timestamp: u64,
        command: String,
        cwd: String,
        status: CommandStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    #[serde(rename_all = "camelCase")]
    FileChange {
        id: String,
        turn_id: String,
        timestamp: u64,
        path: String,
        patch: String,
    },
    #[serde(rename_all = "camelCase")]
    Plan {
        id: String,
        turn_id: String,
        timestamp: u64,
        text: String,
    },
}

impl DurangoItem {
    pub fn turn_id(&self) -> &str {
        match self {
            Self::UserMessage { turn_id, .. }
            | Self::AgentMessage { turn_id, .. }
            | Self::Reasoning { turn_id, .. }
            | Self::CommandExecution { turn_id, .. }
            | Self::FileChange { turn_id, .. }
            | Self::Plan { turn_id, .. } => turn_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::UserMessage { timestamp, .. }
            | Self::AgentMessage { timestamp, .. }
            | Self::Reasoning { timestamp, .. }
            | Self::CommandExecution { timestamp, .. }
            | Self::FileChange { timestamp, .. }
            | Self::Plan { timestamp, .. } => *timestamp,
        }
    }
}
