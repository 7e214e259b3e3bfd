//! Relay session plumbing: handshake frame, machine descriptor, and tolerant
//! demultiplexing of inbound frames.

use durango_protocol::{ClientMessage, MachineDescriptor, ServerMessage};
use serde_json::Value;

use crate::config::BridgeConfig;

/// Inbound relay frame after demultiplexing.
#[derive(Debug)]
pub enum InboundFrame {
    Message(ServerMessage),
    /// Valid JSON with an unhandled `type` tag.
    Ignored(String),
    Invalid,
}

pub fn machine_descriptor(config: &BridgeConfig) -> MachineDescriptor {
    MachineDescriptor {
        machine_id: config.machine_id.clone(),
        user_id: config.user_id.clone(),
        hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        os_version: os_version(),
        cli_version: env!("CARGO_PKG_VERSION").to_string(),
        codex_version: config.codex_version.clone(),
    }
}

pub fn hello_frame(config: &BridgeConfig) -> ClientMessage {
    ClientMessage::MachineHello {
        token: config.token.clone(),
        machine: machine_descriptor(config),
    }
}

/// Parse one relay text frame. Malformed JSON and schema-invalid known types
/// come back as `Invalid`; unknown types as `Ignored` so the session loop can
/// log them at debug level and move on.
pub fn parse_server_frame(raw: &str) -> InboundFrame {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "malformed relay frame");
            return InboundFrame::Invalid;
        }
    };

    let Some(kind) = value
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        tracing::warn!(frame = %raw, "relay frame without type tag");
        return InboundFrame::Invalid;
    };

    match kind.as_str() {
        "session.ready" | "dispatch.request" | "session.error" => {
            match serde_json::from_value::<ServerMessage>(value) {
                Ok(message) => InboundFrame::Message(message),
                Err(err) => {
                    tracing::warn!(error = %err, kind = %kind, "schema-invalid relay frame");
                    InboundFrame::Invalid
                }
            }
        }
        _ => InboundFrame::Ignored(kind),
    }
}

fn os_version() -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/kernel/osrelease")
            .ok()
            .map(|release| release.trim().to_string())
            .filter(|release| !release.is_empty())
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
