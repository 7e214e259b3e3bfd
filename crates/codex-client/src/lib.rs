//! Codex app-server JSON-RPC client over a local WebSocket.
//!
//! The app-server owns coding threads and emits streaming notifications; this
//! crate supplies the framed transport with request correlation, the typed
//! operations the bridge needs, and the attach-or-spawn logic for the
//! `codex app-server` process itself.

mod client;
mod transport;
mod types;

pub use client::{
    CodexClient, CodexClientConfig, ListOptions, ThreadStartOptions, TurnStartOptions,
    is_benign_stderr, normalize_stderr_line,
};
pub use transport::{
    CONNECT_ATTEMPT_TIMEOUT, CONNECT_OVERALL_TIMEOUT, JsonRpcTransport, Notification,
    REQUEST_TIMEOUT, WireLog,
};
pub use types::*;
