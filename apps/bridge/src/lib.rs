//! Durango bridge daemon.
//!
//! Holds one session with the relay and one with the local Codex app-server,
//! translating relay dispatches into agent calls and agent notifications into
//! the relay's normalized item stream.

pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod hydrate;
pub mod projects;
pub mod relay;
pub mod session;
pub mod translate;
