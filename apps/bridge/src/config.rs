//! Bridge configuration: credentials written by the login command, with
//! environment overrides. Read once at startup and never mutated.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_RELAY_URL: &str = "DURANGO_RELAY_URL";
pub const ENV_WEB_URL: &str = "DURANGO_WEB_URL";
pub const ENV_APP_SERVER_URL: &str = "DURANGO_CODEX_APP_SERVER_URL";
pub const ENV_CODEX_BIN: &str = "DURANGO_CODEX_BIN";
pub const ENV_CONFIG_DIR: &str = "DURANGO_CONFIG_DIR";
pub const ENV_WIRE_LOG: &str = "DURANGO_WIRE_LOG";
pub const ENV_CODEX_VERSION: &str = "CODEX_VERSION";

const DEFAULT_RELAY_URL: &str = "https://relay.durango.dev";
const DEFAULT_WEB_URL: &str = "https://durango.dev";
const DEFAULT_APP_SERVER_URL: &str = "ws://127.0.0.1:48765";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no credentials at {0}; run the login command first")]
    MissingCredentials(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("credentials file is missing `{0}`")]
    MissingField(&'static str),
}

/// On-disk shape owned by the login command; consumed read-only here.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsFile {
    #[serde(default)]
    machine_id: String,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub machine_id: String,
    pub user_id: String,
    pub token: String,
    pub relay_url: String,
    pub web_url: String,
    pub app_server_url: String,
    pub codex_bin: Option<PathBuf>,
    pub codex_version: Option<String>,
    pub wire_log_path: Option<PathBuf>,
    pub config_dir: PathBuf,
}

impl BridgeConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(&|key| std::env::var(key).ok())
    }

    pub(crate) fn load_with(
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let config_dir = env(ENV_CONFIG_DIR)
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".durango")))
            .unwrap_or_else(|| PathBuf::from(".durango"));

        let credentials_path = config_dir.join("config.json");
        if !credentials_path.exists() {
            return Err(ConfigError::MissingCredentials(credentials_path));
        }
        let raw = std::fs::read_to_string(&credentials_path).map_err(|source| ConfigError::Io {
            path: credentials_path.clone(),
            source,
        })?;
        let credentials: CredentialsFile =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: credentials_path.clone(),
                source,
            })?;

        if credentials.machine_id.trim().is_empty() {
            return Err(ConfigError::MissingField("machineId"));
        }
        if credentials.user_id.trim().is_empty() {
            return Err(ConfigError::MissingField("userId"));
        }
        if credentials.token.trim().is_empty() {
            return Err(ConfigError::MissingField("token"));
        }

        Ok(Self {
            machine_id: credentials.machine_id,
            user_id: credentials.user_id,
            token: credentials.token,
            relay_url: env(ENV_RELAY_URL).unwrap_or_else(|| DEFAULT_RELAY_URL.to_string()),
            web_url: env(ENV_WEB_URL).unwrap_or_else(|| DEFAULT_WEB_URL.to_string()),
            app_server_url: env(ENV_APP_SERVER_URL)
                .unwrap_or_else(|| DEFAULT_APP_SERVER_URL.to_string()),
            codex_bin: env(ENV_CODEX_BIN).map(PathBuf::from),
            codex_version: env(ENV_CODEX_VERSION),
            wire_log_path: env(ENV_WIRE_LOG).map(PathBuf::from),
            config_dir,
        })
    }

    /// WebSocket endpoint of the relay session: `<relay>/ws` with the scheme
    /// switched to ws/wss.
    pub fn relay_ws_url(&self) -> String {
        let base = self.relay_url.trim_end_matches('/');
        let converted = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{converted}/ws")
    }
}

pub(crate) fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
