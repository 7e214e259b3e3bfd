//! Typed operations and process management for the Codex app-server.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::transport::{
    CONNECT_ATTEMPT_TIMEOUT, CONNECT_OVERALL_TIMEOUT, JsonRpcTransport, Notification, WireLog,
};
use crate::types::*;

/// Probe window for an already-running app-server before spawning one.
const EXISTING_PROBE_TIMEOUT: Duration = Duration::from_millis(1500);
const CONNECT_RETRY_PAUSE: Duration = Duration::from_millis(250);

const LIST_LIMIT_MAX: u32 = 100;
const LIST_PAGES_MAX: u32 = 20;

/// Known-benign app-server stderr noise, matched against normalized lines.
const BENIGN_STDERR_MARKERS: &[&str] = &[
    "skipping stale rollout",
    "failed to remove stale rollout",
    "stale rollout file detected",
];

#[derive(Debug, Clone)]
pub struct CodexClientConfig {
    /// WebSocket URL the app-server listens on.
    pub server_url: String,
    /// Explicit binary path; otherwise resolved from `PATH`.
    pub bin: Option<PathBuf>,
    pub client_name: String,
    pub client_version: String,
    /// Mirror every frame to this JSONL file.
    pub wire_log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub limit: u32,
    pub max_pages: u32,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            limit: 50,
            max_pages: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ThreadStartOptions {
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub approval_policy: Option<AskForApproval>,
    pub sandbox: Option<SandboxMode>,
}

#[derive(Debug, Clone, Default)]
pub struct TurnStartOptions {
    pub prompt: Option<String>,
    pub input: Vec<UserInput>,
    pub model: Option<String>,
    pub effort: Option<ReasoningEffort>,
    pub approval_policy: Option<AskForApproval>,
    pub sandbox: Option<SandboxMode>,
}

pub struct CodexClient {
    transport: JsonRpcTransport,
    process: tokio::sync::Mutex<Option<Child>>,
    user_agent: String,
}

impl CodexClient {
    /// Attach to a running app-server, or spawn one and wait for it to
    /// answer. Completes `initialize` before returning, so every other
    /// request is safe to issue immediately.
    pub async fn start(config: CodexClientConfig) -> Result<(Self, mpsc::Receiver<Notification>)> {
        let wire_log = config.wire_log_path.clone().map(WireLog::new);

        let (transport, notifications, process) = match JsonRpcTransport::connect(
            &config.server_url,
            EXISTING_PROBE_TIMEOUT,
            wire_log.clone(),
        )
        .await
        {
            Ok((transport, notifications)) => {
                tracing::info!(url = %config.server_url, "attached to existing app-server");
                (transport, notifications, None)
            }
            Err(_) => {
                let mut child = spawn_app_server(&config)?;
                let (transport, notifications) =
                    connect_with_retry(&config.server_url, &mut child, wire_log).await?;
                (transport, notifications, Some(child))
            }
        };

        let user_agent = initialize(&transport, &config).await?;
        Ok((
            Self {
                transport,
                process: tokio::sync::Mutex::new(process),
                user_agent,
            },
            notifications,
        ))
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn list_threads(&self, options: ListOptions) -> Result<Vec<ThreadSummary>> {
        let limit = options.limit.clamp(1, LIST_LIMIT_MAX);
        let max_pages = options.max_pages.clamp(1, LIST_PAGES_MAX);
        let mut threads = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..max_pages {
            let params = ThreadListParams {
                cursor: cursor.clone(),
                limit: Some(limit),
            };
            let page: ThreadListResponse =
                self.transport.request("thread/list", Some(&params)).await?;
            if page.data.is_empty() {
                break;
            }
            threads.extend(page.data);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(threads)
    }

    pub async fn list_models(&self, options: ListOptions) -> Result<Vec<ModelInfo>> {
        let limit = options.limit.clamp(1, LIST_LIMIT_MAX);
        let max_pages = options.max_pages.clamp(1, LIST_PAGES_MAX);
        let mut models = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..max_pages {
            let params = ModelListParams {
                cursor: cursor.clone(),
                limit: Some(limit),
            };
            let page: ModelListResponse =
                self.transport.request("model/list", Some(&params)).await?;
            if page.data.is_empty() {
                break;
            }
            models.extend(page.data);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(models)
    }

    pub async fn thread_start(&self, options: ThreadStartOptions) -> Result<ThreadStartResponse> {
        let params = ThreadStartParams {
            model: options.model,
            cwd: options.cwd,
            approval_policy: Some(options.approval_policy.unwrap_or(AskForApproval::Never)),
            sandbox: Some(options.sandbox.unwrap_or(SandboxMode::DangerFullAccess)),
            experimental_raw_events: true,
        };
        self.transport.request("thread/start", Some(&params)).await
    }

    /// Returns the raw response: thread history shapes vary across releases
    /// and are interpreted by the hydration layer.
    pub async fn thread_read(&self, thread_id: &str) -> Result<Value> {
        let params = ThreadReadParams {
            thread_id: thread_id.to_string(),
            include_turns: true,
        };
        self.transport.request("thread/read", Some(&params)).await
    }

    pub async fn turn_start(
        &self,
        thread_id: &str,
        options: TurnStartOptions,
    ) -> Result<TurnStartResponse> {
        let mut input = Vec::new();
        if let Some(prompt) = options.prompt {
            let trimmed = prompt.trim();
            if !trimmed.is_empty() {
                input.push(UserInput::Text {
                    text: trimmed.to_string(),
                    text_elements: Vec::new(),
                });
            }
        }
        input.extend(options.input);
        if input.is_empty() {
            bail!("turn/start requires at least one input item");
        }

        let params = TurnStartParams {
            thread_id: thread_id.to_string(),
            input,
            model: options.model,
            effort: options.effort,
            approval_policy: options.approval_policy,
            sandbox: options.sandbox,
        };
        self.transport.request("turn/start", Some(&params)).await
    }

    /// Best-effort cancel of the thread's active turn.
    pub async fn turn_interrupt(&self, thread_id: &str) -> Result<()> {
        let params = TurnInterruptParams {
            thread_id: thread_id.to_string(),
        };
        let _: Value = self
            .transport
            .request("turn/interrupt", Some(&params))
            .await?;
        Ok(())
    }

    pub async fn get_auth_status(&self) -> Result<AuthStatusResponse> {
        self.transport
            .request::<Value, _>("getAuthStatus", None)
            .await
    }

    /// Tear down: close the socket (rejecting pending requests) and signal
    /// any spawned app-server to terminate.
    pub async fn shutdown(&self) {
        self.transport.close().await;
        if let Some(mut child) = self.process.lock().await.take() {
            terminate_child(&mut child).await;
        }
    }
}

async fn initialize(transport: &JsonRpcTransport, config: &CodexClientConfig) -> Result<String> {
    let params = InitializeParams {
        client_info: ClientInfo {
            name: config.client_name.clone(),
            title: None,
            version: config.client_version.clone(),
        },
        capabilities: Some(InitializeCapabilities {
            experimental_api: true,
        }),
    };
    match transport
        .request::<_, InitializeResponse>("initialize", Some(&params))
        .await
    {
        Ok(response) => {
            transport.notify::<Value>("initialized", None).await?;
            Ok(response.user_agent)
        }
        // A pre-existing server may already be initialized by another client.
        Err(err) if format!("{err:#}").contains("Already initialized") => {
            transport.notify::<Value>("initialized", None).await?;
            Ok(String::new())
        }
        Err(err) => Err(err.context("app-server initialize failed")),
    }
}

fn spawn_app_server(config: &CodexClientConfig) -> Result<Child> {
    let program = match &config.bin {
        Some(path) => path.clone(),
        None => which::which("codex").context("codex executable not found on PATH")?,
    };

    let mut cmd = Command::new(&program);
    cmd.arg("app-server")
        .arg("--listen")
        .arg(&config.server_url)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn app-server from {}", program.display()))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if is_benign_stderr(&line) {
                    tracing::debug!(line = %normalize_stderr_line(&line), "app-server stderr (suppressed)");
                } else if !line.trim().is_empty() {
                    tracing::warn!(line = %normalize_stderr_line(&line), "app-server stderr");
                }
            }
        });
    }
    // Keep the pipe drained so the child never blocks on a full stdout.
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if !line.trim().is_empty() {
                    tracing::debug!(line = %line, "app-server stdout");
                }
            }
        });
    }

    tracing::info!(program = %program.display(), url = %config.server_url, "spawned app-server");
    Ok(child)
}

async fn connect_with_retry(
    url: &str,
    child: &mut Child,
    wire_log: Option<WireLog>,
) -> Result<(JsonRpcTransport, mpsc::Receiver<Notification>)> {
    let deadline = Instant::now() + CONNECT_OVERALL_TIMEOUT;
    loop {
        match JsonRpcTransport::connect(url, CONNECT_ATTEMPT_TIMEOUT, wire_log.clone()).await {
            Ok(pair) => return Ok(pair),
            Err(err) => {
                if let Some(status) = child.try_wait().context("app-server wait failed")? {
                    bail!(
                        "app-server exited during startup with {} ({})",
                        status,
                        err
                    );
                }
                if Instant::now() >= deadline {
                    return Err(err.context(format!(
                        "app-server did not answer within {}s",
                        CONNECT_OVERALL_TIMEOUT.as_secs()
                    )));
                }
                tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
            }
        }
    }
}

async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        return;
    }

    let _ = child.kill().await;
}

pub(crate) fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Strip ANSI escapes, collapse whitespace runs, and lowercase. Stderr
/// arrives colored and arbitrarily chunked; matching happens on this
/// normalized form only.
pub fn normalize_stderr_line(line: &str) -> String {
    let stripped = strip_ansi(line);
    let mut normalized = String::with_capacity(stripped.len());
    let mut last_was_space = true;
    for ch in stripped.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                normalized.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                normalized.push(lower);
            }
            last_was_space = false;
        }
    }
    while normalized.ends_with(' ') {
        normalized.pop();
    }
    normalized
}

pub fn is_benign_stderr(line: &str) -> bool {
    let normalized = normalize_stderr_line(line);
    BENIGN_STDERR_MARKERS
        .iter()
        .any(|marker| normalized.contains(marker))
}

fn strip_ansi(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\u{1b}' {
            output.push(ch);
            continue;
        }
        match chars.peek() {
            // CSI: ESC [ parameters, terminated by 0x40-0x7e
            Some('[') => {
                chars.next();
                for next in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&next) {
                        break;
                    }
                }
            }
            // OSC: ESC ] ... terminated by BEL or ESC \
            Some(']') => {
                chars.next();
                while let Some(next) = chars.next() {
                    if next == '\u{07}' {
                        break;
                    }
                    if next == '\u{1b}' {
                        if chars.peek() == Some(&'\\') {
                            chars.next();
                        }
                        break;
                    }
                }
            }
            // Two-character sequences (ESC c, ESC 7, ...)
            Some(_) => {
                chars.next();
            }
            None => {}
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_strips_ansi_and_collapses_whitespace() {
        let line = "\u{1b}[33mWARN\u{1b}[0m   Skipping \t stale   ROLLOUT  file ";
        assert_eq!(
            normalize_stderr_line(line),
            "warn skipping stale rollout file"
        );
    }

    #[test]
    fn benign_markers_match_after_normalization() {
        assert!(is_benign_stderr(
            "\u{1b}[2m2024-01-01\u{1b}[0m Skipping stale rollout at /tmp/r.json"
        ));
        assert!(is_benign_stderr("FAILED  to remove STALE rollout file"));
        assert!(!is_benign_stderr("error: connection refused"));
    }

    #[test]
    fn osc_sequences_are_removed() {
        let line = "\u{1b}]0;title\u{07}stale rollout file detected";
        assert!(is_benign_stderr(line));
    }

    #[test]
    fn list_options_default_matches_bootstrap_contract() {
        let options = ListOptions::default();
        assert_eq!(options.limit, 50);
        assert_eq!(options.max_pages, 10);
    }
}
