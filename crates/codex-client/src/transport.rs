//! Framed JSON-RPC transport over the app-server WebSocket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// Upper bound on any single request/response round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Budget for one socket-open attempt.
pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);
/// Aggregate budget for the connect retry loop.
pub const CONNECT_OVERALL_TIMEOUT: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type PendingRequests = HashMap<String, oneshot::Sender<Result<Value>>>;

/// A server-initiated frame with a `method` and no `id`.
#[derive(Debug)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Append-only JSONL mirror of every frame on the wire. Entries written
/// before the file opens are buffered in memory.
#[derive(Clone)]
pub struct WireLog {
    tx: mpsc::UnboundedSender<(&'static str, String)>,
}

impl WireLog {
    pub fn new(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, String)>();
        tokio::spawn(async move {
            let mut file: Option<tokio::fs::File> = None;
            let mut buffer: Vec<String> = Vec::new();

            while let Some((direction, raw)) = rx.recv().await {
                let entry = serde_json::json!({
                    "timestampMs": crate::client::current_timestamp_ms(),
                    "direction": direction,
                    "raw": raw,
                });
                let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());

                if file.is_none() {
                    if let Some(parent) = path.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    match tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                    {
                        Ok(opened) => file = Some(opened),
                        Err(err) => {
                            tracing::warn!(error = %err, path = %path.display(), "failed to open wire log");
                            buffer.push(line);
                            continue;
                        }
                    }
                    if let Some(opened) = file.as_mut() {
                        for buffered in buffer.drain(..) {
                            let _ = opened.write_all(buffered.as_bytes()).await;
                            let _ = opened.write_all(b"\n").await;
                        }
                    }
                }

                if let Some(opened) = file.as_mut() {
                    let _ = opened.write_all(line.as_bytes()).await;
                    let _ = opened.write_all(b"\n").await;
                }
            }
        });

        Self { tx }
    }

    fn log(&self, direction: &'static str, raw: &str) {
        let _ = self.tx.send((direction, raw.to_string()));
    }
}

pub struct JsonRpcTransport {
    writer: Arc<Mutex<WsSink>>,
    pending: Arc<Mutex<PendingRequests>>,
    reader_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    wire_log: Option<WireLog>,
}

impl JsonRpcTransport {
    /// Dial `url` once, bounded by `attempt_timeout`. Retry policy lives with
    /// the caller, which also knows whether a spawned process is still alive.
    pub async fn connect(
        url: &str,
        attempt_timeout: Duration,
        wire_log: Option<WireLog>,
    ) -> Result<(Self, mpsc::Receiver<Notification>)> {
        let (socket, _response) = tokio::time::timeout(attempt_timeout, connect_async(url))
            .await
            .map_err(|_| anyhow!("timed out connecting to app-server at {url}"))?
            .with_context(|| format!("failed to connect to app-server at {url}"))?;

        Ok(Self::from_socket(socket, wire_log))
    }

    fn from_socket(
        socket: WsStream,
        wire_log: Option<WireLog>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (sink, mut stream) = socket.split();
        let writer = Arc::new(Mutex::new(sink));
        let pending: Arc<Mutex<PendingRequests>> = Arc::new(Mutex::new(PendingRequests::new()));
        let (notification_tx, notification_rx) = mpsc::channel(256);

        let pending_for_reader = pending.clone();
        let wire_log_for_reader = wire_log.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "app-server socket error");
                        break;
                    }
                };
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(log) = &wire_log_for_reader {
                    log.log("in", trimmed);
                }

                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(error = %err, frame = %trimmed, "app-server JSON parse failed");
                        continue;
                    }
                };

                // The server sometimes omits the "jsonrpc" marker on
                // responses; classification relies on method/id alone.
                if let Some(method) = value.get("method").and_then(Value::as_str) {
                    if value.get("id").is_some() {
                        tracing::warn!(method, "unexpected inbound request from app-server; dropping");
                        continue;
                    }
                    if notification_tx
                        .send(Notification {
                            method: method.to_string(),
                            params: value.get("params").cloned(),
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    continue;
                }

                let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) else {
                    tracing::warn!(frame = %trimmed, "app-server frame has neither method nor string id");
                    continue;
                };

                let result = if let Some(error) = value.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown app-server error");
                    Err(anyhow!("{message}"))
                } else {
                    Ok(value.get("result").cloned().unwrap_or(Value::Null))
                };

                let sender = pending_for_reader.lock().await.remove(&id);
                match sender {
                    Some(sender) => {
                        let _ = sender.send(result);
                    }
                    None => tracing::warn!(id = %id, "app-server response without pending request"),
                }
            }

            let mut pending = pending_for_reader.lock().await;
            for (_, sender) in pending.drain() {
                let _ = sender.send(Err(anyhow!("client closed")));
            }
        });

        (
            Self {
                writer,
                pending,
                reader_task: std::sync::Mutex::new(Some(reader_task)),
                wire_log,
            },
            notification_rx,
        )
    }

    pub async fn request<T, R>(&self, method: &str, params: Option<&T>) -> Result<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        if let Err(err) = self.send_json(&frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let result = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(outcome) => outcome
                .unwrap_or_else(|_| Err(anyhow!("client closed")))
                .with_context(|| format!("app-server request {method} failed"))?,
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(anyhow!(
                    "app-server request {method} timed out after {}s",
                    REQUEST_TIMEOUT.as_secs()
                ));
            }
        };

        serde_json::from_value(result)
            .with_context(|| format!("app-server response to {method} had unexpected shape"))
    }

    pub async fn notify<T>(&self, method: &str, params: Option<&T>) -> Result<()>
    where
        T: Serialize,
    {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.send_json(&frame).await
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let payload = serde_json::to_string(value).context("app-server JSON encode failed")?;
        if let Some(log) = &self.wire_log {
            log.log("out", &payload);
        }
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(payload))
            .await
            .context("app-server write failed")
    }

    /// Close the socket; the reader task then rejects every pending request
    /// with "client closed".
    pub async fn close(&self) {
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        let task = self.reader_task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for JsonRpcTransport {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reader_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}
