use std::collections::HashMap;
use std::sync::Arc;

use codex_client::{CodexClient, CodexClientConfig};
use durango_protocol::ClientMessage;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use durango_bridge::dispatch::DispatchContext;

/// One-connection fake app-server speaking the agent's JSON-RPC protocol.
/// Requests the client sends arrive on the returned receiver; raw frames
/// pushed into the sender go back verbatim.
pub async fn spawn_fake_agent() -> (
    String,
    mpsc::UnboundedReceiver<Value>,
    mpsc::UnboundedSender<String>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{addr}");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let socket = accept_async(stream).await.unwrap();
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                frame = outbound_rx.recv() => {
                    match frame {
                        Some(raw) => {
                            if sink.send(Message::Text(raw)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                                let _ = inbound_tx.send(value);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }
    });

    (url, inbound_rx, outbound_tx)
}

pub fn response_for(request: &Value, result: Value) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "result": result,
    })
    .to_string()
}

pub fn error_for(request: &Value, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "error": { "code": -32000, "message": message },
    })
    .to_string()
}

/// Autonomous responder for clients driven end-to-end: answers the
/// handshake, auth probe, and discovery calls with canned results.
pub fn script_agent_responses(
    mut inbound: mpsc::UnboundedReceiver<Value>,
    outbound: mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = inbound.recv().await {
            let Some(method) = frame.get("method").and_then(Value::as_str) else {
                continue;
            };
            let result = match method {
                "initialize" => json!({"userAgent": "codex/test"}),
                "initialized" => continue,
                "getAuthStatus" => json!({"authMethod": "chatgpt", "authenticated": true}),
                "thread/list" => json!({"data": []}),
                "model/list" => json!({"data": [{"id": "gpt-5-codex"}]}),
                _ => json!({}),
            };
            if frame.get("id").is_some() {
                let _ = outbound.send(response_for(&frame, result));
            }
        }
    })
}

pub struct TestHarness {
    pub ctx: DispatchContext,
    pub relay_rx: mpsc::UnboundedReceiver<ClientMessage>,
    pub agent_rx: mpsc::UnboundedReceiver<Value>,
    pub agent_tx: mpsc::UnboundedSender<String>,
}

/// Connected dispatch context backed by the fake agent, with an inspectable
/// relay-bound channel.
pub async fn start_harness() -> TestHarness {
    let (url, mut agent_rx, agent_tx) = spawn_fake_agent().await;

    let handshake_tx = agent_tx.clone();
    let handshake = tokio::spawn(async move {
        let request = agent_rx.recv().await.unwrap();
        handshake_tx
            .send(response_for(&request, json!({"userAgent": "codex/test"})))
            .unwrap();
        let initialized = agent_rx.recv().await.unwrap();
        assert_eq!(initialized["method"], json!("initialized"));
        agent_rx
    });

    let (agent, _notifications) = CodexClient::start(CodexClientConfig {
        server_url: url,
        bin: None,
        client_name: "durango-bridge-test".to_string(),
        client_version: "0.0.0".to_string(),
        wire_log_path: None,
    })
    .await
    .unwrap();
    let agent_rx = handshake.await.unwrap();

    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let ctx = DispatchContext {
        machine_id: "machine-test".to_string(),
        agent: Arc::new(agent),
        bindings: Arc::new(Mutex::new(HashMap::new())),
        outbound: relay_tx,
    };

    TestHarness {
        ctx,
        relay_rx,
        agent_rx,
        agent_tx,
    }
}
