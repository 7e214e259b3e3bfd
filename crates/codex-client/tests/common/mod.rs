use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

/// One-connection fake app-server. Frames the client sends arrive on the
/// returned receiver as parsed JSON; raw strings pushed into the sender are
/// written to the client verbatim (so tests can emit malformed frames).
pub async fn spawn_fake_server() -> (
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
                        // Test dropped the sender: close the socket.
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            let _ = sink.close().await;
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

/// Reply to a request frame with a `result`, echoing its id and omitting the
/// `jsonrpc` marker when asked (the live server sometimes does).
pub fn response_for(request: &Value, result: Value, with_marker: bool) -> String {
    let id = request.get("id").cloned().unwrap_or(Value::Null);
    let body = if with_marker {
        serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": result })
    } else {
        serde_json::json!({ "id": id, "result": result })
    };
    body.to_string()
}
