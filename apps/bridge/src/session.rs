//! Session wiring: one agent socket, one relay socket, one loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use codex_client::{CodexClient, CodexClientConfig};
use durango_protocol::{ClientMessage, ServerMessage};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::bootstrap::run_sync_bootstrap;
use crate::config::{BridgeConfig, current_timestamp_ms};
use crate::dispatch::{DispatchContext, handle_dispatch};
use crate::relay::{InboundFrame, hello_frame, parse_server_frame};
use crate::translate::forward_notification;

type RelaySink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Run the bridge until the relay drops, a fatal session error arrives, or a
/// termination signal fires. Blocks for the whole process lifetime.
pub async fn run(config: BridgeConfig) -> Result<()> {
    let (agent, mut notifications) = CodexClient::start(CodexClientConfig {
        server_url: config.app_server_url.clone(),
        bin: config.codex_bin.clone(),
        client_name: "durango-bridge".to_string(),
        client_version: env!("CARGO_PKG_VERSION").to_string(),
        wire_log_path: config.wire_log_path.clone(),
    })
    .await
    .context("agent session failed to start")?;
    let agent = Arc::new(agent);
    tracing::info!(user_agent = %agent.user_agent(), "agent session established");

    match agent.get_auth_status().await {
        Ok(status) => tracing::info!(
            auth_method = status.auth_method.as_deref().unwrap_or("unknown"),
            authenticated = status.authenticated.unwrap_or(false),
            "agent auth status"
        ),
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "could not read agent auth status");
        }
    }

    let ws_url = config.relay_ws_url();
    let (socket, _response) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect to relay at {ws_url}"))?;
    tracing::info!(url = %ws_url, "connected to relay");
    let (mut sink, mut stream) = socket.split();

    // machine.hello is the first client frame on the wire.
    send_frame(&mut sink, &hello_frame(&config)).await?;

    let bindings: Arc<Mutex<HashMap<String, String>>> = Arc::default();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let ctx = DispatchContext {
        machine_id: config.machine_id.clone(),
        agent: agent.clone(),
        bindings: bindings.clone(),
        outbound: outbound_tx.clone(),
    };

    let mut heartbeat_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut fatal: Option<anyhow::Error> = None;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let Some(frame) = inbound else {
                    tracing::info!("relay disconnected");
                    break;
                };
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => {
                        tracing::info!("relay closed the session");
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "relay socket error");
                        break;
                    }
                };
                match parse_server_frame(&text) {
                    InboundFrame::Message(ServerMessage::SessionReady {
                        machine_id,
                        user_id,
                        heartbeat_interval_ms,
                    }) => {
                        tracing::info!(machine_id = %machine_id, user_id = %user_id, "relay session ready");
                        if let Some(task) = heartbeat_task.take() {
                            task.abort();
                        }
                        heartbeat_task = Some(spawn_heartbeat(
                            config.machine_id.clone(),
                            Duration::from_millis(heartbeat_interval_ms)
                                .max(MIN_HEARTBEAT_INTERVAL),
                            outbound_tx.clone(),
                        ));

                        let bootstrap_config = config.clone();
                        let bootstrap_agent = agent.clone();
                        let bootstrap_bindings = bindings.clone();
                        let bootstrap_outbound = outbound_tx.clone();
                        tokio::spawn(async move {
                            run_sync_bootstrap(
                                &bootstrap_config,
                                &bootstrap_agent,
                                &bootstrap_bindings,
                                &bootstrap_outbound,
                            )
                            .await;
                        });
                    }
                    InboundFrame::Message(ServerMessage::DispatchRequest { action }) => {
                        tokio::spawn(handle_dispatch(ctx.clone(), action));
                    }
                    InboundFrame::Message(ServerMessage::SessionError { error, recoverable }) => {
                        if recoverable {
                            tracing::warn!(code = ?error.code, message = %error.message, "recoverable session error");
                        } else {
                            tracing::error!(code = ?error.code, message = %error.message, "fatal session error");
                            fatal = Some(anyhow!("relay session error: {}", error.message));
                            break;
                        }
                    }
                    InboundFrame::Ignored(kind) => {
                        tracing::debug!(kind = %kind, "ignoring relay frame");
                    }
                    InboundFrame::Invalid => {}
                }
            }
            notification = notifications.recv() => {
                let Some(notification) = notification else {
                    fatal = Some(anyhow!("agent session closed unexpectedly"));
                    break;
                };
                let frames = {
                    let guard = bindings.lock().await;
                    forward_notification(
                        &notification.method,
                        notification.params.as_ref(),
                        &config.machine_id,
                        |id| guard.get(id).cloned(),
                    )
                };
                for frame in frames {
                    let _ = outbound_tx.send(frame);
                }
            }
            outbound = outbound_rx.recv() => {
                let Some(frame) = outbound else { continue };
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    tracing::warn!(error = %format!("{err:#}"), "relay send failed");
                    break;
                }
            }
            _ = &mut shutdown => {
                tracing::info!("termination signal received; shutting down");
                break;
            }
        }
    }

    if let Some(task) = heartbeat_task.take() {
        task.abort();
    }
    let _ = sink.close().await;
    agent.shutdown().await;
    tracing::info!("bridge stopped");

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn send_frame(sink: &mut RelaySink, frame: &ClientMessage) -> Result<()> {
    let payload = serde_json::to_string(frame).context("relay frame encode failed")?;
    sink.send(Message::Text(payload))
        .await
        .context("relay write failed")
}

fn spawn_heartbeat(
    machine_id: String,
    period: Duration,
    outbound: mpsc::UnboundedSender<ClientMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + period;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let frame = ClientMessage::MachineHeartbeat {
                machine_id: machine_id.clone(),
                timestamp: current_timestamp_ms(),
            };
            if outbound.send(frame).is_err() {
                break;
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::warn!(error = %err, "failed to register SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
