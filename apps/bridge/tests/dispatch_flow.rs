mod common;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use durango_bridge::dispatch::handle_dispatch;
use durango_protocol::{AckStatus, Attachment, ClientMessage, DispatchAction, ErrorCode};
use serde_json::{Value, json};

use common::{error_for, response_for, start_harness};

fn expect_ack(message: ClientMessage, expected: AckStatus) -> (Option<Value>, Option<ErrorCode>) {
    match message {
        ClientMessage::DispatchAck {
            status,
            payload,
            error,
            ..
        } => {
            assert_eq!(status, expected, "unexpected ack status");
            (payload, error.map(|e| e.code))
        }
        other => panic!("expected dispatch.ack, got {other:?}"),
    }
}

#[tokio::test]
async fn model_list_acks_in_order_with_payload() {
    let mut harness = start_harness().await;

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request["method"], json!("model/list"));
            tx.send(response_for(
                &request,
                json!({"data": [{"id": "gpt-5-codex", "displayName": "GPT-5 Codex"}]}),
            ))
            .unwrap();
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::ModelList {
            request_id: "req-1".to_string(),
        },
    )
    .await;
    agent.await.unwrap();

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    let (payload, _) = expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Completed);
    let payload = payload.unwrap();
    assert_eq!(payload["models"][0]["id"], json!("gpt-5-codex"));
    assert!(harness.relay_rx.try_recv().is_err(), "terminal ack must be last");
}

#[tokio::test]
async fn agent_errors_become_failed_acks() {
    let mut harness = start_harness().await;

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let request = rx.recv().await.unwrap();
            tx.send(error_for(&request, "model registry unavailable"))
                .unwrap();
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::ModelList {
            request_id: "req-2".to_string(),
        },
    )
    .await;
    agent.await.unwrap();

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    match harness.relay_rx.recv().await.unwrap() {
        ClientMessage::DispatchAck { status, error, .. } => {
            assert_eq!(status, AckStatus::Failed);
            let error = error.unwrap();
            assert_eq!(error.code, ErrorCode::AppServerError);
            assert!(error.message.contains("model registry unavailable"));
        }
        other => panic!("expected failed ack, got {other:?}"),
    }
}

#[tokio::test]
async fn attachment_only_turn_start_sends_single_local_image() {
    let mut harness = start_harness().await;
    let workdir = tempfile::tempdir().unwrap();
    let cwd = workdir.path().display().to_string();

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request["method"], json!("turn/start"));
            assert_eq!(request["params"]["threadId"], json!("codex-thread-9"));
            let input = request["params"]["input"].as_array().unwrap().clone();
            assert_eq!(input.len(), 1, "expected exactly one input item");
            assert_eq!(input[0]["type"], json!("localImage"));
            tx.send(response_for(&request, json!({"turn": {"id": "turn-1"}})))
                .unwrap();
            input[0]["path"].as_str().unwrap().to_string()
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::TurnStart {
            request_id: "req-3".to_string(),
            thread_id: "relay-thread-9".to_string(),
            codex_thread_id: "codex-thread-9".to_string(),
            cwd: Some(cwd.clone()),
            prompt: None,
            attachments: vec![Attachment {
                kind: "image".to_string(),
                name: Some("bug screenshot.png".to_string()),
                data: BASE64_STANDARD.encode(b"fake-png"),
            }],
            model: None,
        },
    )
    .await;
    let image_path = agent.await.unwrap();

    let expected = workdir
        .path()
        .join(".durango")
        .join("uploads")
        .join("req-3")
        .join("01-bug_screenshot.png");
    assert_eq!(image_path, expected.display().to_string());
    assert_eq!(std::fs::read(&expected).unwrap(), b"fake-png");

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    let (payload, _) = expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Completed);
    assert_eq!(payload.unwrap()["state"], json!("started"));

    let bindings = harness.ctx.bindings.lock().await;
    assert_eq!(
        bindings.get("codex-thread-9").map(String::as_str),
        Some("relay-thread-9")
    );
}

#[tokio::test]
async fn empty_turn_start_fails_without_calling_agent() {
    let mut harness = start_harness().await;

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::TurnStart {
            request_id: "req-4".to_string(),
            thread_id: "relay-thread".to_string(),
            codex_thread_id: "codex-thread".to_string(),
            cwd: None,
            prompt: Some("   ".to_string()),
            attachments: Vec::new(),
            model: None,
        },
    )
    .await;

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    match harness.relay_rx.recv().await.unwrap() {
        ClientMessage::DispatchAck { status, error, .. } => {
            assert_eq!(status, AckStatus::Failed);
            assert!(
                error
                    .unwrap()
                    .message
                    .contains("turn/start requires prompt text or at least one attachment.")
            );
        }
        other => panic!("expected failed ack, got {other:?}"),
    }
    assert!(harness.agent_rx.try_recv().is_err(), "agent must not be called");
}

#[tokio::test]
async fn thread_start_binds_and_reports_codex_thread_id() {
    let mut harness = start_harness().await;

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let thread_start = rx.recv().await.unwrap();
            assert_eq!(thread_start["method"], json!("thread/start"));
            assert_eq!(thread_start["params"]["cwd"], json!("/repo"));
            tx.send(response_for(
                &thread_start,
                json!({"thread": {"id": "codex-new"}, "model": "gpt-5-codex"}),
            ))
            .unwrap();

            let turn_start = rx.recv().await.unwrap();
            assert_eq!(turn_start["method"], json!("turn/start"));
            assert_eq!(turn_start["params"]["threadId"], json!("codex-new"));
            assert_eq!(
                turn_start["params"]["input"][0]["text"],
                json!("add a readme")
            );
            tx.send(response_for(&turn_start, json!({"turn": {"id": "turn-1"}})))
                .unwrap();
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::ThreadStart {
            request_id: "req-5".to_string(),
            thread_id: "relay-new".to_string(),
            cwd: Some("/repo".to_string()),
            prompt: Some("add a readme".to_string()),
            attachments: Vec::new(),
            model: None,
        },
    )
    .await;
    agent.await.unwrap();

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    let (payload, _) = expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Completed);
    let payload = payload.unwrap();
    assert_eq!(payload["codexThreadId"], json!("codex-new"));
    assert_eq!(payload["state"], json!("started"));

    let bindings = harness.ctx.bindings.lock().await;
    assert_eq!(
        bindings.get("codex-new").map(String::as_str),
        Some("relay-new")
    );
}

#[tokio::test]
async fn thread_hydrate_replays_before_terminal_ack() {
    let mut harness = start_harness().await;

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let read = rx.recv().await.unwrap();
            assert_eq!(read["method"], json!("thread/read"));
            assert_eq!(read["params"]["threadId"], json!("codex-old"));
            assert_eq!(read["params"]["includeTurns"], json!(true));
            tx.send(response_for(
                &read,
                json!({"thread": {"turnsPage": {"data": [
                    {"id": "turn-1", "items": [{"type": "plan", "text": "ok"}]}
                ]}}}),
            ))
            .unwrap();
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::ThreadHydrate {
            request_id: "req-6".to_string(),
            thread_id: "relay-old".to_string(),
            codex_thread_id: "codex-old".to_string(),
        },
    )
    .await;
    agent.await.unwrap();

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);

    // Replayed items arrive before the terminal ack.
    for _ in 0..2 {
        match harness.relay_rx.recv().await.unwrap() {
            ClientMessage::EventUpsert { thread_id, .. } => {
                assert_eq!(thread_id, "relay-old");
            }
            other => panic!("expected event.upsert, got {other:?}"),
        }
    }
    let (payload, _) = expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Completed);
    let payload = payload.unwrap();
    assert_eq!(payload["state"], json!("hydrated"));
    assert_eq!(payload["importedItemCount"], json!(2));
}

#[tokio::test]
async fn turn_interrupt_round_trips() {
    let mut harness = start_harness().await;

    let agent = tokio::spawn({
        let tx = harness.agent_tx.clone();
        let mut rx = harness.agent_rx;
        async move {
            let request = rx.recv().await.unwrap();
            assert_eq!(request["method"], json!("turn/interrupt"));
            assert_eq!(request["params"]["threadId"], json!("codex-busy"));
            tx.send(response_for(&request, json!({}))).unwrap();
        }
    });

    handle_dispatch(
        harness.ctx.clone(),
        DispatchAction::TurnInterrupt {
            request_id: "req-7".to_string(),
            codex_thread_id: "codex-busy".to_string(),
        },
    )
    .await;
    agent.await.unwrap();

    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Accepted);
    expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Running);
    let (payload, _) = expect_ack(harness.relay_rx.recv().await.unwrap(), AckStatus::Completed);
    assert_eq!(payload.unwrap()["state"], json!("interrupted"));
}
