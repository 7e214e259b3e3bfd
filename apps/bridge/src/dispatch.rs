//! Per-dispatch state machine: ack(accepted) → action → ack(running) →
//! ack(completed | failed).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use codex_client::{CodexClient, ListOptions, ThreadStartOptions, TurnStartOptions, UserInput};
use durango_protocol::{
    AckStatus, Attachment, ClientMessage, DispatchAction, ErrorCode, ErrorEnvelope,
};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use crate::hydrate::hydrate_thread;

const ATTACHMENT_NAME_MAX: usize = 120;

/// Shared handles a dispatch task needs. Cloned per inbound request.
#[derive(Clone)]
pub struct DispatchContext {
    pub machine_id: String,
    pub agent: Arc<CodexClient>,
    /// Agent thread id → downstream thread id.
    pub bindings: Arc<Mutex<HashMap<String, String>>>,
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl DispatchContext {
    fn ack(
        &self,
        request_id: &str,
        status: AckStatus,
        error: Option<ErrorEnvelope>,
        payload: Option<Value>,
    ) {
        let _ = self.outbound.send(ClientMessage::DispatchAck {
            request_id: request_id.to_string(),
            machine_id: self.machine_id.clone(),
            status,
            error,
            payload,
        });
    }
}

/// Drive one dispatch to a terminal ack. Never returns an error: failures
/// become `dispatch.ack { status: failed }`.
pub async fn handle_dispatch(ctx: DispatchContext, action: DispatchAction) {
    let request_id = action.request_id().to_string();
    let name = action.name();
    ctx.ack(&request_id, AckStatus::Accepted, None, None);

    match run_action(&ctx, action).await {
        Ok(payload) => {
            ctx.ack(&request_id, AckStatus::Completed, None, Some(payload));
        }
        Err(err) => {
            tracing::warn!(request_id = %request_id, action = name, error = %format!("{err:#}"), "dispatch failed");
            ctx.ack(
                &request_id,
                AckStatus::Failed,
                Some(ErrorEnvelope {
                    code: ErrorCode::AppServerError,
                    message: format!("{err:#}"),
                    details: None,
                }),
                None,
            );
        }
    }
}

async fn run_action(ctx: &DispatchContext, action: DispatchAction) -> Result<Value> {
    match action {
        DispatchAction::ThreadStart {
            request_id,
            thread_id,
            cwd,
            prompt,
            attachments,
            model,
        } => {
            ctx.ack(&request_id, AckStatus::Running, None, None);
            require_input(&prompt, &attachments)?;

            let started = ctx
                .agent
                .thread_start(ThreadStartOptions {
                    cwd: cwd.clone(),
                    model: model.clone(),
                    ..Default::default()
                })
                .await?;
            let codex_thread_id = started.thread.id.clone();
            ctx.bindings
                .lock()
                .await
                .insert(codex_thread_id.clone(), thread_id);

            let input =
                materialize_attachments(&upload_base(cwd.as_deref()), &request_id, &attachments)
                    .await?;
            ctx.agent
                .turn_start(
                    &codex_thread_id,
                    TurnStartOptions {
                        prompt,
                        input,
                        model,
                        ..Default::default()
                    },
                )
                .await?;

            Ok(json!({ "codexThreadId": codex_thread_id, "state": "started" }))
        }
        DispatchAction::ThreadHydrate {
            request_id,
            thread_id,
            codex_thread_id,
        } => {
            ctx.ack(&request_id, AckStatus::Running, None, None);
            ctx.bindings
                .lock()
                .await
                .insert(codex_thread_id.clone(), thread_id.clone());

            let response = ctx.agent.thread_read(&codex_thread_id).await?;
            let outcome = hydrate_thread(&response, &thread_id, &ctx.machine_id);
            for message in outcome.messages {
                let _ = ctx.outbound.send(message);
            }

            Ok(json!({
                "state": "hydrated",
                "importedItemCount": outcome.imported_item_count
            }))
        }
        DispatchAction::TurnStart {
            request_id,
            thread_id,
            codex_thread_id,
            cwd,
            prompt,
            attachments,
            model,
        } => {
            ctx.ack(&request_id, AckStatus::Running, None, None);
            require_input(&prompt, &attachments)?;

            ctx.bindings
                .lock()
                .await
                .insert(codex_thread_id.clone(), thread_id);

            let input =
                materialize_attachments(&upload_base(cwd.as_deref()), &request_id, &attachments)
                    .await?;
            ctx.agent
                .turn_start(
                    &codex_thread_id,
                    TurnStartOptions {
                        prompt,
                        input,
                        model,
                        ..Default::default()
                    },
                )
                .await?;

            Ok(json!({ "state": "started" }))
        }
        DispatchAction::ModelList { request_id } => {
            ctx.ack(&request_id, AckStatus::Running, None, None);
            let models = ctx.agent.list_models(ListOptions::default()).await?;
            Ok(json!({ "models": models }))
        }
        DispatchAction::TurnInterrupt {
            request_id,
            codex_thread_id,
        } => {
            ctx.ack(&request_id, AckStatus::Running, None, None);
            ctx.agent.turn_interrupt(&codex_thread_id).await?;
            Ok(json!({ "state": "interrupted" }))
        }
    }
}

fn require_input(prompt: &Option<String>, attachments: &[Attachment]) -> Result<()> {
    let has_prompt = prompt
        .as_deref()
        .map(|prompt| !prompt.trim().is_empty())
        .unwrap_or(false);
    if !has_prompt && attachments.is_empty() {
        bail!("turn/start requires prompt text or at least one attachment.");
    }
    Ok(())
}

fn upload_base(cwd: Option<&str>) -> PathBuf {
    cwd.map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

/// Sanitized basename: `[A-Za-z0-9._-]` only, at most 120 characters,
/// defaulting to "attachment".
pub fn safe_attachment_name(original: Option<&str>) -> String {
    let basename = original
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(|name| name.to_str())
        .unwrap_or("");
    let sanitized: String = basename
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .take(ATTACHMENT_NAME_MAX)
        .collect();
    if sanitized.is_empty() {
        "attachment".to_string()
    } else {
        sanitized
    }
}

/// Write each attachment under `<base>/.durango/uploads/<requestId>/` and
/// return the matching turn input items: images become `localImage`,
/// everything else a `mention` keeping its original name.
pub async fn materialize_attachments(
    base: &Path,
    request_id: &str,
    attachments: &[Attachment],
) -> Result<Vec<UserInput>> {
    if attachments.is_empty() {
        return Ok(Vec::new());
    }

    let dir = base.join(".durango").join("uploads").join(request_id);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create upload dir {}", dir.display()))?;

    let mut input = Vec::with_capacity(attachments.len());
    for (index, attachment) in attachments.iter().enumerate() {
        let file_name = format!(
            "{:02}-{}",
            index + 1,
            safe_attachment_name(attachment.name.as_deref())
        );
        let path = dir.join(&file_name);
        let bytes = BASE64_STANDARD
            .decode(attachment.data.as_bytes())
            .with_context(|| format!("attachment {file_name} is not valid base64"))?;
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write attachment {}", path.display()))?;

        if attachment.kind == "image" {
            input.push(UserInput::LocalImage { path });
        } else {
            input.push(UserInput::Mention {
                name: attachment
                    .name
                    .clone()
                    .unwrap_or_else(|| file_name.clone()),
                path: path.display().to_string(),
            });
        }
    }

    Ok(input)
}
