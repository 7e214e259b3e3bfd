//! Session-start reconciliation: push known projects to the relay, then bind
//! already-existing agent threads to their projects.

use std::collections::HashMap;
use std::sync::Arc;

use codex_client::{CodexClient, ListOptions};
use durango_protocol::{ClientMessage, ThreadRecord};
use tokio::sync::{Mutex, mpsc};

use crate::config::{BridgeConfig, current_timestamp_ms};
use crate::projects::{ProjectRegistration, find_project_for_cwd, load_projects};

const THREAD_TITLE_MAX: usize = 120;
const FALLBACK_THREAD_TITLE: &str = "Imported Codex thread";

pub async fn run_sync_bootstrap(
    config: &BridgeConfig,
    agent: &Arc<CodexClient>,
    bindings: &Arc<Mutex<HashMap<String, String>>>,
    outbound: &mpsc::UnboundedSender<ClientMessage>,
) {
    let projects = match load_projects(&config.config_dir) {
        Ok(projects) => projects
            .into_iter()
            .filter(|project| project.machine_id == config.machine_id)
            .collect::<Vec<_>>(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to load project manifest; skipping registration");
            Vec::new()
        }
    };

    register_projects(config, &projects).await;

    let threads = match agent
        .list_threads(ListOptions {
            limit: 50,
            max_pages: 10,
        })
        .await
    {
        Ok(threads) => threads,
        Err(err) => {
            tracing::warn!(error = %format!("{err:#}"), "thread discovery failed; aborting bootstrap");
            return;
        }
    };

    let mut bound = 0usize;
    for thread in &threads {
        let Some(cwd) = thread.cwd.as_ref().and_then(|cwd| cwd.to_str()) else {
            continue;
        };
        let Some(project) = find_project_for_cwd(&projects, cwd) else {
            continue;
        };

        let downstream_id = format!("codex:{}", thread.id);
        bindings
            .lock()
            .await
            .insert(thread.id.clone(), downstream_id.clone());

        let record = ThreadRecord {
            id: downstream_id,
            project_id: project.id.clone(),
            codex_thread_id: thread.id.clone(),
            title: derive_thread_title(&thread.preview),
            status: "active".to_string(),
            created_at: normalize_timestamp_ms(thread.created_at),
            updated_at: normalize_timestamp_ms(thread.updated_at),
        };
        let _ = outbound.send(ClientMessage::ThreadUpsert {
            machine_id: config.machine_id.clone(),
            thread: record,
        });
        bound += 1;
    }

    tracing::info!(
        discovered = threads.len(),
        bound,
        "bootstrap thread discovery finished"
    );
}

async fn register_projects(config: &BridgeConfig, projects: &[ProjectRegistration]) {
    if projects.is_empty() {
        tracing::info!(registered = 0, "no projects to register");
        return;
    }

    let client = reqwest::Client::new();
    let url = format!(
        "{}/v1/projects/register",
        config.relay_url.trim_end_matches('/')
    );
    let mut registered = 0usize;

    for project in projects {
        let result = client
            .post(&url)
            .bearer_auth(&config.token)
            .json(&serde_json::json!({ "project": project }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => registered += 1,
            Ok(response) => {
                tracing::warn!(
                    project = %project.id,
                    status = %response.status(),
                    "project registration rejected"
                );
            }
            Err(err) => {
                tracing::warn!(project = %project.id, error = %err, "project registration failed");
            }
        }
    }

    tracing::info!(registered, total = projects.len(), "registered projects");
}

/// First non-empty preview line, whitespace-collapsed and bounded.
fn derive_thread_title(preview: &str) -> String {
    let line = preview
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty());
    let Some(line) = line else {
        return FALLBACK_THREAD_TITLE.to_string();
    };
    line.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(THREAD_TITLE_MAX)
        .collect()
}

/// Second↔millisecond heuristic: values below 10^12 are seconds. Non-finite
/// or non-positive inputs fall back to now.
pub fn normalize_timestamp_ms(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return current_timestamp_ms();
    }
    if value < 1e12 {
        (value * 1000.0).round() as u64
    } else {
        value.round() as u64
    }
}
