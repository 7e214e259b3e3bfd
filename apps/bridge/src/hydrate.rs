//! Reconstructs historical turn state from `thread/read` responses.
//!
//! The response shape varies across app-server releases: turns may sit under
//! `turns`, under a paginated `turnsPage.data`/`turns_page.data`, or the
//! thread may carry a bare `items` array with no turn envelope at all. The
//! walk below is a bounded breadth-first search over those shapes.

use std::collections::{HashSet, VecDeque};

use durango_protocol::{ClientMessage, CommandStatus, DurangoItem};
use serde_json::Value;

use crate::config::current_timestamp_ms;
use crate::translate::{Stamper, TurnStatus, extract_text, map_item, normalize_turn_status};

/// Keys descended through while searching for turn containers.
const DESCENT_KEYS: &[&str] = &["thread", "result", "payload", "response"];

#[derive(Debug)]
pub struct HydrationOutcome {
    pub messages: Vec<ClientMessage>,
    pub imported_item_count: usize,
}

struct TurnRecord {
    id: String,
    items: Vec<Value>,
    raw: Value,
}

/// Replay a `thread/read` response as `event.upsert` frames for the relay.
pub fn hydrate_thread(
    response: &Value,
    downstream_thread_id: &str,
    machine_id: &str,
) -> HydrationOutcome {
    let turns = collect_turns(response);

    let start = current_timestamp_ms().saturating_sub((turns.len() as u64 * 100).max(1));
    let mut stamper = Stamper::replay_starting_at(start);
    let mut messages = Vec::new();
    let mut imported = 0usize;

    for turn in &turns {
        let mut has_running_activity = false;
        let mut turn_item_count = 0usize;

        for raw_item in &turn.items {
            let mut mapped = map_item(raw_item, &turn.id, &mut stamper);
            if mapped.is_empty() {
                // Content is never silently lost: degrade to a plan item.
                let text = extract_text(raw_item)
                    .filter(|text| !text.trim().is_empty())
                    .unwrap_or_else(|| raw_item.to_string());
                let (id, timestamp) = stamper.stamp();
                mapped.push(DurangoItem::Plan {
                    id,
                    turn_id: turn.id.clone(),
                    timestamp,
                    text,
                });
            }
            for item in mapped {
                if matches!(
                    item,
                    DurangoItem::CommandExecution {
                        status: CommandStatus::Running,
                        ..
                    }
                ) {
                    has_running_activity = true;
                }
                messages.push(upsert(machine_id, downstream_thread_id, item));
                imported += 1;
                turn_item_count += 1;
            }
        }

        if let Some(status) = terminal_status(&turn.raw, has_running_activity, turn_item_count) {
            let text = serde_json::json!({
                "method": "turn/completed",
                "params": { "status": status.as_str() }
            })
            .to_string();
            let (id, timestamp) = stamper.stamp();
            messages.push(upsert(
                machine_id,
                downstream_thread_id,
                DurangoItem::Plan {
                    id,
                    turn_id: turn.id.clone(),
                    timestamp,
                    text,
                },
            ));
            imported += 1;
        }
    }

    HydrationOutcome {
        messages,
        imported_item_count: imported,
    }
}

fn upsert(machine_id: &str, thread_id: &str, item: DurangoItem) -> ClientMessage {
    ClientMessage::EventUpsert {
        request_id: item.turn_id().to_string(),
        machine_id: machine_id.to_string(),
        thread_id: thread_id.to_string(),
        run_id: None,
        item,
    }
}

/// Infer the turn's terminal status. Explicit candidates win; `running`
/// suppresses synthesis; a turn that imported items but carries no status at
/// all is assumed completed. A status that is present but unrecognized
/// synthesizes nothing: guessing a mapping would misreport the turn.
fn terminal_status(
    turn: &Value,
    has_running_activity: bool,
    imported_items: usize,
) -> Option<TurnStatus> {
    let candidates = [
        turn.get("status"),
        turn.get("result").and_then(|v| v.get("status")),
        turn.get("turn").and_then(|v| v.get("status")),
        turn.get("metadata").and_then(|v| v.get("status")),
    ];
    let mut saw_status = false;
    for candidate in candidates.into_iter().flatten() {
        let Some(raw) = candidate.as_str() else {
            continue;
        };
        saw_status = true;
        if let Some(status) = normalize_turn_status(raw) {
            return match status {
                TurnStatus::Running => None,
                terminal => Some(terminal),
            };
        }
    }
    if saw_status {
        return None;
    }

    if has_running_activity {
        None
    } else if imported_items > 0 {
        Some(TurnStatus::Completed)
    } else {
        None
    }
}

fn collect_turns(response: &Value) -> Vec<TurnRecord> {
    let mut queue: VecDeque<&Value> = VecDeque::new();
    let mut visited: HashSet<*const Value> = HashSet::new();
    queue.push_back(response);

    while let Some(node) = queue.pop_front() {
        let Some(map) = node.as_object() else {
            continue;
        };
        if !visited.insert(node as *const Value) {
            continue;
        }

        if let Some(turns) = map.get("turns").and_then(Value::as_array) {
            return turns.iter().map(normalize_turn_entry).collect();
        }
        let page = map
            .get("turnsPage")
            .or_else(|| map.get("turns_page"))
            .and_then(|page| page.get("data"))
            .and_then(Value::as_array);
        if let Some(turns) = page {
            return turns.iter().map(normalize_turn_entry).collect();
        }
        if let Some(items) = map.get("items").and_then(Value::as_array) {
            // A bare item list: treat the node itself as a single turn.
            let id = map
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            return vec![TurnRecord {
                id,
                items: items.clone(),
                raw: node.clone(),
            }];
        }

        for key in DESCENT_KEYS {
            if let Some(child) = map.get(*key) {
                queue.push_back(child);
            }
        }
        if let Some(data) = map.get("data") {
            if !data.is_array() {
                queue.push_back(data);
            }
        }
    }

    Vec::new()
}

fn normalize_turn_entry(entry: &Value) -> TurnRecord {
    if entry.is_object() {
        let id = entry
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        TurnRecord {
            id,
            items: items_of_turn(entry),
            raw: entry.clone(),
        }
    } else {
        TurnRecord {
            id: uuid::Uuid::new_v4().to_string(),
            items: vec![entry.clone()],
            raw: entry.clone(),
        }
    }
}

/// First non-empty array among the known item containers, else a wrapped
/// singular `item`/`message`, else nothing.
fn items_of_turn(turn: &Value) -> Vec<Value> {
    for key in ["items", "events", "messages", "output", "content"] {
        if let Some(entries) = turn.get(key).and_then(Value::as_array) {
            if !entries.is_empty() {
                return entries.to_vec();
            }
        }
    }
    for key in ["item", "message"] {
        if let Some(single) = turn.get(key) {
            return vec![single.clone()];
        }
    }
    Vec::new()
}
