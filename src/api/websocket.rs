use crate::api::types::*;
use crate::registry::StorageRecord;
use crate::service::Deployer;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, Duration};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(deployer): State<Arc<Deployer>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, deployer))
}

/// Progress for records that are active or whose status changed since the last poll.
fn changed_progress(
    records: &[StorageRecord],
    last_seen: &mut HashMap<u64, StorageProgress>,
) -> Vec<StorageProgress> {
    let mut updates = Vec::new();
    for record in records {
        let progress = StorageProgress::from(record);
        let changed = last_seen.get(&record.id) != Some(&progress);
        if changed || !record.status.is_terminal() || record.is_upgrading() {
            updates.push(progress.clone());
        }
        last_seen.insert(record.id, progress);
    }
    last_seen.retain(|id, _| records.iter().any(|r| r.id == *id));
    updates
}

fn catalog_snapshot(deployer: &Deployer) -> CatalogSnapshot {
    let status = deployer.get_releases_full_status();
    CatalogSnapshot {
        timestamp: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        releases_count: status.releases_count,
        pending_downloads: status.pending_downloads,
        completed_downloads: status.completed_downloads,
        failed_downloads: status.failed_downloads,
        default_version_key: status.default_version_key.into(),
        storage_deployer_running: deployer.is_storage_deployer_running(),
    }
}

async fn send_json(socket: &mut WebSocket, msg: &WebSocketMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::warn!("Failed to encode websocket message: {}", e);
            true
        }
    }
}

async fn handle_websocket(mut socket: WebSocket, deployer: Arc<Deployer>) {
    let mut tick = interval(Duration::from_millis(500));
    let mut last_seen = HashMap::new();

    loop {
        tokio::select! {
            _ = tick.tick() => {
                match deployer.all_storages().await {
                    Ok(records) => {
                        for progress in changed_progress(&records, &mut last_seen) {
                            let msg = WebSocketMessage::StorageProgress(progress);
                            if !send_json(&mut socket, &msg).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let msg = WebSocketMessage::Error(ErrorResponse {
                            error: e.to_string(),
                            code: "INTERNAL_ERROR".to_string(),
                        });
                        if !send_json(&mut socket, &msg).await {
                            return;
                        }
                    }
                }

                let snapshot = WebSocketMessage::CatalogSnapshot(catalog_snapshot(&deployer));
                if !send_json(&mut socket, &snapshot).await {
                    return;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "ping"
                            && socket.send(Message::Text("pong".to_string())).await.is_err() {
                                return;
                            }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
