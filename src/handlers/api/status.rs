use axum::{extract::State, Json};
use tracing::debug;

use crate::models::Status;
use crate::routes::api::AppState;

/// 节点负载和变体统计
pub async fn get_status(State(state): State<AppState>) -> Json<Status> {
    let status = state.sessions.status();
    debug!("状态查询: {} 个会话", status.sessions);
    Json(status)
}
