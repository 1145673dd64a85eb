use axum::{
    extract::{Request, State},
    response::Response,
};

use crate::error::BalancerError;
use crate::routes::api::AppState;

/// 反向代理入口：所有未匹配的路径都转发到变体的节点
pub async fn proxy_request(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, BalancerError> {
    state.sessions.serve(request).await
}
