use std::any::Any;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::error;

use crate::handlers::api::{get_status, proxy_request};
use crate::services::Sessions;

// 应用程序状态
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<Sessions>,
}

// 配置路由：状态接口 + 其余请求全部反向代理
pub fn app_routes(sessions: Arc<Sessions>, status_path: &str) -> Router {
    let state = AppState { sessions };

    Router::new()
        .route(status_path, get(get_status))
        .fallback(proxy_request)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(handle_panic)),
        )
}

// 单个请求panic时只中止该请求，不泄露内部信息
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("请求处理panic: {}", detail);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}
