use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

/// 负载均衡器错误
#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    /// 配置无效
    #[error("配置错误: {0}")]
    Config(String),
    /// 没有可用的节点
    #[error("没有可以处理请求的节点")]
    NoNode,
    /// 缓存项为空，绝不能当作成功响应返回
    #[error("缓存项为空")]
    EmptyCacheItem,
    /// 等待其他请求填充缓存超时
    #[error("等待缓存填充超时")]
    PopulateTimeout,
    /// 上游请求失败
    #[error("上游请求失败: {0}")]
    Upstream(#[from] reqwest::Error),
    /// 入站请求无法转发
    #[error("无效的请求: {0}")]
    InvalidRequest(String),
    /// 后台任务异常退出
    #[error("后台任务失败: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for BalancerError {
    fn into_response(self) -> Response {
        // 细节只写日志，不返回给客户端
        error!("请求处理失败: {}", self);
        match self {
            BalancerError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "Bad Request").into_response()
            }
            BalancerError::PopulateTimeout => {
                (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response(),
        }
    }
}
