use std::sync::Arc;
use tokio::time::interval;
use variant_balancer::{
    config::{AppConfig, BalancerConfig},
    routes::api::app_routes,
    services::Sessions,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载配置
    let config = AppConfig::from_env()?;

    // 初始化日志，RUST_LOG 优先于 LOG_LEVEL；生产环境输出JSON
    let registry = tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.server.log_level.clone()),
    ));
    if config.is_production() {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("应用启动中...");
    info!("环境: {:?}", config.environment);

    // 加载变体配置
    info!("加载变体配置: {}", config.balancer_config_path.display());
    let balancer_config = BalancerConfig::from_file(&config.balancer_config_path)?;
    let sessions = Arc::new(Sessions::new(
        &balancer_config,
        &config.cache,
        config.server.max_request_body,
    )?);

    // 启动定期清理任务
    let sessions_clone = sessions.clone();
    let cleanup_interval = config.cache.cleanup_interval();
    tokio::spawn(async move {
        let mut interval = interval(cleanup_interval);
        loop {
            interval.tick().await;
            let (expired_sessions, expired_items) = sessions_clone.purge_expired();
            if expired_sessions > 0 || expired_items > 0 {
                info!(
                    "清理过期会话 {} 个, 过期缓存 {} 个",
                    expired_sessions, expired_items
                );
            }
        }
    });

    // 创建路由
    let app = app_routes(sessions, &config.server.status_path);

    // 启动服务器
    let addr = config.socket_addr()?;
    info!("Starting server on {}", addr);
    info!("状态接口: {}", config.server.status_path);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("服务已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("监听退出信号失败: {}", e);
    }
}
