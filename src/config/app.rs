use serde::{Deserialize, Serialize};
use std::env;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// 应用程序配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// 环境模式
    pub environment: Environment,
    /// 服务器地址和端口
    pub server: ServerConfig,
    /// 静态资源缓存配置
    pub cache: CacheConfig,
    /// 变体配置文件路径
    pub balancer_config_path: PathBuf,
}

/// 环境模式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Testing,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "testing" => Ok(Environment::Testing),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器主机地址
    pub host: String,
    /// 服务器端口
    pub port: u16,
    /// 日志级别
    pub log_level: String,
    /// 状态接口路径
    pub status_path: String,
    /// 入站请求体上限(字节)
    pub max_request_body: usize,
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存项存活时间(秒)
    pub ttl: u64,
    /// 过期清理间隔(秒)
    pub cleanup_interval: u64,
    /// 等待其他请求填充缓存的超时(秒)
    pub populate_timeout: u64,
}

impl CacheConfig {
    /// 按存活时间推导等待超时
    pub fn with_ttl(ttl: u64, cleanup_interval: u64) -> Self {
        Self {
            ttl,
            cleanup_interval,
            populate_timeout: (ttl / 60).max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }

    pub fn populate_timeout(&self) -> Duration {
        Duration::from_secs(self.populate_timeout.max(1))
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self::with_ttl(3600, 60)
    }
}

/// 负载均衡配置（变体、节点、会话超时）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// 配置ID
    pub id: String,
    /// 会话超时(秒)
    pub session_timeout: u64,
    /// 变体列表
    pub variants: Vec<VariantConfig>,
}

/// 变体配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantConfig {
    /// 变体ID
    pub id: String,
    /// 流量份额，不要求总和为100
    pub share: f64,
    /// 后端节点
    pub nodes: Vec<NodeConfig>,
}

/// 节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 节点ID
    pub id: String,
    /// 后端地址，如 http://127.0.0.1:8081
    pub server: String,
    /// 会话Cookie名称
    pub cookie: String,
    /// 最大连接数
    pub max_connections: usize,
}

impl BalancerConfig {
    /// 从配置文件加载，格式由扩展名决定(yaml/json/toml)
    pub fn from_file(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout)
    }
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // 加载.env文件
        dotenv::dotenv().ok();

        // 解析环境
        let environment = env::var("APP_ENVIRONMENT")
            .unwrap_or_else(|_| "development".to_string())
            .parse::<Environment>()
            .unwrap_or(Environment::Development);

        // 服务器配置
        let host = env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse::<u16>()
            .unwrap_or(8080);
        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let status_path =
            env::var("STATUS_PATH").unwrap_or_else(|_| "/__balancer/status".to_string());
        if !status_path.starts_with('/') {
            return Err(config::ConfigError::Message(format!(
                "STATUS_PATH 必须以 / 开头: {}",
                status_path
            )));
        }
        let max_request_body = env::var("MAX_REQUEST_BODY")
            .unwrap_or_else(|_| "10485760".to_string())
            .parse::<usize>()
            .unwrap_or(10 * 1024 * 1024);

        // 缓存配置
        let ttl = env::var("CACHE_TTL")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .unwrap_or(3600);
        let cleanup_interval = env::var("CACHE_CLEANUP_INTERVAL")
            .unwrap_or_else(|_| "60".to_string())
            .parse::<u64>()
            .unwrap_or(60);
        let mut cache = CacheConfig::with_ttl(ttl, cleanup_interval);
        if let Some(timeout) = env::var("CACHE_POPULATE_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            cache.populate_timeout = timeout;
        }

        // 变体配置文件，命令行第一个参数优先
        let balancer_config_path = env::args()
            .nth(1)
            .or_else(|| env::var("BALANCER_CONFIG").ok())
            .unwrap_or_else(|| "balancer.yaml".to_string());

        Ok(Self {
            environment,
            server: ServerConfig {
                host,
                port,
                log_level,
                status_path,
                max_request_body,
            },
            cache,
            balancer_config_path: PathBuf::from(balancer_config_path),
        })
    }

    /// 获取Socket地址
    pub fn socket_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }
}
