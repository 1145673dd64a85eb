use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 变体统计，按需计算，不持久化
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    /// 活跃会话数
    pub active_sessions: usize,
    /// 活跃会话占所有活跃会话的比例
    pub active_share: f64,
    /// 配置的目标份额(0..1)
    pub share: f64,
}

/// 节点状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub id: String,
    pub server: String,
    pub load: f64,
    pub open_connections: i64,
    pub max_connections: usize,
}

/// 变体状态
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStatus {
    pub id: String,
    pub stats: Stats,
    pub nodes: Vec<NodeStatus>,
    /// 该变体缓存的静态资源数
    pub cached_items: usize,
}

/// 整体状态快照，供外部监控使用
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub id: String,
    /// 会话表中的会话数（包括尚未清理的过期会话）
    pub sessions: usize,
    pub variants: Vec<VariantStatus>,
    pub generated_at: DateTime<Utc>,
}
