use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request},
    response::Response,
};
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use rand::distributions::{Distribution, WeightedIndex};
use reqwest::Client;
use tracing::{debug, info};

use crate::config::{BalancerConfig, CacheConfig};
use crate::error::BalancerError;
use crate::models::{NodeStatus, Stats, Status, VariantStatus};
use crate::services::proxy::Proxy;
use crate::services::sniffer::request_cookie;

/// 服务变体：按份额接收流量的一组节点
#[derive(Debug)]
pub struct Variant {
    pub id: String,
    pub share: f64,
    pub proxy: Proxy,
}

/// 会话记录
#[derive(Debug, Clone)]
pub struct UserSession {
    pub variant_id: String,
    pub last_active: DateTime<Utc>,
}

impl UserSession {
    fn is_active(&self, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
        now - self.last_active <= timeout
    }
}

/// 变体注册表和会话表
#[derive(Debug)]
pub struct Sessions {
    pub id: String,
    variants: Vec<Arc<Variant>>,
    weights: WeightedIndex<f64>,
    total_share: f64,
    cookie_names: Vec<String>,
    user_sessions: DashMap<String, UserSession>,
    session_timeout: TimeDelta,
}

impl Sessions {
    pub fn new(
        config: &BalancerConfig,
        cache_config: &CacheConfig,
        max_request_body: usize,
    ) -> Result<Self, BalancerError> {
        if config.variants.is_empty() {
            return Err(BalancerError::Config("至少需要一个变体".to_string()));
        }

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BalancerError::Config(format!("创建HTTP客户端失败: {}", e)))?;

        let mut seen = HashSet::new();
        let mut cookie_names = Vec::new();
        let mut variants = Vec::with_capacity(config.variants.len());
        for variant_config in &config.variants {
            if !seen.insert(variant_config.id.as_str()) {
                return Err(BalancerError::Config(format!(
                    "变体ID重复: {}",
                    variant_config.id
                )));
            }
            if variant_config.nodes.is_empty() {
                return Err(BalancerError::Config(format!(
                    "变体 {} 没有节点",
                    variant_config.id
                )));
            }
            for node in &variant_config.nodes {
                if !cookie_names.contains(&node.cookie) {
                    cookie_names.push(node.cookie.clone());
                }
            }

            let proxy = Proxy::new(
                &variant_config.nodes,
                client.clone(),
                cache_config,
                max_request_body,
            )?;
            variants.push(Arc::new(Variant {
                id: variant_config.id.clone(),
                share: variant_config.share,
                proxy,
            }));
        }

        let weights = WeightedIndex::new(variants.iter().map(|v| v.share))
            .map_err(|e| BalancerError::Config(format!("变体份额无效: {}", e)))?;
        let total_share = variants.iter().map(|v| v.share).sum();
        let session_timeout = TimeDelta::from_std(config.session_timeout())
            .map_err(|e| BalancerError::Config(format!("会话超时无效: {}", e)))?;

        info!(
            "配置 {} 已加载: {} 个变体, 会话超时 {}秒",
            config.id,
            variants.len(),
            config.session_timeout
        );

        Ok(Self {
            id: config.id.clone(),
            variants,
            weights,
            total_share,
            cookie_names,
            user_sessions: DashMap::new(),
            session_timeout,
        })
    }

    pub fn variants(&self) -> &[Arc<Variant>] {
        &self.variants
    }

    pub fn variant(&self, id: &str) -> Option<Arc<Variant>> {
        self.variants.iter().find(|v| v.id == id).cloned()
    }

    pub fn session_timeout(&self) -> Duration {
        self.session_timeout.to_std().unwrap_or_default()
    }

    /// 按份额加权随机选择变体，每次选择相互独立
    pub fn balanced_random_variant(&self) -> Arc<Variant> {
        let index = self.weights.sample(&mut rand::thread_rng());
        self.variants[index].clone()
    }

    pub async fn serve_variant(
        &self,
        variant: &Variant,
        request: Request<Body>,
    ) -> Result<(Response, String), BalancerError> {
        variant.proxy.serve(request).await
    }

    /// 处理一个请求：找到客户端绑定的变体（没有则随机分配），转发并记录会话
    pub async fn serve(&self, request: Request<Body>) -> Result<Response, BalancerError> {
        let variant = match self.bound_variant(request.headers()) {
            Some(variant) => variant,
            None => {
                let variant = self.balanced_random_variant();
                debug!("新客户端分配到变体 {}", variant.id);
                variant
            }
        };

        let (response, session_id) = self.serve_variant(&variant, request).await?;
        if !session_id.is_empty() {
            self.touch(&session_id, &variant.id);
        }
        Ok(response)
    }

    /// 查找请求中已绑定且仍然活跃的会话所属的变体
    pub fn bound_variant(&self, headers: &HeaderMap) -> Option<Arc<Variant>> {
        let now = Utc::now();
        self.cookie_names
            .iter()
            .filter_map(|name| request_cookie(headers, name))
            .filter(|session_id| !session_id.is_empty())
            .find_map(|session_id| {
                let session = self.user_sessions.get(&session_id)?;
                if !session.is_active(now, self.session_timeout) {
                    return None;
                }
                self.variant(&session.variant_id)
            })
    }

    /// 记录或刷新会话绑定
    pub fn touch(&self, session_id: &str, variant_id: &str) {
        self.user_sessions.insert(
            session_id.to_string(),
            UserSession {
                variant_id: variant_id.to_string(),
                last_active: Utc::now(),
            },
        );
    }

    pub fn stats_for_variant(&self, variant: &Variant) -> Stats {
        let active = count_active_sessions(&self.user_sessions, self.session_timeout);
        self.build_stats(variant, &active)
    }

    /// 所有节点负载和变体统计的快照
    pub fn status(&self) -> Status {
        let active = count_active_sessions(&self.user_sessions, self.session_timeout);
        let variants = self
            .variants
            .iter()
            .map(|variant| VariantStatus {
                id: variant.id.clone(),
                stats: self.build_stats(variant, &active),
                nodes: variant
                    .proxy
                    .nodes()
                    .iter()
                    .map(|node| NodeStatus {
                        id: node.id.clone(),
                        server: node.server.clone(),
                        load: node.load(),
                        open_connections: node.open_connections(),
                        max_connections: node.max_connections(),
                    })
                    .collect(),
                cached_items: variant.proxy.cache().len(),
            })
            .collect();

        Status {
            id: self.id.clone(),
            sessions: self.user_sessions.len(),
            variants,
            generated_at: Utc::now(),
        }
    }

    /// 清理过期会话和过期缓存，返回 (会话数, 缓存项数)
    pub fn purge_expired(&self) -> (usize, usize) {
        let now = Utc::now();
        let before = self.user_sessions.len();
        self.user_sessions
            .retain(|_, session| session.is_active(now, self.session_timeout));
        let sessions = before.saturating_sub(self.user_sessions.len());

        let items = self
            .variants
            .iter()
            .map(|variant| variant.proxy.cache().purge_expired())
            .sum();
        (sessions, items)
    }

    fn build_stats(&self, variant: &Variant, active: &HashMap<String, usize>) -> Stats {
        let total: usize = active.values().sum();
        let active_sessions = active.get(&variant.id).copied().unwrap_or(0);
        Stats {
            active_sessions,
            active_share: if total > 0 {
                active_sessions as f64 / total as f64
            } else {
                0.0
            },
            share: variant.share / self.total_share,
        }
    }
}

/// 按变体统计超时时间内活跃的会话，只读不清理
pub fn count_active_sessions(
    sessions: &DashMap<String, UserSession>,
    timeout: TimeDelta,
) -> HashMap<String, usize> {
    let now = Utc::now();
    let mut counts = HashMap::new();
    for entry in sessions.iter() {
        if entry.is_active(now, timeout) {
            *counts.entry(entry.variant_id.clone()).or_insert(0) += 1;
        }
    }
    counts
}
