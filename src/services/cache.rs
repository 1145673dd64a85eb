//! 带防击穿的静态资源缓存
//!
//! 每个键同一时间只允许一个请求去后端填充，其他请求等待填充结束并共享它的结果。
//! 填充者持有 `PopulateGuard`，结束时（包括被丢弃时）把 `Outcome` 广播给所有等待者。

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::services::sniffer::CapturedResponse;

/// 缓存项
#[derive(Debug)]
pub struct Item {
    pub uri: String,
    pub data: Bytes,
    pub headers: HeaderMap,
    pub created_at: DateTime<Utc>,
    expires_at: Instant,
}

impl Item {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// 一次填充的结果
#[derive(Debug, Clone)]
pub enum Outcome {
    /// 已写入缓存
    Saved(Arc<Item>),
    /// 响应不可缓存（304 或空响应体），等待者直接使用这次的响应
    Uncached(CapturedResponse),
    /// 上游请求失败
    Failed,
    /// 填充者放弃了，键可以重新填充
    Cancelled,
}

#[derive(Debug)]
enum Slot {
    // 发送端由填充者持有，发送结果后即被丢弃
    Populating(watch::Receiver<Option<Outcome>>),
    Present(Arc<Item>),
}

#[derive(Debug)]
pub struct Cache {
    entries: DashMap<String, Slot>,
    ttl: Duration,
    populate_timeout: Duration,
}

impl Cache {
    pub fn new(ttl: Duration, populate_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            populate_timeout,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Item>> {
        let item = {
            let slot = self.entries.get(key)?;
            match slot.value() {
                Slot::Present(item) => item.clone(),
                Slot::Populating(_) => return None,
            }
        };

        if item.is_expired() {
            self.entries
                .remove_if(key, |_, slot| matches!(slot, Slot::Present(i) if i.is_expired()));
            return None;
        }
        Some(item)
    }

    /// 尝试成为该键唯一的填充者
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<PopulateGuard> {
        use dashmap::mapref::entry::Entry;

        let (done, waiters) = watch::channel(None);
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let free = match entry.get() {
                    Slot::Present(item) => item.is_expired(),
                    // 填充者已经消失但没有清理
                    Slot::Populating(rx) => rx.has_changed().is_err(),
                };
                if !free {
                    return None;
                }
                entry.insert(Slot::Populating(waiters));
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::Populating(waiters));
            }
        }

        debug!("获得缓存填充锁: {}", key);
        Some(PopulateGuard {
            cache: self.clone(),
            key: key.to_string(),
            done: Some(done),
        })
    }

    pub fn populate_timeout(&self) -> Duration {
        self.populate_timeout
    }

    /// 等待正在进行的填充结束，最多等待 `populate_timeout`
    ///
    /// 没有正在进行的填充或等待超时时返回 `None`。
    pub async fn wait_for(&self, key: &str) -> Option<Outcome> {
        let mut rx = match self.entries.get(key).as_deref() {
            Some(Slot::Populating(rx)) => rx.clone(),
            _ => return None,
        };

        match tokio::time::timeout(self.populate_timeout, rx.changed()).await {
            Ok(Ok(())) => rx.borrow().clone(),
            // 发送端没有发送结果就消失了
            Ok(Err(_)) => Some(Outcome::Cancelled),
            Err(_) => {
                warn!("等待缓存填充超时: {}", key);
                None
            }
        }
    }

    /// 已缓存的条目数
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Present(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清理过期条目，返回清理数量
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| !matches!(slot, Slot::Present(item) if item.is_expired()));
        before.saturating_sub(self.entries.len())
    }
}

/// 缓存填充锁，结束时释放；未保存就被丢弃时视为取消
#[derive(Debug)]
pub struct PopulateGuard {
    cache: Arc<Cache>,
    key: String,
    done: Option<watch::Sender<Option<Outcome>>>,
}

impl PopulateGuard {
    /// 保存并释放锁；空数据不保存
    pub fn save(mut self, uri: &str, data: Bytes, headers: HeaderMap) -> Option<Arc<Item>> {
        if data.is_empty() {
            self.release(Outcome::Cancelled);
            return None;
        }

        let item = Arc::new(Item {
            uri: uri.to_string(),
            data,
            headers,
            created_at: Utc::now(),
            expires_at: Instant::now() + self.cache.ttl,
        });
        self.release(Outcome::Saved(item.clone()));
        Some(item)
    }

    /// 不保存，把这次的响应交给等待者
    pub fn skip(mut self, response: CapturedResponse) {
        self.release(Outcome::Uncached(response));
    }

    /// 上游失败，等待者同样得到失败结果
    pub fn fail(mut self) {
        self.release(Outcome::Failed);
    }

    pub fn cancel(mut self) {
        self.release(Outcome::Cancelled);
    }

    fn release(&mut self, outcome: Outcome) {
        let Some(done) = self.done.take() else {
            return;
        };

        match &outcome {
            Outcome::Saved(item) => {
                debug!("缓存已保存: {} ({} bytes)", item.uri, item.data.len());
                self.cache
                    .entries
                    .insert(self.key.clone(), Slot::Present(item.clone()));
            }
            _ => {
                debug!("结束缓存填充但未保存: {}", self.key);
                self.cache
                    .entries
                    .remove_if(&self.key, |_, slot| matches!(slot, Slot::Populating(_)));
            }
        }
        // 先更新状态再唤醒等待者
        done.send_replace(Some(outcome));
    }
}

impl Drop for PopulateGuard {
    fn drop(&mut self) {
        self.release(Outcome::Cancelled);
    }
}
