//! 创作者指标缓存：按 creatorId 分片，带 TTL，后写覆盖先写
//!
//! 拉取指标期间不持锁；两个 inquiry 同时未命中时各自拉取，最后写入者生效。

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::rate::CreatorMetrics;

struct CachedMetrics {
    metrics: CreatorMetrics,
    fetched_at: Instant,
}

pub struct MetricsCache {
    entries: DashMap<String, CachedMetrics>,
    ttl: Duration,
}

impl MetricsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// 未过期则返回副本；过期条目顺手移除
    pub fn get(&self, creator_id: &str) -> Option<CreatorMetrics> {
        let fresh = self
            .entries
            .get(creator_id)
            .map(|entry| (entry.fetched_at.elapsed() < self.ttl, entry.metrics.clone()));
        match fresh {
            Some((true, metrics)) => Some(metrics),
            Some((false, _)) => {
                self.entries.remove(creator_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, creator_id: &str, metrics: CreatorMetrics) {
        self.entries.insert(
            creator_id.to_string(),
            CachedMetrics {
                metrics,
                fetched_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, creator_id: &str) {
        self.entries.remove(creator_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
