//! 按 key 串行化：每个 inquiry 一把异步锁，不同 inquiry 互不阻塞
//!
//! 锁槽放在分片 map 里，取到 `Arc<Mutex>` 后立即释放分片，再 `lock_owned` 等待。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedSerializer {
    slots: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 key 对应的独占许可，guard 释放前同 key 的其它调用会排队
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = self
            .slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        slot.lock_owned().await
    }

    /// 回收无人持有的锁槽
    pub fn prune(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
