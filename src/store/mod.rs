//! 持久化层：统一的 KV 抽象（内存 / SQLite），按命名空间划分逻辑表
//!
//! 命名空间：brand_contexts、readiness、rate_snapshots（+ snapshot_rounds 索引）、
//! negotiation_rounds、reasoning_contexts。上层通过 get_json / put_json 读写 JSON 文档。

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::DealError;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// 逻辑表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    BrandContexts,
    Readiness,
    RateSnapshots,
    /// (inquiry_id, round) -> recommendation_id，用于唯一性占位与按轮查询
    SnapshotRounds,
    NegotiationRounds,
    ReasoningContexts,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::BrandContexts => "brand_contexts",
            Namespace::Readiness => "readiness",
            Namespace::RateSnapshots => "rate_snapshots",
            Namespace::SnapshotRounds => "snapshot_rounds",
            Namespace::NegotiationRounds => "negotiation_rounds",
            Namespace::ReasoningContexts => "reasoning_contexts",
        }
    }
}

/// KV 存储接口：所有值为 JSON 文本
pub trait KvStore: Send + Sync {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, DealError>;

    /// 覆盖写
    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), DealError>;

    /// 仅当 key 不存在时写入；已存在返回 false
    fn insert_new(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, DealError>;

    /// 当前值等于 expected 时写入（expected 为 None 表示要求 key 不存在）；不匹配返回 false
    fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, DealError>;

    /// 按 key 前缀扫描，结果按 key 升序
    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, DealError>;

    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, DealError>;
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    ns: Namespace,
    key: &str,
) -> Result<Option<T>, DealError> {
    match store.get(ns, key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn put_json<T: Serialize>(
    store: &dyn KvStore,
    ns: Namespace,
    key: &str,
    value: &T,
) -> Result<(), DealError> {
    let raw = serde_json::to_string(value)?;
    store.put(ns, key, &raw)
}

/// 创建存储
///
/// 提供 db_path 且能打开 SQLite 时使用持久化存储；否则回退到内存存储
pub fn create_store(db_path: Option<&Path>) -> Arc<dyn KvStore> {
    if let Some(path) = db_path {
        match SqliteStore::open(path) {
            Ok(store) => {
                tracing::info!("Using SQLite store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite store, falling back to memory: {}", e);
            }
        }
    }
    tracing::info!("Using in-memory store");
    Arc::new(MemoryStore::new())
}
