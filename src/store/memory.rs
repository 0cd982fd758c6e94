//! 内存 KV 存储（测试与单进程部署用）

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::core::DealError;
use crate::store::{KvStore, Namespace};

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Namespace, BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> DealError {
    DealError::Storage("memory store lock poisoned".to_string())
}

impl KvStore for MemoryStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, DealError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(&ns).and_then(|t| t.get(key)).cloned())
    }

    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), DealError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        tables
            .entry(ns)
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn insert_new(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, DealError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let table = tables.entry(ns).or_default();
        if table.contains_key(key) {
            return Ok(false);
        }
        table.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, DealError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        let table = tables.entry(ns).or_default();
        if table.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        table.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, DealError> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables
            .get(&ns)
            .map(|t| {
                t.range(prefix.to_string()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, DealError> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;
        Ok(tables.get_mut(&ns).and_then(|t| t.remove(key)).is_some())
    }
}
