//! SQLite 持久化（rusqlite，同步）
//!
//! 单表 kv(namespace, key, value, updated_at)；命名空间 + key 为主键。
//! 连接放在 Mutex 中，单次操作都很短，不跨 await 持有。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use crate::core::DealError;
use crate::store::{KvStore, Namespace};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化表；父目录不存在时自动创建
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DealError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| DealError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, DealError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, DealError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DealError> {
        self.conn
            .lock()
            .map_err(|_| DealError::Storage("sqlite connection lock poisoned".to_string()))
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl KvStore for SqliteStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<String>, DealError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![ns.as_str(), key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, ns: Namespace, key: &str, value: &str) -> Result<(), DealError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![ns.as_str(), key, value, now()],
        )?;
        Ok(())
    }

    fn insert_new(&self, ns: Namespace, key: &str, value: &str) -> Result<bool, DealError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![ns.as_str(), key, value, now()],
        )?;
        Ok(changed == 1)
    }

    fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool, DealError> {
        let Some(expected) = expected else {
            return self.insert_new(ns, key, value);
        };
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE kv SET value = ?1, updated_at = ?2
             WHERE namespace = ?3 AND key = ?4 AND value = ?5",
            params![value, now(), ns.as_str(), key, expected],
        )?;
        Ok(changed == 1)
    }

    fn scan_prefix(&self, ns: Namespace, prefix: &str) -> Result<Vec<(String, String)>, DealError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv
             WHERE namespace = ?1 AND substr(key, 1, length(?2)) = ?2
             ORDER BY key ASC",
        )?;
        let rows = stmt
            .query_map(params![ns.as_str(), prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete(&self, ns: Namespace, key: &str) -> Result<bool, DealError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![ns.as_str(), key],
        )?;
        Ok(changed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sqlite_roundtrip_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deals.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put(Namespace::BrandContexts, "INQ-1", r#"{"a":1}"#).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get(Namespace::BrandContexts, "INQ-1").unwrap().as_deref(),
            Some(r#"{"a":1}"#)
        );
        assert_eq!(store.get(Namespace::Readiness, "INQ-1").unwrap(), None);
    }

    #[test]
    fn test_sqlite_insert_new_and_cas() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.insert_new(Namespace::SnapshotRounds, "INQ-1#001", "r1").unwrap());
        assert!(!store.insert_new(Namespace::SnapshotRounds, "INQ-1#001", "r2").unwrap());

        assert!(store.compare_and_swap(Namespace::Readiness, "INQ-1", None, "v1").unwrap());
        assert!(!store
            .compare_and_swap(Namespace::Readiness, "INQ-1", Some("stale"), "v2")
            .unwrap());
        assert!(store
            .compare_and_swap(Namespace::Readiness, "INQ-1", Some("v1"), "v2")
            .unwrap());
    }

    #[test]
    fn test_sqlite_scan_prefix_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put(Namespace::SnapshotRounds, "INQ-1#001", "a").unwrap();
        store.put(Namespace::SnapshotRounds, "INQ-1#002", "b").unwrap();
        store.put(Namespace::SnapshotRounds, "INQ-2#001", "c").unwrap();

        let rows = store.scan_prefix(Namespace::SnapshotRounds, "INQ-1#").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].1, "b");

        assert!(store.delete(Namespace::SnapshotRounds, "INQ-1#001").unwrap());
        assert!(!store.delete(Namespace::SnapshotRounds, "INQ-1#001").unwrap());
    }
}
