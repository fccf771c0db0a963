//! Namespaced persistent key/value cache with per-entry TTLs.
//!
//! Annotation sources cache validated payloads here so restarts do not
//! lose them and concurrent instances share them. Keys are always strings;
//! anything else is coerced through [`normalize_key`] so callers can pass
//! structured identifiers. Expired entries read as absent.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition, TableHandle};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::IngestError;

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: serde_json::Value,
    created_at_unix: i64,
    ttl_seconds: u64,
    size_bytes: u64,
}

impl StoredEntry {
    fn expires_at_unix(&self) -> i64 {
        self.created_at_unix
            .saturating_add(i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX))
    }

    fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.expires_at_unix()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NamespaceStats {
    pub namespace: String,
    pub total_entries: u64,
    pub active_entries: u64,
    pub expired_entries: u64,
    pub total_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_entry_unix: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_entry_unix: Option<i64>,
}

/// Coerces any JSON-representable key to its canonical string form:
/// strings are trimmed, numbers become their decimal rendering, compound
/// values serialize to stable JSON (object keys sort), everything else
/// falls back to its JSON rendering.
pub fn normalize_key(key: &serde_json::Value) -> String {
    match key {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
            // serde_json maps are BTree-backed, so object keys serialize
            // in sorted order and the rendering is stable.
            serde_json::to_string(key).unwrap_or_default()
        }
        other => other.to_string(),
    }
}

/// Generic poisoned-payload check run before every `set`: empty payloads,
/// metadata-only payloads, and error envelopes must never enter the cache.
/// Sources layer their own `is_valid` on top of this.
pub fn is_cacheable_payload(value: &serde_json::Value) -> bool {
    let Some(map) = value.as_object() else {
        return !value.is_null();
    };
    if map.is_empty() {
        return false;
    }
    if map.contains_key("error") {
        return false;
    }
    if map.get("status").and_then(|v| v.as_str()) == Some("error") {
        return false;
    }
    map.keys()
        .any(|k| !matches!(k.as_str(), "source" | "version" | "timestamp"))
}

fn cache_err(err: impl std::fmt::Display) -> IngestError {
    IngestError::Cache(err.to_string())
}

/// Disk-backed cache shared by all sources in a process. Cheap to clone.
#[derive(Clone)]
pub struct CacheService {
    db: Arc<Database>,
}

impl CacheService {
    pub fn open(path: &Path) -> Result<Self, IngestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(cache_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Opens the cache at the default XDG location.
    pub fn open_default() -> Result<Self, IngestError> {
        let dir = match dirs::cache_dir() {
            Some(dir) => dir.join("nephro-ingest"),
            None => std::env::temp_dir().join("nephro-ingest"),
        };
        Self::open(&dir.join("annotations.redb"))
    }

    pub async fn get(
        &self,
        key: &serde_json::Value,
        namespace: &str,
    ) -> Result<Option<serde_json::Value>, IngestError> {
        let key = normalize_key(key);
        let table_def: TableDefinition<'_, &str, &[u8]> = TableDefinition::new(namespace);

        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = match txn.open_table(table_def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(cache_err(err)),
        };

        let Some(raw) = table.get(key.as_str()).map_err(cache_err)? else {
            return Ok(None);
        };
        let entry: StoredEntry = serde_json::from_slice(raw.value())?;
        if entry.is_expired(OffsetDateTime::now_utc().unix_timestamp()) {
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    /// Stores a value with a TTL. Callers must have established validity
    /// first; this only applies the generic poisoned-payload guard.
    pub async fn set(
        &self,
        key: &serde_json::Value,
        value: serde_json::Value,
        namespace: &str,
        ttl_seconds: u64,
    ) -> Result<(), IngestError> {
        if !is_cacheable_payload(&value) {
            return Err(IngestError::Cache(format!(
                "refusing to cache invalid payload in namespace '{namespace}'"
            )));
        }

        let key = normalize_key(key);
        let serialized_value = serde_json::to_vec(&value)?;
        let entry = StoredEntry {
            size_bytes: serialized_value.len() as u64,
            value,
            created_at_unix: OffsetDateTime::now_utc().unix_timestamp(),
            ttl_seconds,
        };
        let raw = serde_json::to_vec(&entry)?;

        let table_def: TableDefinition<'_, &str, &[u8]> = TableDefinition::new(namespace);
        let txn = self.db.begin_write().map_err(cache_err)?;
        {
            let mut table = txn.open_table(table_def).map_err(cache_err)?;
            table
                .insert(key.as_str(), raw.as_slice())
                .map_err(cache_err)?;
        }
        txn.commit().map_err(cache_err)?;
        Ok(())
    }

    pub async fn delete(
        &self,
        key: &serde_json::Value,
        namespace: &str,
    ) -> Result<bool, IngestError> {
        let key = normalize_key(key);
        let table_def: TableDefinition<'_, &str, &[u8]> = TableDefinition::new(namespace);

        let txn = self.db.begin_write().map_err(cache_err)?;
        let removed = {
            let mut table = match txn.open_table(table_def) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => return Ok(false),
                Err(err) => return Err(cache_err(err)),
            };
            table.remove(key.as_str()).map_err(cache_err)?.is_some()
        };
        txn.commit().map_err(cache_err)?;
        Ok(removed)
    }

    pub async fn clear(&self, namespace: &str) -> Result<(), IngestError> {
        let table_def: TableDefinition<'_, &str, &[u8]> = TableDefinition::new(namespace);
        let txn = self.db.begin_write().map_err(cache_err)?;
        txn.delete_table(table_def).map_err(cache_err)?;
        txn.commit().map_err(cache_err)?;
        Ok(())
    }

    pub async fn namespaces(&self) -> Result<Vec<String>, IngestError> {
        let txn = self.db.begin_read().map_err(cache_err)?;
        let mut names: Vec<String> = txn
            .list_tables()
            .map_err(cache_err)?
            .map(|handle| handle.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub async fn stats(&self, namespace: &str) -> Result<NamespaceStats, IngestError> {
        let table_def: TableDefinition<'_, &str, &[u8]> = TableDefinition::new(namespace);
        let mut stats = NamespaceStats {
            namespace: namespace.to_string(),
            total_entries: 0,
            active_entries: 0,
            expired_entries: 0,
            total_size_bytes: 0,
            oldest_entry_unix: None,
            newest_entry_unix: None,
        };

        let txn = self.db.begin_read().map_err(cache_err)?;
        let table = match txn.open_table(table_def) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(stats),
            Err(err) => return Err(cache_err(err)),
        };

        let now_unix = OffsetDateTime::now_utc().unix_timestamp();
        for row in table.iter().map_err(cache_err)? {
            let (_, raw) = row.map_err(cache_err)?;
            let entry: StoredEntry = serde_json::from_slice(raw.value())?;

            stats.total_entries += 1;
            if entry.is_expired(now_unix) {
                stats.expired_entries += 1;
            } else {
                stats.active_entries += 1;
            }
            stats.total_size_bytes += entry.size_bytes;
            stats.oldest_entry_unix = Some(match stats.oldest_entry_unix {
                Some(oldest) => oldest.min(entry.created_at_unix),
                None => entry.created_at_unix,
            });
            stats.newest_entry_unix = Some(match stats.newest_entry_unix {
                Some(newest) => newest.max(entry.created_at_unix),
                None => entry.created_at_unix,
            });
        }
        Ok(stats)
    }
}
