//! Session store: a single persisted slot holding the current [`SessionRecord`].
//!
//! The slot lives in a [`SessionStorage`] backend: in-memory (default, tests), one JSON file per
//! key, or SQLite. Only [`SessionStore`] reads or writes the slot.
//!
//! **Last write wins:** there is no versioning. Two requests rotating the CSRF token at the same
//! time race, and the later write is kept.

use crate::config::SessionConfig;
use crate::cookies;
use crate::metrics;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Credentials issued by the legacy server, plus display fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub csrf_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_time: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Both required fields non-empty.
    pub fn is_valid(&self) -> bool {
        !self.session_id.is_empty() && !self.csrf_token.is_empty()
    }
}

/// Raw key/value slot backing the store. Must be Send + Sync for use across tasks.
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Short backend name for logs and health ("memory", "file", "sqlite").
    fn backend(&self) -> &'static str;

    async fn read(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Overwrites any previous value.
    async fn write(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: tokio::sync::RwLock<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStorage for MemoryStorage {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// One `<key>.json` file per key under a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates the directory if missing.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create session directory {:?}", dir))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl SessionStorage for FileStorage {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read session file {:?}", path)),
        }
    }

    async fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value)
            .await
            .with_context(|| format!("write session file {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("rename session file to {:?}", path))?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove session file {:?}", path)),
        }
    }
}

/// SQLite-backed slot. Table: (key, value, updated_at).
/// Uses spawn_blocking so rusqlite's sync API doesn't block the async runtime.
pub struct SqliteStorage {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStorage {
    /// Open or create DB at path; creates the table if missing.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| anyhow::anyhow!("open sqlite {:?}: {}", path, e))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS relay_session (
                key TEXT NOT NULL PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| anyhow::anyhow!("init sqlite: {}", e))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl SessionStorage for SqliteStorage {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn read(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("session storage lock poisoned"))?;
            let mut stmt = c.prepare("SELECT value FROM relay_session WHERE key = ?1")?;
            let mut rows = stmt.query([&key])?;
            if let Some(row) = rows.next()? {
                let value: String = row.get(0)?;
                Ok(Some(value))
            } else {
                Ok(None)
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))?
    }

    async fn write(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let value = value.to_string();
        let updated_at = Utc::now().timestamp();
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("session storage lock poisoned"))?;
            c.execute(
                "INSERT INTO relay_session (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                rusqlite::params![&key, &value, updated_at],
            )?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))?
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let c = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("session storage lock poisoned"))?;
            c.execute("DELETE FROM relay_session WHERE key = ?1", [&key])?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("spawn_blocking: {}", e))?
    }
}

/// Open the storage backend named in config.
pub fn open_storage(config: &SessionConfig) -> anyhow::Result<Arc<dyn SessionStorage>> {
    let backend = config.backend.to_ascii_lowercase();
    match backend.as_str() {
        "file" => {
            let dir = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("session.path is required when backend is file"))?;
            Ok(Arc::new(FileStorage::open(Path::new(dir))?))
        }
        "sqlite" => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("session.path is required when backend is sqlite"))?;
            Ok(Arc::new(SqliteStorage::open(Path::new(path))?))
        }
        _ => Ok(Arc::new(MemoryStorage::new())),
    }
}

/// Single-slot session store over a storage backend.
///
/// A detached store (no backend) turns every operation into a no-op and `get` into `None`.
#[derive(Clone)]
pub struct SessionStore {
    storage: Option<Arc<dyn SessionStorage>>,
    key: String,
    csrf_cookie_name: String,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn SessionStorage>, key: &str, csrf_cookie_name: &str) -> Self {
        Self {
            storage: Some(storage),
            key: key.to_string(),
            csrf_cookie_name: csrf_cookie_name.to_string(),
        }
    }

    pub fn detached() -> Self {
        Self {
            storage: None,
            key: String::new(),
            csrf_cookie_name: String::new(),
        }
    }

    pub fn backend(&self) -> &'static str {
        self.storage.as_ref().map_or("detached", |s| s.backend())
    }

    /// Read and parse the slot. Unparsable data is removed and reported as absent.
    pub async fn get(&self) -> Option<SessionRecord> {
        let storage = self.storage.as_ref()?;
        let raw = match storage.read(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, backend = storage.backend(), "session read failed");
                return None;
            }
        };
        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, key = %self.key, "corrupt session data, clearing");
                metrics::record_session_self_heal();
                if let Err(e) = storage.remove(&self.key).await {
                    tracing::warn!(error = %e, "failed to clear corrupt session data");
                }
                None
            }
        }
    }

    /// Persist the full record, replacing any previous one.
    pub async fn set(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };
        let raw = serde_json::to_string(record).context("serialize session record")?;
        storage.write(&self.key, &raw).await
    }

    /// Remove the slot. Idempotent.
    pub async fn clear(&self) -> anyhow::Result<()> {
        let Some(storage) = self.storage.as_ref() else {
            return Ok(());
        };
        storage.remove(&self.key).await
    }

    /// True when the backend answers a raw read. A detached store is always reachable.
    pub async fn is_reachable(&self) -> bool {
        match self.storage.as_ref() {
            Some(storage) => storage.read(&self.key).await.is_ok(),
            None => true,
        }
    }

    pub async fn is_valid(&self) -> bool {
        self.get().await.is_some_and(|r| r.is_valid())
    }

    /// Adopt a rotated CSRF token. Accepts a bare token or a raw header containing
    /// `<csrf cookie>=value`. No-op when there is no stored record.
    pub async fn update_csrf_token(&self, token_or_header: &str) -> anyhow::Result<()> {
        let Some(mut record) = self.get().await else {
            return Ok(());
        };
        let token = cookies::find_named_value(token_or_header, &self.csrf_cookie_name)
            .unwrap_or_else(|| token_or_header.to_string());
        if record.csrf_token == token {
            return Ok(());
        }
        record.csrf_token = token;
        self.set(&record).await?;
        metrics::record_csrf_rotation();
        tracing::debug!("csrf token rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static STORE_TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(name: &str) -> PathBuf {
        let n = STORE_TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("relay_session_{}_{}_{}", name, std::process::id(), n))
    }

    fn memory_store() -> (Arc<MemoryStorage>, SessionStore) {
        let storage = Arc::new(MemoryStorage::new());
        let store = SessionStore::new(storage.clone(), "mis_session", "CSRF-TOKEN");
        (storage, store)
    }

    fn record(session_id: &str, csrf: &str) -> SessionRecord {
        SessionRecord {
            session_id: session_id.to_string(),
            csrf_token: csrf.to_string(),
            username: Some("kim".to_string()),
            login_time: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_equal_record() {
        let (_, store) = memory_store();
        let r = record("abcd", "tok1");
        store.set(&r).await.unwrap();
        assert_eq!(store.get().await, Some(r));
    }

    #[tokio::test]
    async fn set_replaces_previous_record() {
        let (_, store) = memory_store();
        store.set(&record("one", "t1")).await.unwrap();
        let second = SessionRecord {
            session_id: "two".to_string(),
            csrf_token: "t2".to_string(),
            username: None,
            login_time: None,
        };
        store.set(&second).await.unwrap();
        assert_eq!(store.get().await, Some(second));
    }

    #[tokio::test]
    async fn malformed_data_self_heals() {
        let (storage, store) = memory_store();
        for junk in ["{not json", "", "[]", "{\"sessionId\": 5}"] {
            storage.write("mis_session", junk).await.unwrap();
            assert_eq!(store.get().await, None, "junk {:?}", junk);
            assert_eq!(storage.read("mis_session").await.unwrap(), None);
            assert_eq!(store.get().await, None);
        }
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let (storage, store) = memory_store();
        store.set(&record("abcd", "tok1")).await.unwrap();
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(storage.read("mis_session").await.unwrap(), None);
        assert!(!store.is_valid().await);
    }

    #[tokio::test]
    async fn is_valid_requires_both_fields() {
        let (_, store) = memory_store();
        assert!(!store.is_valid().await);
        store.set(&record("abcd", "tok1")).await.unwrap();
        assert!(store.is_valid().await);
        store.set(&record("", "tok1")).await.unwrap();
        assert!(!store.is_valid().await);
        store.set(&record("abcd", "")).await.unwrap();
        assert!(!store.is_valid().await);
    }

    #[tokio::test]
    async fn update_csrf_from_raw_header() {
        let (_, store) = memory_store();
        store.set(&record("abcd", "old")).await.unwrap();
        store.update_csrf_token("CSRF-TOKEN=abc123; Path=/").await.unwrap();
        let r = store.get().await.unwrap();
        assert_eq!(r.csrf_token, "abc123");
        assert_eq!(r.session_id, "abcd");
        assert_eq!(r.username.as_deref(), Some("kim"));
    }

    #[tokio::test]
    async fn update_csrf_from_bare_token() {
        let (_, store) = memory_store();
        store.set(&record("abcd", "old")).await.unwrap();
        store.update_csrf_token("xyz").await.unwrap();
        assert_eq!(store.get().await.unwrap().csrf_token, "xyz");
    }

    #[tokio::test]
    async fn update_csrf_without_record_is_noop() {
        let (storage, store) = memory_store();
        store.update_csrf_token("xyz").await.unwrap();
        assert_eq!(storage.read("mis_session").await.unwrap(), None);
    }

    #[tokio::test]
    async fn detached_store_is_inert() {
        let store = SessionStore::detached();
        store.set(&record("abcd", "tok1")).await.unwrap();
        assert_eq!(store.get().await, None);
        assert!(!store.is_valid().await);
        store.update_csrf_token("xyz").await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.backend(), "detached");
    }

    #[test]
    fn record_serializes_camel_case() {
        let r = SessionRecord {
            session_id: "abcd".to_string(),
            csrf_token: "tok1".to_string(),
            username: None,
            login_time: None,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json, serde_json::json!({"sessionId": "abcd", "csrfToken": "tok1"}));
    }

    #[tokio::test]
    async fn file_storage_round_trip_and_missing_remove() {
        let dir = temp_path("file");
        let storage = Arc::new(FileStorage::open(&dir).unwrap());
        let store = SessionStore::new(storage.clone(), "mis_session", "CSRF-TOKEN");
        let r = record("abcd", "tok1");
        store.set(&r).await.unwrap();
        assert_eq!(store.get().await, Some(r));
        assert!(dir.join("mis_session.json").exists());
        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert!(!dir.join("mis_session.json").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn sqlite_storage_persists_across_reopen() {
        let path = temp_path("sqlite").with_extension("db");
        {
            let storage = Arc::new(SqliteStorage::open(&path).unwrap());
            let store = SessionStore::new(storage, "mis_session", "CSRF-TOKEN");
            store.set(&record("abcd", "tok1")).await.unwrap();
        }
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let store = SessionStore::new(storage.clone(), "mis_session", "CSRF-TOKEN");
        assert_eq!(store.get().await.unwrap().session_id, "abcd");
        storage.write("mis_session", "garbage").await.unwrap();
        assert_eq!(store.get().await, None);
        assert_eq!(storage.read("mis_session").await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_storage_picks_backend() {
        let memory = open_storage(&SessionConfig::default()).unwrap();
        assert_eq!(memory.backend(), "memory");
        let dir = temp_path("open");
        let file = open_storage(&SessionConfig {
            backend: "FILE".to_string(),
            path: Some(dir.to_string_lossy().into_owned()),
            key: "k".to_string(),
        })
        .unwrap();
        assert_eq!(file.backend(), "file");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
