//! Credential storage for session tokens
//!
//! The session layer reads and writes credentials by name (`accessToken`,
//! `refreshToken`, `userRole`) with cookie-style options, through the
//! `CredentialStore` trait. `FileCredentialStore` is the persistent
//! implementation: a JSON file mapping names to entries, written atomically
//! (temp file + rename) under a tokio Mutex so a refresh, a login and a sign-out
//! racing each other never interleave partial writes.
//!
//! Entries carry an absolute expiry. An expired entry reads as absent, the way
//! a browser drops an expired cookie.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::constants::COOKIE_PATH;
use crate::error::{Error, Result};

const MILLIS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// SameSite attribute recorded with each entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    #[default]
    Lax,
    None,
}

/// Options for `CredentialStore::set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieOptions {
    pub path: String,
    pub same_site: SameSite,
    /// Days until the entry expires; `None` keeps it until removed.
    pub expires_in_days: Option<u32>,
    pub secure: bool,
}

impl CookieOptions {
    /// Root-scoped, `SameSite=Lax` entry expiring after `days`.
    pub fn lax(days: u32, secure: bool) -> Self {
        Self {
            path: COOKIE_PATH.to_string(),
            same_site: SameSite::Lax,
            expires_in_days: Some(days),
            secure,
        }
    }
}

/// A stored credential as persisted in the credential file.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute), computed from
/// `CookieOptions::expires_in_days` at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    pub value: String,
    pub path: String,
    #[serde(default)]
    pub same_site: SameSite,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl StoredCredential {
    fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_millis)
    }
}

/// Name-keyed credential storage shared by the HTTP client, the session
/// coordinator and the session sink.
///
/// Uses `Pin<Box<dyn Future>>` return types so stores can be held as
/// `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// Current value for `name`, or None if absent or expired.
    fn get<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>>;

    /// Store `value` under `name`, replacing any existing entry.
    fn set<'a>(
        &'a self,
        name: &'a str,
        value: String,
        options: CookieOptions,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Remove the entry for `name` if it was stored under `path`.
    fn remove<'a>(
        &'a self,
        name: &'a str,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON-file backed credential store.
pub struct FileCredentialStore {
    path: PathBuf,
    state: Mutex<HashMap<String, StoredCredential>>,
}

impl FileCredentialStore {
    /// Load credentials from the given file path.
    ///
    /// A missing file is a signed-out cold start: the file is created as `{}`.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let state = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading credential file: {e}")))?;
            let entries: HashMap<String, StoredCredential> = serde_json::from_str(&contents)
                .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;
            info!(path = %path.display(), entries = entries.len(), "loaded credentials");
            entries
        } else {
            info!(path = %path.display(), "credential file not found, starting signed out");
            let entries = HashMap::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Full entry for `name`, including options. Expired entries are returned
    /// as-is; `get` is the expiry-aware accessor.
    pub async fn entry(&self, name: &str) -> Option<StoredCredential> {
        self.state.lock().await.get(name).cloned()
    }

    /// Names of all entries that have not expired.
    pub async fn names(&self) -> Vec<String> {
        let now = now_millis();
        let state = self.state.lock().await;
        state
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn get_value(&self, name: &str) -> Option<String> {
        let state = self.state.lock().await;
        let entry = state.get(name)?;
        if entry.is_expired(now_millis()) {
            debug!(name, "credential expired");
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set_value(&self, name: &str, value: String, options: CookieOptions) -> Result<()> {
        let expires_at = options
            .expires_in_days
            .map(|days| now_millis() + u64::from(days) * MILLIS_PER_DAY);
        let mut state = self.state.lock().await;
        state.insert(
            name.to_string(),
            StoredCredential {
                value,
                path: options.path,
                same_site: options.same_site,
                secure: options.secure,
                expires_at,
            },
        );
        debug!(name, "stored credential");
        write_atomic(&self.path, &state).await
    }

    async fn remove_value(&self, name: &str, path: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.get(name) {
            Some(entry) if entry.path == path => {
                state.remove(name);
                debug!(name, "removed credential");
                write_atomic(&self.path, &state).await
            }
            // Cookie semantics: a removal scoped to another path leaves the entry.
            Some(_) => {
                debug!(name, path, "credential stored under a different path, not removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn get<'a>(
        &'a self,
        name: &'a str,
    ) -> Pin<Box<dyn Future<Output = Option<String>> + Send + 'a>> {
        Box::pin(self.get_value(name))
    }

    fn set<'a>(
        &'a self,
        name: &'a str,
        value: String,
        options: CookieOptions,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.set_value(name, value, options))
    }

    fn remove<'a>(
        &'a self,
        name: &'a str,
        path: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.remove_value(name, path))
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Write entries to a file atomically with 0600 permissions.
async fn write_atomic(path: &Path, data: &HashMap<String, StoredCredential>) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("credential path has no parent directory".into()))?;

    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credential file: {e}")))?;

    debug!(path = %path.display(), "persisted credentials");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{ACCESS_TOKEN, REFRESH_TOKEN, USER_ROLE};

    async fn test_store(dir: &tempfile::TempDir) -> FileCredentialStore {
        FileCredentialStore::load(dir.path().join("credentials.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn values_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        store
            .set(ACCESS_TOKEN, "T1".into(), CookieOptions::lax(7, false))
            .await
            .unwrap();
        store
            .set(REFRESH_TOKEN, "R1".into(), CookieOptions::lax(30, false))
            .await
            .unwrap();

        let reloaded = FileCredentialStore::load(path).await.unwrap();
        assert_eq!(reloaded.get(ACCESS_TOKEN).await.as_deref(), Some("T1"));
        assert_eq!(reloaded.get(REFRESH_TOKEN).await.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn cold_start_creates_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        assert!(!path.exists());
        let store = FileCredentialStore::load(path.clone()).await.unwrap();
        assert!(store.names().await.is_empty());
        assert!(path.exists());

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: HashMap<String, StoredCredential> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn set_records_options_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let before = now_millis();

        store
            .set(REFRESH_TOKEN, "R1".into(), CookieOptions::lax(30, true))
            .await
            .unwrap();

        let entry = store.entry(REFRESH_TOKEN).await.unwrap();
        assert_eq!(entry.path, "/");
        assert_eq!(entry.same_site, SameSite::Lax);
        assert!(entry.secure);
        let expires_at = entry.expires_at.unwrap();
        assert!(expires_at >= before + 30 * MILLIS_PER_DAY);
        assert!(expires_at <= now_millis() + 30 * MILLIS_PER_DAY);
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        let expired = serde_json::json!({
            "accessToken": {"value": "old", "path": "/", "expires_at": 1_000},
            "userRole": {"value": "shopkeeper", "path": "/"}
        });
        std::fs::write(&path, expired.to_string()).unwrap();

        let store = FileCredentialStore::load(path).await.unwrap();
        assert!(store.get(ACCESS_TOKEN).await.is_none());
        assert!(store.entry(ACCESS_TOKEN).await.is_some());
        assert_eq!(store.get(USER_ROLE).await.as_deref(), Some("shopkeeper"));
        assert_eq!(store.names().await, vec![USER_ROLE.to_string()]);
    }

    #[tokio::test]
    async fn remove_respects_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store
            .set(ACCESS_TOKEN, "T1".into(), CookieOptions::lax(7, false))
            .await
            .unwrap();

        store.remove(ACCESS_TOKEN, "/reports").await.unwrap();
        assert_eq!(store.get(ACCESS_TOKEN).await.as_deref(), Some("T1"));

        store.remove(ACCESS_TOKEN, "/").await.unwrap();
        assert!(store.get(ACCESS_TOKEN).await.is_none());

        // Removing an absent entry is not an error
        store.remove(ACCESS_TOKEN, "/").await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, "{not json").unwrap();

        let result = FileCredentialStore::load(path).await;
        assert!(matches!(result, Err(Error::CredentialParse(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        store
            .set(ACCESS_TOKEN, "T1".into(), CookieOptions::lax(7, false))
            .await
            .unwrap();

        let metadata = tokio::fs::metadata(store.path()).await.unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "credential file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn concurrent_writes_dont_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(test_store(&dir).await);

        let mut handles = vec![];
        for i in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .set(&format!("entry-{i}"), format!("v{i}"), CookieOptions::lax(1, false))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.names().await.len(), 10);
        let contents = tokio::fs::read_to_string(store.path()).await.unwrap();
        let parsed: HashMap<String, StoredCredential> = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.len(), 10);
    }
}
