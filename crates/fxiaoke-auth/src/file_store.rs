//! File-backed token store
//!
//! Keeps one JSON document per app id, keyed by app id. Each document stores
//! an absolute `expiresat` (unix ms) computed at write time, so expiry does
//! not depend on when the file is read back. All writes use atomic
//! temp-file + rename with 0600 permissions since the file holds live tokens.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::credentials::{AccessToken, unix_millis};
use crate::error::{Error, Result};
use crate::store::{StoreFuture, TokenStore};

/// Persisted form of one cached token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub appid: String,
    pub corpaccesstoken: String,
    pub corpid: String,
    /// Advertised lifetime in seconds
    pub expiresin: u64,
    /// Issue time as unix ms
    pub issuedat: u64,
    /// Absolute expiry as unix ms
    pub expiresat: u64,
}

impl TokenRecord {
    fn new(token: &AccessToken, ttl: Duration, now_ms: u64) -> Self {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        Self {
            appid: token.app_id.clone(),
            corpaccesstoken: token.token.clone(),
            corpid: token.corp_id.clone(),
            expiresin: token.expires_in_secs,
            issuedat: token.issued_at_ms,
            expiresat: now_ms.saturating_add(ttl_ms),
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expiresat
    }

    fn to_token(&self) -> AccessToken {
        AccessToken {
            app_id: self.appid.clone(),
            corp_id: self.corpid.clone(),
            token: self.corpaccesstoken.clone(),
            expires_in_secs: self.expiresin,
            issued_at_ms: self.issuedat,
        }
    }
}

/// Token store persisted to a single JSON file.
///
/// The Mutex serializes writes; the in-memory map mirrors the file.
pub struct FileTokenStore {
    path: PathBuf,
    records: Mutex<HashMap<String, TokenRecord>>,
}

impl FileTokenStore {
    /// Load the store from `path`, creating an empty file if missing.
    ///
    /// Records that already expired are dropped during load.
    pub async fn load(path: PathBuf) -> Result<Self> {
        let records = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Store(format!("reading token file: {e}")))?;
            let mut records: HashMap<String, TokenRecord> = serde_json::from_str(&contents)
                .map_err(|e| Error::Store(format!("parsing token file: {e}")))?;
            let now = unix_millis();
            let loaded = records.len();
            records.retain(|_, record| !record.is_expired(now));
            info!(
                path = %path.display(),
                records = records.len(),
                expired = loaded - records.len(),
                "loaded token store"
            );
            records
        } else {
            info!(path = %path.display(), "token file not found, starting empty");
            let records = HashMap::new();
            write_atomic(&path, &records).await?;
            records
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records currently held, expired or not.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl TokenStore for FileTokenStore {
    fn lookup<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, Option<AccessToken>> {
        Box::pin(async move {
            let records = self.records.lock().await;
            let now = unix_millis();
            Ok(records
                .get(app_id)
                .filter(|record| !record.is_expired(now))
                .map(TokenRecord::to_token))
        })
    }

    fn upsert<'a>(&'a self, token: &'a AccessToken, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            let now = unix_millis();
            let mut next = live_records(&records, now);
            next.insert(token.app_id.clone(), TokenRecord::new(token, ttl, now));
            write_atomic(&self.path, &next).await?;
            *records = next;
            debug!(app_id = %token.app_id, ttl_secs = ttl.as_secs(), "stored token");
            Ok(())
        })
    }

    fn invalidate<'a>(&'a self, app_id: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut records = self.records.lock().await;
            let removed = records.contains_key(app_id);
            let mut next = live_records(&records, unix_millis());
            next.remove(app_id);
            if next.len() != records.len() {
                write_atomic(&self.path, &next).await?;
                *records = next;
            }
            debug!(app_id, removed, "invalidated token");
            Ok(u64::from(removed))
        })
    }
}

/// Copy of `records` without the ones expired at `now_ms`.
fn live_records(
    records: &HashMap<String, TokenRecord>,
    now_ms: u64,
) -> HashMap<String, TokenRecord> {
    records
        .iter()
        .filter(|(_, record)| !record.is_expired(now_ms))
        .map(|(key, record)| (key.clone(), record.clone()))
        .collect()
}

/// Write the record map atomically: temp file in the same directory, 0600,
/// then rename over the target.
async fn write_atomic(path: &Path, records: &HashMap<String, TokenRecord>) -> Result<()> {
    let json = serde_json::to_string_pretty(records)
        .map_err(|e| Error::Store(format!("serializing token records: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Store("token store path has no file name".into()))?
        .to_string_lossy();
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    if let Err(e) = write_temp(&tmp_path, json.as_bytes(), path).await {
        // Best effort; the temp file may never have been created
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!(path = %path.display(), records = records.len(), "persisted token store");
    Ok(())
}

async fn write_temp(tmp_path: &Path, contents: &[u8], path: &Path) -> Result<()> {
    tokio::fs::write(tmp_path, contents)
        .await
        .map_err(|e| Error::Store(format!("writing temp token file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| Error::Store(format!("setting token file permissions: {e}")))?;
    }

    tokio::fs::rename(tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp token file: {e}")))
}
