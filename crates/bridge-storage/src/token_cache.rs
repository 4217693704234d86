use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bridge_core::clock::Clock;
use bridge_core::model::UploadToken;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

fn cache_key(schema_slug: &str, mapping_name: &str) -> String {
    format!("{schema_slug}:{mapping_name}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheFile {
    tokens: HashMap<String, UploadToken>,
}

/// Upload-token cache keyed by `schema_slug:mapping_name` (§4.5), backed by one
/// JSON file and evaluated against `UploadToken::is_valid`'s 300s safety buffer.
pub struct TokenCache {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    tokens: Mutex<HashMap<String, UploadToken>>,
}

impl TokenCache {
    pub async fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        let tokens = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<CacheFile>(&bytes)?.tokens,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            clock,
            tokens: Mutex::new(tokens),
        })
    }

    /// Evicts the entry first if it has fallen inside the safety buffer, then
    /// returns whatever remains. A cache miss here means "go fetch a new one".
    pub async fn get(&self, schema_slug: &str, mapping_name: &str) -> Result<Option<UploadToken>, anyhow::Error> {
        let key = cache_key(schema_slug, mapping_name);
        let now = self.clock.now_unix();
        let mut guard = self.tokens.lock().await;
        let expired = matches!(guard.get(&key), Some(token) if !token.is_valid(now));
        if expired {
            guard.remove(&key);
            persist(&self.path, &guard).await?;
        }
        Ok(guard.get(&key).cloned())
    }

    pub async fn store(&self, token: UploadToken) -> Result<(), anyhow::Error> {
        let key = cache_key(&token.schema_slug, &token.mapping_name);
        let mut guard = self.tokens.lock().await;
        guard.insert(key, token);
        persist(&self.path, &guard).await
    }

    pub async fn invalidate(&self, schema_slug: &str, mapping_name: &str) -> Result<(), anyhow::Error> {
        let key = cache_key(schema_slug, mapping_name);
        let mut guard = self.tokens.lock().await;
        guard.remove(&key);
        persist(&self.path, &guard).await
    }

    /// Sweeps every entry, not just the one a caller happens to ask about.
    pub async fn cleanup_expired(&self) -> Result<usize, anyhow::Error> {
        let now = self.clock.now_unix();
        let mut guard = self.tokens.lock().await;
        let before = guard.len();
        guard.retain(|_, token| token.is_valid(now));
        let removed = before - guard.len();
        if removed > 0 {
            persist(&self.path, &guard).await?;
        }
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), anyhow::Error> {
        let mut guard = self.tokens.lock().await;
        guard.clear();
        persist(&self.path, &guard).await
    }
}

async fn persist(path: &Path, tokens: &HashMap<String, UploadToken>) -> Result<(), anyhow::Error> {
    let file = CacheFile {
        tokens: tokens.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&file)?;
    let tmp = path.with_extension("json.partial");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
