use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bridge_core::clock::Clock;
use bridge_core::model::MappingState;
use tokio::sync::Mutex;

/// Process-wide `{mapping_name -> MappingState}` map backed by one JSON file,
/// guarded by a single mutex across in-memory mutation and file rewrite (§4.2).
pub struct MappingStateStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, MappingState>>,
}

impl MappingStateStore {
    pub async fn load(path: PathBuf, clock: Arc<dyn Clock>) -> Result<Self, anyhow::Error> {
        let states = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            clock,
            states: Mutex::new(states),
        })
    }

    pub async fn get(&self, mapping_name: &str) -> Option<MappingState> {
        self.states.lock().await.get(mapping_name).cloned()
    }

    pub async fn all(&self) -> HashMap<String, MappingState> {
        self.states.lock().await.clone()
    }

    /// Only `is_running`/`updated_at` change here (§3 invariant).
    pub async fn start_sync(&self, mapping_name: &str) -> Result<(), anyhow::Error> {
        let mut guard = self.states.lock().await;
        let now = self.clock.now_rfc3339();
        let state = guard
            .entry(mapping_name.to_string())
            .or_insert_with(|| MappingState::new(&now));
        state.is_running = true;
        state.updated_at = now;
        persist(&self.path, &guard).await
    }

    /// Clears `last_error`; counters advance (§3 invariant).
    pub async fn finish_sync_success(
        &self,
        mapping_name: &str,
        records_processed: u64,
    ) -> Result<(), anyhow::Error> {
        let mut guard = self.states.lock().await;
        let now = self.clock.now_rfc3339();
        let state = guard
            .entry(mapping_name.to_string())
            .or_insert_with(|| MappingState::new(&now));
        state.is_running = false;
        state.updated_at = now.clone();
        state.last_sync_timestamp = Some(now.clone());
        state.sync_count += 1;
        state.total_records_processed += records_processed;
        state.last_batch_records = records_processed;
        state.last_error = None;
        state.last_error_timestamp = None;
        persist(&self.path, &guard).await
    }

    /// Counters are untouched on error (§3 invariant).
    pub async fn finish_sync_error(&self, mapping_name: &str, message: &str) -> Result<(), anyhow::Error> {
        let mut guard = self.states.lock().await;
        let now = self.clock.now_rfc3339();
        let state = guard
            .entry(mapping_name.to_string())
            .or_insert_with(|| MappingState::new(&now));
        state.is_running = false;
        state.updated_at = now.clone();
        state.last_error = Some(message.to_string());
        state.last_error_timestamp = Some(now);
        persist(&self.path, &guard).await
    }

    pub async fn get_running_names(&self) -> Vec<String> {
        self.states
            .lock()
            .await
            .iter()
            .filter(|(_, state)| state.is_running)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Explicit operator escape hatch for a stale `is_running=true` after a crash (§4.2).
    pub async fn clear(&self, mapping_name: &str) -> Result<(), anyhow::Error> {
        let mut guard = self.states.lock().await;
        guard.remove(mapping_name);
        persist(&self.path, &guard).await
    }
}

async fn persist(path: &Path, states: &HashMap<String, MappingState>) -> Result<(), anyhow::Error> {
    let bytes = serde_json::to_vec_pretty(states)?;
    let tmp = path.with_extension("json.partial");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
