use std::path::Path;

use bridge_core::error::ConfigError;
use bridge_core::model::{MappingConfig, MappingHistory};

use crate::paths::{BridgePaths, set_file_private};

/// Loads, saves and mutates per-mapping JSON configs under `config/mappings/` (§4.2/§6.2),
/// plus the `mappings_state/` history sidecar created alongside each config.
pub struct MappingConfigStore {
    paths: BridgePaths,
}

impl MappingConfigStore {
    pub fn new(paths: BridgePaths) -> Self {
        Self { paths }
    }

    pub async fn load(&self, mapping_name: &str) -> Result<MappingConfig, ConfigError> {
        let path = self.paths.mapping_config_file(mapping_name);
        let bytes = tokio::fs::read(&path).await.map_err(|_| ConfigError::Missing {
            mapping: mapping_name.to_string(),
            available: self.list_names_best_effort(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| ConfigError::Invalid {
            mapping: mapping_name.to_string(),
            message: e.to_string(),
        })
    }

    pub async fn load_all(&self) -> Result<Vec<(String, MappingConfig)>, anyhow::Error> {
        let mut out = Vec::new();
        for name in self.list_names().await? {
            let cfg = self.load(&name).await?;
            out.push((name, cfg));
        }
        Ok(out)
    }

    pub async fn list_names(&self) -> Result<Vec<String>, anyhow::Error> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.paths.config_mappings_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn list_names_best_effort(&self) -> Vec<String> {
        std::fs::read_dir(&self.paths.config_mappings_dir)
            .into_iter()
            .flatten()
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                (path.extension().and_then(|e| e.to_str()) == Some("json"))
                    .then(|| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
                    .flatten()
            })
            .collect()
    }

    /// Writes the config and, on first creation, the `mappings_state/` history sidecar
    /// initialised per §6.2 (`{last_synced:{watermark:"0",at:null}, counters:{...}, last_run:{...}}`).
    pub async fn save(&self, mapping_name: &str, cfg: &MappingConfig) -> Result<(), anyhow::Error> {
        tokio::fs::create_dir_all(&self.paths.config_mappings_dir).await?;
        let path = self.paths.mapping_config_file(mapping_name);
        write_json_atomic(&path, cfg).await?;
        let _ = set_file_private(&path);

        let history_path = self.paths.mapping_history_file(mapping_name);
        if tokio::fs::metadata(&history_path).await.is_err() {
            self.write_history(mapping_name, &MappingHistory::new()).await?;
        }
        Ok(())
    }

    /// Single read-modify-write-rename of `transfer.initial_watermark`, no external lock:
    /// only one runner per mapping can be active (the running-names set enforces this, §5).
    pub async fn advance_watermark(
        &self,
        mapping_name: &str,
        new_watermark: &str,
    ) -> Result<(), anyhow::Error> {
        let mut cfg = self
            .load(mapping_name)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        cfg.transfer.initial_watermark = new_watermark.to_string();
        let path = self.paths.mapping_config_file(mapping_name);
        write_json_atomic(&path, &cfg).await?;
        let _ = set_file_private(&path);
        Ok(())
    }

    pub async fn load_history(&self, mapping_name: &str) -> Result<MappingHistory, anyhow::Error> {
        let path = self.paths.mapping_history_file(mapping_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(MappingHistory::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_history(&self, mapping_name: &str, history: &MappingHistory) -> Result<(), anyhow::Error> {
        tokio::fs::create_dir_all(&self.paths.mappings_state_dir).await?;
        let path = self.paths.mapping_history_file(mapping_name);
        write_json_atomic(&path, history).await?;
        let _ = set_file_private(&path);
        Ok(())
    }

    /// Best-effort sidecar update; failures here are logged, not propagated (WatermarkError policy).
    pub async fn record_run(
        &self,
        mapping_name: &str,
        watermark: &str,
        at: &str,
        success: bool,
        run_id: &str,
        records: u64,
        files: u64,
    ) -> Result<(), anyhow::Error> {
        let mut history = self.load_history(mapping_name).await?;
        history.last_synced.watermark = watermark.to_string();
        history.last_synced.at = Some(at.to_string());
        history.counters.runs += 1;
        if success {
            history.counters.records_uploaded += records;
            history.counters.files_uploaded += files;
        } else {
            history.counters.errors += 1;
        }
        history.last_run.run_id = Some(run_id.to_string());
        history.last_run.status = if success { "success" } else { "error" }.to_string();
        history.last_run.finished_at = Some(at.to_string());
        self.write_history(mapping_name, &history).await
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), anyhow::Error> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.partial");
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::model::{DeleteSafety, IncrementalMode, SchemaRef, SourceRef, SourceType, TransferConfig};

    fn sample_config() -> MappingConfig {
        MappingConfig {
            source: SourceRef {
                name: "mydb".into(),
                kind: SourceType::Mysql,
                connection_ref: "mydb".into(),
            },
            table: "users".into(),
            schema: SchemaRef {
                id: "1".into(),
                name: "users".into(),
                slug: "users".into(),
                token_ref: "users".into(),
            },
            transfer: TransferConfig {
                incremental_mode: IncrementalMode::IncrementalPk,
                pk_column: Some("id".into()),
                timestamp_column: None,
                initial_watermark: "0".into(),
                batch_size: 5000,
                order_by: None,
                min_records_for_upload: 0,
                delete_after_upload: false,
                delete_safety: DeleteSafety {
                    enabled: false,
                    where_column: None,
                },
            },
            query: None,
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let store = MappingConfigStore::new(BridgePaths::from_base(tmp.path().to_path_buf()));
        let cfg = sample_config();
        store.save("mydb.users", &cfg).await?;

        let loaded = store.load("mydb.users").await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        assert_eq!(loaded.table, "users");
        assert_eq!(loaded.transfer.initial_watermark, "0");
        Ok(())
    }

    #[tokio::test]
    async fn save_initialises_history_sidecar_once() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let store = MappingConfigStore::new(BridgePaths::from_base(tmp.path().to_path_buf()));
        store.save("mydb.users", &sample_config()).await?;

        let history = store.load_history("mydb.users").await?;
        assert_eq!(history.last_synced.watermark, "0");
        assert_eq!(history.last_run.status, "never_run");
        Ok(())
    }

    #[tokio::test]
    async fn advance_watermark_updates_only_that_field() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let store = MappingConfigStore::new(BridgePaths::from_base(tmp.path().to_path_buf()));
        store.save("mydb.users", &sample_config()).await?;

        store.advance_watermark("mydb.users", "42").await?;
        let loaded = store.load("mydb.users").await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        assert_eq!(loaded.transfer.initial_watermark, "42");
        assert_eq!(loaded.transfer.pk_column.as_deref(), Some("id"));
        Ok(())
    }

    #[tokio::test]
    async fn load_missing_mapping_lists_available_names() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let store = MappingConfigStore::new(BridgePaths::from_base(tmp.path().to_path_buf()));
        store.save("mydb.users", &sample_config()).await?;

        let err = store.load("mydb.orders").await.unwrap_err();
        match err {
            ConfigError::Missing { available, .. } => {
                assert_eq!(available, vec!["mydb.users".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        Ok(())
    }
}
