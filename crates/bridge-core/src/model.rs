use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Mysql,
    Postgresql,
    Sqlserver,
    Sqlite,
    LaravelLog,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRef {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SourceType,
    pub connection_ref: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalMode {
    Full,
    IncrementalPk,
    IncrementalTimestamp,
    CustomSql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRef {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub token_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteSafety {
    pub enabled: bool,
    pub where_column: Option<String>,
}

fn default_batch_size() -> u32 {
    5000
}

fn default_min_records_for_upload() -> u64 {
    0
}

/// `min_records_for_upload == 0` means "always upload" — the natural comparison
/// `rows_extracted < min_records_for_upload` already does the right thing for
/// zero, so no special-cased branch exists anywhere that reads this field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub incremental_mode: IncrementalMode,
    pub pk_column: Option<String>,
    pub timestamp_column: Option<String>,
    pub initial_watermark: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    pub order_by: Option<String>,
    #[serde(default = "default_min_records_for_upload")]
    pub min_records_for_upload: u64,
    #[serde(default)]
    pub delete_after_upload: bool,
    pub delete_safety: DeleteSafety,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingConfig {
    pub source: SourceRef,
    pub table: String,
    pub schema: SchemaRef,
    pub transfer: TransferConfig,
    pub query: Option<String>,
}

impl MappingConfig {
    /// `<source>.<table>` — the canonical mapping name used everywhere on disk.
    pub fn mapping_name(&self) -> String {
        format!("{}.{}", self.source.name, self.table)
    }

    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        if self.transfer.incremental_mode == IncrementalMode::IncrementalPk
            && self.transfer.pk_column.is_none()
        {
            return Err(crate::error::ConfigError::MissingField {
                mapping: self.mapping_name(),
                field: "transfer.pk_column",
            });
        }
        if self.transfer.delete_after_upload && self.transfer.pk_column.is_none() {
            return Err(crate::error::ConfigError::MissingField {
                mapping: self.mapping_name(),
                field: "transfer.pk_column",
            });
        }
        if self.transfer.incremental_mode == IncrementalMode::IncrementalTimestamp
            && self.transfer.timestamp_column.is_none()
        {
            return Err(crate::error::ConfigError::MissingField {
                mapping: self.mapping_name(),
                field: "transfer.timestamp_column",
            });
        }
        if self.transfer.incremental_mode == IncrementalMode::CustomSql && self.query.is_none() {
            return Err(crate::error::ConfigError::MissingField {
                mapping: self.mapping_name(),
                field: "query",
            });
        }
        Ok(())
    }
}

/// Per-mapping history sidecar (`<source>.<table>.state.json`), distinct from the
/// process-wide `MappingState` in `sync_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingHistory {
    pub last_synced: LastSynced,
    pub counters: HistoryCounters,
    pub last_run: LastRun,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastSynced {
    pub watermark: String,
    pub at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryCounters {
    pub runs: u64,
    pub records_uploaded: u64,
    pub files_uploaded: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastRun {
    pub run_id: Option<String>,
    pub status: String,
    pub finished_at: Option<String>,
}

impl MappingHistory {
    pub fn new() -> Self {
        Self {
            last_synced: LastSynced {
                watermark: "0".to_string(),
                at: None,
            },
            counters: HistoryCounters::default(),
            last_run: LastRun {
                run_id: None,
                status: "never_run".to_string(),
                finished_at: None,
            },
        }
    }
}

impl Default for MappingHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingState {
    pub is_running: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_sync_timestamp: Option<String>,
    pub sync_count: u64,
    pub total_records_processed: u64,
    pub last_batch_records: u64,
    pub last_error: Option<String>,
    pub last_error_timestamp: Option<String>,
}

impl MappingState {
    pub fn new(now: &str) -> Self {
        Self {
            is_running: false,
            created_at: now.to_string(),
            updated_at: now.to_string(),
            last_sync_timestamp: None,
            sync_count: 0,
            total_records_processed: 0,
            last_batch_records: 0,
            last_error: None,
            last_error_timestamp: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonlFileInfo {
    pub file_path: String,
    pub record_count: u64,
    pub file_size: u64,
    pub compressed: bool,
    /// Hex-encoded stable content hash, committed with the file's final byte.
    pub checksum: String,
    pub created_at: String,
    pub mapping_name: String,
    pub schema_slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadToken {
    pub token_id: String,
    pub upload_url: String,
    pub schema_slug: String,
    pub mapping_name: String,
    pub expires_at: i64,
    pub created_at: i64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// `300` second safety buffer baked into `UploadToken::is_valid`.
pub const TOKEN_SAFETY_BUFFER_SECS: i64 = 300;

impl UploadToken {
    pub fn is_valid(&self, now_unix: i64) -> bool {
        now_unix + TOKEN_SAFETY_BUFFER_SECS < self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResult {
    pub success: bool,
    pub file_info: JsonlFileInfo,
    pub upload_id: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub duration_ms: u64,
    pub bytes_uploaded: u64,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    pub bytes_uploaded: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub speed_bps: f64,
    pub eta_seconds: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryEventType {
    Heartbeat,
    RunStart,
    RunEnd,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub status: TelemetryStatus,
    pub bridge_version: String,
    pub sent_at: String,
    pub idempotency_key: String,
    pub host_hostname: String,
    pub host_os: String,
    pub run_id: String,
    pub source: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_uploaded: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_context: Option<serde_json::Value>,
}

/// One ordered row as pulled by a source adapter: column name -> converted JSON value.
pub type Row = Vec<(String, serde_json::Value)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub mapping_name: String,
    pub run_id: String,
    pub rows_extracted: u64,
    pub files_uploaded: u64,
    pub bytes_uploaded: u64,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_token_valid_respects_safety_buffer() {
        let token = UploadToken {
            token_id: "t".into(),
            upload_url: "https://example/u".into(),
            schema_slug: "s".into(),
            mapping_name: "m".into(),
            expires_at: 1000,
            created_at: 0,
            metadata: serde_json::Value::Null,
        };
        assert!(token.is_valid(600));
        assert!(!token.is_valid(701));
    }

    #[test]
    fn mapping_config_requires_pk_column_for_incremental_pk() {
        let cfg = MappingConfig {
            source: SourceRef {
                name: "db".into(),
                kind: SourceType::Mysql,
                connection_ref: "ref".into(),
            },
            table: "users".into(),
            schema: SchemaRef {
                id: "1".into(),
                name: "users".into(),
                slug: "users".into(),
                token_ref: "ref".into(),
            },
            transfer: TransferConfig {
                incremental_mode: IncrementalMode::IncrementalPk,
                pk_column: None,
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
        };
        assert!(cfg.validate().is_err());
    }
}
