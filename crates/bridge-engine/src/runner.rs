use std::sync::Arc;
use std::time::Instant;

use bridge_config::mapping_config::MappingConfigStore;
use bridge_config::paths::BridgePaths;
use bridge_core::clock::Clock;
use bridge_core::error::{
    AlreadyRunning, Canceled, ConnError, DeleteError, ExtractError, SyncError, UploadError, WatermarkError, WriteError,
};
use bridge_core::model::{IncrementalMode, MappingConfig, Row, SyncResult};
use bridge_jsonl::JsonlBatchWriter;
use bridge_source::adapter::{PkValue, SourceAdapter, SourceError};
use bridge_source::factory::SourceAdapterFactory;
use bridge_source::query::build_query;
use bridge_storage::MappingStateStore;
use bridge_upload::BatchUploader;
use tokio_util::sync::CancellationToken;

use crate::running_set::RunningSet;
use crate::telemetry::TelemetryEmitter;
use crate::watermark;

/// Knobs for the JSONL writer and connection validation. `max_file_size`
/// defaults from `original_source/sync/jsonl_writer.py`; `max_records_per_file`
/// is deliberately absent here because `original_source/sync/runner.py`
/// (`_write_jsonl_files`) always feeds the writer the mapping's own
/// `batch_size` for that threshold, not a fixed constant (this is what makes
/// a 100-row, `batch_size=40` dry run rotate into 40/40/20 files).
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub max_file_size: u64,
    pub compress: bool,
    pub validate_connection: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            compress: true,
            validate_connection: true,
        }
    }
}

/// Resolves `source.connection_ref` to an actual connection string. The
/// secret/datasource store that owns this mapping is out of scope; the CLI
/// entry point wires a concrete implementation, and tests supply fakes.
#[async_trait::async_trait]
pub trait ConnectionResolver: Send + Sync {
    async fn resolve(&self, connection_ref: &str) -> Result<String, anyhow::Error>;
}

/// Reads `BRIDGE_CONNECTION_<REF>` (uppercased, `.`/`-` folded to `_`). Thin
/// default builder for the CLI entry point; real deployments should inject a
/// resolver backed by their own secret store instead.
pub struct EnvConnectionResolver;

#[async_trait::async_trait]
impl ConnectionResolver for EnvConnectionResolver {
    async fn resolve(&self, connection_ref: &str) -> Result<String, anyhow::Error> {
        let var_name = format!(
            "BRIDGE_CONNECTION_{}",
            connection_ref.to_uppercase().replace(['.', '-'], "_")
        );
        std::env::var(&var_name)
            .map_err(|_| anyhow::anyhow!("connection_ref '{connection_ref}' not resolvable (expected env var {var_name})"))
    }
}

/// Builds the adapter for a resolved connection. Indirection over
/// `SourceAdapterFactory::create` so tests can inject a fake adapter without
/// a real database (§9's "pass as explicit collaborators" note).
pub trait AdapterFactory: Send + Sync {
    fn create(&self, cfg: &MappingConfig, connection_string: &str) -> Box<dyn SourceAdapter>;
}

pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, cfg: &MappingConfig, connection_string: &str) -> Box<dyn SourceAdapter> {
        SourceAdapterFactory::create(cfg, connection_string)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    pub dry_run: bool,
    /// Mirrors `force_full_sync` in the source this was ported from: ignores
    /// the stored watermark for this run's query, re-extracting from scratch.
    pub force: bool,
    pub batch_size_override: Option<u32>,
}

/// Every collaborator the runner needs, bundled so the CLI entry point can
/// build one instance and share it across every `sync_mapping` call.
pub struct SyncRunnerArgs {
    pub paths: BridgePaths,
    pub config_store: Arc<MappingConfigStore>,
    pub state_store: Arc<MappingStateStore>,
    pub connection_resolver: Arc<dyn ConnectionResolver>,
    pub adapter_factory: Arc<dyn AdapterFactory>,
    pub uploader: Arc<BatchUploader>,
    pub clock: Arc<dyn Clock>,
    pub running: Arc<RunningSet>,
    pub telemetry: Arc<TelemetryEmitter>,
    pub runner_config: RunnerConfig,
}

/// Drives one mapping through the full §4.1 state machine.
pub struct SyncRunner {
    paths: BridgePaths,
    config_store: Arc<MappingConfigStore>,
    state_store: Arc<MappingStateStore>,
    connection_resolver: Arc<dyn ConnectionResolver>,
    adapter_factory: Arc<dyn AdapterFactory>,
    uploader: Arc<BatchUploader>,
    clock: Arc<dyn Clock>,
    running: Arc<RunningSet>,
    telemetry: Arc<TelemetryEmitter>,
    runner_config: RunnerConfig,
}

impl SyncRunner {
    pub fn new(args: SyncRunnerArgs) -> Self {
        Self {
            paths: args.paths,
            config_store: args.config_store,
            state_store: args.state_store,
            connection_resolver: args.connection_resolver,
            adapter_factory: args.adapter_factory,
            uploader: args.uploader,
            clock: args.clock,
            running: args.running,
            telemetry: args.telemetry,
            runner_config: args.runner_config,
        }
    }

    pub async fn sync_mapping(&self, mapping_name: &str, opts: SyncOptions, cancel: CancellationToken) -> SyncResult {
        let started = Instant::now();
        let run_id = self.telemetry.run_id().to_string();

        if !self.running.try_start(mapping_name).await {
            let err = SyncError::AlreadyRunning(AlreadyRunning(mapping_name.to_string()));
            return self.result_without_state_change(mapping_name, &run_id, started, err);
        }

        let result = self.run_inner(mapping_name, &opts, &cancel, &run_id, started).await;
        self.running.finish(mapping_name).await;
        result
    }

    async fn run_inner(
        &self,
        mapping_name: &str,
        opts: &SyncOptions,
        cancel: &CancellationToken,
        run_id: &str,
        started: Instant,
    ) -> SyncResult {
        let cfg = match self.config_store.load(mapping_name).await {
            Ok(cfg) => cfg,
            Err(e) => {
                return self
                    .fail(mapping_name, run_id, started, SyncError::Config(e), mapping_name, false)
                    .await;
            }
        };
        if let Err(e) = cfg.validate() {
            return self.fail(mapping_name, run_id, started, SyncError::Config(e), &cfg.schema.slug, false).await;
        }

        if let Err(e) = self.state_store.start_sync(mapping_name).await {
            tracing::warn!(mapping_name, error = %e, "failed to persist run start");
        }
        self.telemetry.run_start(mapping_name, &cfg.schema.slug).await;

        let connection_string = match self.connection_resolver.resolve(&cfg.source.connection_ref).await {
            Ok(s) => s,
            Err(e) => {
                return self
                    .fail(mapping_name, run_id, started, SyncError::Conn(ConnError(e.to_string())), &cfg.schema.slug, true)
                    .await;
            }
        };

        let mut adapter = self.adapter_factory.create(&cfg, &connection_string);
        if let Err(e) = adapter.connect().await {
            return self
                .fail(mapping_name, run_id, started, source_to_conn(e), &cfg.schema.slug, true)
                .await;
        }
        if self.runner_config.validate_connection {
            if let Err(e) = adapter.test_connection().await {
                adapter.disconnect().await;
                return self
                    .fail(mapping_name, run_id, started, source_to_conn(e), &cfg.schema.slug, true)
                    .await;
            }
        }

        let batch_size = opts.batch_size_override.unwrap_or(cfg.transfer.batch_size);
        let query_cfg = if opts.force { full_rescan_cfg(&cfg) } else { cfg.clone() };
        let query = match build_query(&query_cfg) {
            Ok(q) => q,
            Err(e) => {
                adapter.disconnect().await;
                return self.fail(mapping_name, run_id, started, SyncError::Config(e), &cfg.schema.slug, true).await;
            }
        };

        let watermark_column = watermark_column_for(&cfg);
        let delete_pk_column = resolve_delete_pk_column(&cfg);

        let outcome =
            match self.extract_and_write(adapter.as_mut(), &query, batch_size, cancel, mapping_name, &cfg.schema.slug, watermark_column, delete_pk_column).await {
                Ok(outcome) => outcome,
                Err(ExtractOutcome::Canceled) => {
                    adapter.disconnect().await;
                    return self.fail(mapping_name, run_id, started, SyncError::Canceled(Canceled), &cfg.schema.slug, true).await;
                }
                Err(ExtractOutcome::Error(e)) => {
                    adapter.disconnect().await;
                    return self
                        .fail(
                            mapping_name,
                            run_id,
                            started,
                            SyncError::Extract(ExtractError { message: e.to_string(), sanitised_sql: Some(query.clone()) }),
                            &cfg.schema.slug,
                            true,
                        )
                        .await;
                }
                Err(ExtractOutcome::Write(e)) => {
                    adapter.disconnect().await;
                    self.cleanup_mapping_files(mapping_name).await;
                    return self
                        .fail(mapping_name, run_id, started, SyncError::Write(WriteError(e.to_string())), &cfg.schema.slug, true)
                        .await;
                }
            };
        adapter.disconnect().await;

        let ExtractWriteOutcome { rows_extracted, files, watermark, pk_values } = outcome;

        if rows_extracted == 0 {
            return self.finish_success(mapping_name, run_id, started, &cfg, 0, 0, 0, 0, None).await;
        }

        if cfg.transfer.min_records_for_upload > 0 && rows_extracted < cfg.transfer.min_records_for_upload {
            self.remove_uploaded_files(&files).await;
            self.cleanup_mapping_files(mapping_name).await;
            let message = format!(
                "se extrajeron {rows_extracted} registros, por debajo del mínimo requerido de {} para subir ({mapping_name})",
                cfg.transfer.min_records_for_upload
            );
            return self
                .finish_success(mapping_name, run_id, started, &cfg, rows_extracted, 0, 0, 0, Some(message))
                .await;
        }

        if opts.dry_run {
            return self
                .finish_success(mapping_name, run_id, started, &cfg, rows_extracted, 0, 0, 0, None)
                .await;
        }

        if cancel.is_cancelled() {
            return self.fail(mapping_name, run_id, started, SyncError::Canceled(Canceled), &cfg.schema.slug, true).await;
        }

        let upload_results = self.uploader.upload_files(&files, &cfg.schema.slug, mapping_name, None, cancel.clone()).await;
        if let Some(failed) = upload_results.iter().find(|r| !r.success) {
            let message = failed.error_message.clone().unwrap_or_else(|| "upload failed".to_string());
            return self
                .fail(
                    mapping_name,
                    run_id,
                    started,
                    SyncError::Upload(UploadError(message)),
                    &cfg.schema.slug,
                    false,
                )
                .await;
        }

        let bytes_uploaded: u64 = upload_results.iter().map(|r| r.bytes_uploaded).sum();
        let retry_count: u32 = upload_results.iter().map(|r| r.retry_count).sum();

        self.delete_uploaded_rows(&cfg, delete_pk_column, &pk_values).await;
        self.remove_uploaded_files(&files).await;
        self.cleanup_mapping_files(mapping_name).await;
        self.advance_watermark_if_applicable(&cfg, mapping_name, watermark).await;

        self.finish_success(
            mapping_name,
            run_id,
            started,
            &cfg,
            rows_extracted,
            files.len() as u64,
            bytes_uploaded,
            retry_count,
            None,
        )
        .await
    }

    /// Drives the adapter's `BoxStream` directly into the JSONL writer,
    /// keeping only the running `max(watermark_column)` and (when
    /// `delete_after_upload` applies) the accumulated `pk_column` values in
    /// memory rather than the full row set (§9 rearchitecture note).
    #[allow(clippy::too_many_arguments)]
    async fn extract_and_write(
        &self,
        adapter: &mut dyn SourceAdapter,
        query: &str,
        batch_size: u32,
        cancel: &CancellationToken,
        mapping_name: &str,
        schema_slug: &str,
        watermark_column: Option<&str>,
        delete_pk_column: Option<&str>,
    ) -> Result<ExtractWriteOutcome, ExtractOutcome> {
        use futures_util::StreamExt as _;

        let mut writer = JsonlBatchWriter::new(
            self.paths.tmp_uploads_dir.clone(),
            mapping_name,
            schema_slug,
            self.clock.clone(),
            self.runner_config.max_file_size,
            batch_size as u64,
            self.runner_config.compress,
        );
        let mut tracker = watermark::WatermarkTracker::new(watermark_column);
        let mut pk_values = Vec::new();
        let mut rows_extracted: u64 = 0;

        let mut stream = adapter.extract(query, batch_size);
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort_writer(writer).await;
                    return Err(ExtractOutcome::Canceled);
                },
                next = stream.next() => match next {
                    Some(Ok(batch)) => batch,
                    Some(Err(e)) => {
                        self.abort_writer(writer).await;
                        return Err(ExtractOutcome::Error(e));
                    }
                    None => break,
                },
            };
            for row in &batch {
                if cancel.is_cancelled() {
                    self.abort_writer(writer).await;
                    return Err(ExtractOutcome::Canceled);
                }
                tracker.observe(row);
                if let Some(pk_column) = delete_pk_column {
                    if let Some(value) = watermark::pk_value_of(row, pk_column) {
                        pk_values.push(value);
                    }
                }
                if let Err(e) = writer.write_record(row).await {
                    self.abort_writer(writer).await;
                    return Err(ExtractOutcome::Write(e));
                }
                rows_extracted += 1;
            }
        }

        let files = writer.close().await.map_err(ExtractOutcome::Write)?;
        Ok(ExtractWriteOutcome { rows_extracted, files, watermark: tracker.finish(), pk_values })
    }

    /// Flushes and closes `writer` on a cancellation path, then discards the
    /// files it produced — the run won't upload them, so nothing should be
    /// left behind in the uploads directory.
    async fn abort_writer(&self, writer: JsonlBatchWriter) {
        match writer.close().await {
            Ok(files) => self.remove_uploaded_files(&files).await,
            Err(e) => tracing::warn!(error = %e, "failed to close writer while aborting extraction"),
        }
    }

    async fn delete_uploaded_rows(&self, cfg: &MappingConfig, pk_column: Option<&str>, pk_values: &[PkValue]) {
        let Some(pk_column) = pk_column else {
            return;
        };
        for chunk in pk_values.chunks(1000) {
            // A fresh adapter per delete chunk: the extraction adapter has
            // already disconnected by this point (§4.1 step 5 runs after
            // EXTRACTED, with its own short-lived connection).
            let connection_string = match self.connection_resolver.resolve(&cfg.source.connection_ref).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(mapping_name = %cfg.mapping_name(), error = %e, "delete skipped: connection unresolvable");
                    return;
                }
            };
            let mut adapter = self.adapter_factory.create(cfg, &connection_string);
            if let Err(e) = adapter.connect().await {
                tracing::warn!(mapping_name = %cfg.mapping_name(), error = %e, "delete skipped: connect failed");
                return;
            }
            let outcome = adapter.delete_by_pk(&cfg.table, pk_column, chunk).await;
            adapter.disconnect().await;
            if let Err(e) = outcome {
                let err = SyncError::Delete(DeleteError(e.to_string()));
                tracing::warn!(mapping_name = %cfg.mapping_name(), error = %err, "post-upload delete failed, non-fatal");
                return;
            }
        }
    }

    async fn remove_uploaded_files(&self, files: &[bridge_core::model::JsonlFileInfo]) {
        for file in files {
            if let Err(e) = tokio::fs::remove_file(&file.file_path).await {
                tracing::debug!(file = %file.file_path, error = %e, "failed to remove uploaded jsonl file");
            }
        }
    }

    async fn cleanup_mapping_files(&self, mapping_name: &str) {
        let prefix = format!("{mapping_name}_");
        let Ok(mut entries) = tokio::fs::read_dir(&self.paths.tmp_uploads_dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with(&prefix)) {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    async fn advance_watermark_if_applicable(&self, cfg: &MappingConfig, mapping_name: &str, watermark: Option<String>) {
        let Some(new_watermark) = watermark else {
            return;
        };
        if let Err(e) = self.config_store.advance_watermark(mapping_name, &new_watermark).await {
            let err = SyncError::Watermark(WatermarkError(e.to_string()));
            tracing::warn!(mapping_name, error = %err, "watermark advance failed, non-fatal");
        }
    }

    async fn finish_success(
        &self,
        mapping_name: &str,
        run_id: &str,
        started: Instant,
        cfg: &MappingConfig,
        rows_extracted: u64,
        files_uploaded: u64,
        bytes_uploaded: u64,
        retry_count: u32,
        message: Option<String>,
    ) -> SyncResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self.state_store.finish_sync_success(mapping_name, rows_extracted).await {
            tracing::warn!(mapping_name, error = %e, "failed to persist successful run");
        }
        let now = self.clock.now_rfc3339();
        if let Err(e) = self
            .config_store
            .record_run(mapping_name, &cfg.transfer.initial_watermark, &now, true, run_id, rows_extracted, files_uploaded)
            .await
        {
            tracing::debug!(mapping_name, error = %e, "failed to update mapping history");
        }
        self.telemetry
            .run_end(
                mapping_name,
                &cfg.schema.slug,
                true,
                duration_ms,
                rows_extracted,
                bytes_uploaded,
                retry_count,
                message.clone(),
                None,
            )
            .await;

        SyncResult {
            success: true,
            mapping_name: mapping_name.to_string(),
            run_id: run_id.to_string(),
            rows_extracted,
            files_uploaded,
            bytes_uploaded,
            error_message: message,
            duration_ms,
        }
    }

    async fn fail(
        &self,
        mapping_name: &str,
        run_id: &str,
        started: Instant,
        error: SyncError,
        destination: &str,
        state_was_started: bool,
    ) -> SyncResult {
        let duration_ms = started.elapsed().as_millis() as u64;
        let message = error.to_string();
        let code = error.code();

        if state_was_started {
            if let Err(e) = self.state_store.finish_sync_error(mapping_name, &message).await {
                tracing::warn!(mapping_name, error = %e, "failed to persist failed run");
            }
        }
        self.telemetry.error(mapping_name, destination, code, &message).await;
        self.telemetry
            .run_end(mapping_name, destination, false, duration_ms, 0, 0, 0, Some(message.clone()), Some(code.to_string()))
            .await;

        SyncResult {
            success: false,
            mapping_name: mapping_name.to_string(),
            run_id: run_id.to_string(),
            rows_extracted: 0,
            files_uploaded: 0,
            bytes_uploaded: 0,
            error_message: Some(message),
            duration_ms,
        }
    }

    /// `AlreadyRunning` never touched the state store or adapters; it fails
    /// before `STARTED` (§4.1's reentrancy check).
    fn result_without_state_change(&self, mapping_name: &str, run_id: &str, started: Instant, error: SyncError) -> SyncResult {
        SyncResult {
            success: false,
            mapping_name: mapping_name.to_string(),
            run_id: run_id.to_string(),
            rows_extracted: 0,
            files_uploaded: 0,
            bytes_uploaded: 0,
            error_message: Some(error.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Result of streaming extraction straight into the JSONL writer: only the
/// finished files and the two running accumulators survive past the stream,
/// never the rows themselves.
struct ExtractWriteOutcome {
    rows_extracted: u64,
    files: Vec<bridge_core::model::JsonlFileInfo>,
    watermark: Option<String>,
    pk_values: Vec<PkValue>,
}

enum ExtractOutcome {
    Canceled,
    Error(SourceError),
    Write(anyhow::Error),
}

fn source_to_conn(e: SourceError) -> SyncError {
    match e {
        SourceError::Conn(c) => SyncError::Conn(c),
        other => SyncError::Conn(ConnError(other.to_string())),
    }
}

/// The column whose running maximum becomes the next `initial_watermark`,
/// selected the same way `advance_watermark_if_applicable` always has.
fn watermark_column_for(cfg: &MappingConfig) -> Option<&str> {
    match cfg.transfer.incremental_mode {
        IncrementalMode::IncrementalPk => cfg.transfer.pk_column.as_deref(),
        IncrementalMode::IncrementalTimestamp => cfg.transfer.timestamp_column.as_deref(),
        IncrementalMode::Full | IncrementalMode::CustomSql => None,
    }
}

/// The `pk_column` to accumulate values for during extraction, or `None` if
/// `delete_after_upload` doesn't apply this run. Warns once, up front,
/// instead of after the fact, when `delete_safety` blocks it.
fn resolve_delete_pk_column(cfg: &MappingConfig) -> Option<&str> {
    if !cfg.transfer.delete_after_upload {
        return None;
    }
    let pk_column = cfg.transfer.pk_column.as_deref()?;
    if cfg.transfer.delete_safety.enabled && cfg.transfer.delete_safety.where_column.is_none() {
        tracing::warn!(
            mapping_name = %cfg.mapping_name(),
            "delete_after_upload skipped: delete_safety.enabled but no where_column configured"
        );
        return None;
    }
    Some(pk_column)
}

/// Clone of `cfg` with `initial_watermark` reset to `"0"`, used only to build
/// this run's query when `--force` asks for a complete re-scan.
fn full_rescan_cfg(cfg: &MappingConfig) -> MappingConfig {
    let mut cfg = cfg.clone();
    cfg.transfer.initial_watermark = "0".to_string();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_api::ApiClient;
    use bridge_core::clock::FixedClock;
    use bridge_core::model::{DeleteSafety, SchemaRef, SourceRef, SourceType, TransferConfig};
    use bridge_storage::TokenCache;
    use bridge_upload::FileUploader;
    use futures_util::stream::{self, BoxStream};

    struct FakeResolver;
    #[async_trait::async_trait]
    impl ConnectionResolver for FakeResolver {
        async fn resolve(&self, _connection_ref: &str) -> Result<String, anyhow::Error> {
            Ok("fake-connection".to_string())
        }
    }

    struct FakeAdapter {
        rows: Vec<Row>,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for FakeAdapter {
        async fn connect(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
        async fn test_connection(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
        fn extract<'a>(&'a mut self, _query: &'a str, batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>> {
            let chunks: Vec<Vec<Row>> = self
                .rows
                .chunks(batch_size.max(1) as usize)
                .map(|c| c.to_vec())
                .collect();
            Box::pin(stream::iter(chunks.into_iter().map(Ok)))
        }
        async fn delete_by_pk(&mut self, _table: &str, _pk_column: &str, values: &[PkValue]) -> Result<u64, SourceError> {
            Ok(values.len() as u64)
        }
        async fn disconnect(&mut self) {}
    }

    struct FakeAdapterFactory {
        rows: Vec<Row>,
    }
    impl AdapterFactory for FakeAdapterFactory {
        fn create(&self, _cfg: &MappingConfig, _connection_string: &str) -> Box<dyn SourceAdapter> {
            Box::new(FakeAdapter { rows: self.rows.clone() })
        }
    }

    fn sample_cfg(min_records_for_upload: u64) -> MappingConfig {
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
                batch_size: 40,
                order_by: None,
                min_records_for_upload,
                delete_after_upload: false,
                delete_safety: DeleteSafety { enabled: false, where_column: None },
            },
            query: None,
        }
    }

    fn row(id: i64) -> Row {
        vec![("id".to_string(), serde_json::Value::from(id)), ("name".to_string(), serde_json::Value::String("a".into()))]
    }

    async fn build_runner(tmp: &std::path::Path, rows: Vec<Row>) -> (SyncRunner, Arc<MappingConfigStore>) {
        let paths = BridgePaths::from_base(tmp.to_path_buf());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock { unix: 1_700_000_000 });
        let config_store = Arc::new(MappingConfigStore::new(paths.clone()));
        let state_store = Arc::new(MappingStateStore::load(paths.sync_state_file(), clock.clone()).await.unwrap());
        let api = Arc::new(ApiClient::new(url::Url::parse("https://api.datasnap.cloud").unwrap(), "key").unwrap());
        let tokens = Arc::new(TokenCache::load(paths.upload_tokens_file(), clock.clone()).await.unwrap());
        let file_uploader = Arc::new(FileUploader::new(api.clone(), tokens, clock.clone()));
        let uploader = Arc::new(BatchUploader::new(file_uploader, 3));
        let telemetry = Arc::new(TelemetryEmitter::new(api, clock.clone()));

        let args = SyncRunnerArgs {
            paths,
            config_store: config_store.clone(),
            state_store,
            connection_resolver: Arc::new(FakeResolver),
            adapter_factory: Arc::new(FakeAdapterFactory { rows }),
            uploader,
            clock,
            running: Arc::new(RunningSet::new()),
            telemetry,
            runner_config: RunnerConfig::default(),
        };
        (SyncRunner::new(args), config_store)
    }

    #[tokio::test]
    async fn below_min_records_skips_with_minimo_message() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let rows = vec![row(1), row(2), row(3)];
        let (runner, config_store) = build_runner(tmp.path(), rows).await;
        let cfg = sample_cfg(5);
        config_store.save("mydb.users", &cfg).await?;

        let result = runner.sync_mapping("mydb.users", SyncOptions::default(), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.files_uploaded, 0);
        assert!(result.error_message.as_deref().unwrap().contains("mínimo"));

        let reloaded = config_store.load("mydb.users").await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        assert_eq!(reloaded.transfer.initial_watermark, "0");

        // the below-threshold JSONL files are streamed to disk before the
        // count is known, then swept away — the external contract is still
        // "no files" once the run finishes.
        let mut entries = tokio::fs::read_dir(tmp.path().join(".bridge/tmp/uploads")).await?;
        assert!(entries.next_entry().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn dry_run_writes_files_without_uploading_or_advancing_watermark() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let rows: Vec<Row> = (1..=100).map(row).collect();
        let (runner, config_store) = build_runner(tmp.path(), rows).await;
        let cfg = sample_cfg(0);
        config_store.save("mydb.users", &cfg).await?;

        let opts = SyncOptions { dry_run: true, ..Default::default() };
        let result = runner.sync_mapping("mydb.users", opts, CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.files_uploaded, 0);
        assert_eq!(result.rows_extracted, 100);

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(tmp.path().join(".bridge/tmp/uploads")).await?;
        while entries.next_entry().await?.is_some() {
            count += 1;
        }
        assert_eq!(count, 3);

        let reloaded = config_store.load("mydb.users").await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        assert_eq!(reloaded.transfer.initial_watermark, "0");
        Ok(())
    }

    #[tokio::test]
    async fn second_concurrent_call_is_rejected_without_touching_state() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let (runner, config_store) = build_runner(tmp.path(), vec![row(1)]).await;
        let cfg = sample_cfg(0);
        config_store.save("mydb.users", &cfg).await?;

        assert!(runner.running.try_start("mydb.users").await);
        let result = runner.sync_mapping("mydb.users", SyncOptions::default(), CancellationToken::new()).await;
        assert!(!result.success);
        assert!(result.error_message.as_deref().unwrap().contains("already running"));
        Ok(())
    }

    #[tokio::test]
    async fn zero_rows_is_success_with_no_files() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let (runner, config_store) = build_runner(tmp.path(), vec![]).await;
        let cfg = sample_cfg(0);
        config_store.save("mydb.users", &cfg).await?;

        let result = runner.sync_mapping("mydb.users", SyncOptions::default(), CancellationToken::new()).await;
        assert!(result.success);
        assert_eq!(result.rows_extracted, 0);
        assert_eq!(result.files_uploaded, 0);
        Ok(())
    }
}
