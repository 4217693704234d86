use std::collections::HashMap;
use std::sync::Arc;

use bridge_config::mapping_config::MappingConfigStore;
use bridge_core::model::{MappingState, SyncResult};
use bridge_storage::MappingStateStore;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::runner::{SyncOptions, SyncRunner};

/// `max_workers` mapping-level concurrency (§4.7, §5's "mapping-level dispatcher pool").
const DEFAULT_MAX_WORKERS: usize = 4;

pub struct SyncDispatcherArgs {
    pub config_store: Arc<MappingConfigStore>,
    pub state_store: Arc<MappingStateStore>,
    pub runner: Arc<SyncRunner>,
    pub max_workers: usize,
}

/// `results` holds every mapping that finished before cancellation (or all of
/// them, if `canceled` is false); `sync_many`/`sync_all` never drop a
/// completed result just because a later one was cut short (§4.7: "partial
/// results are still returned").
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub results: Vec<SyncResult>,
    pub canceled: bool,
}

/// Multi-mapping orchestrator (C12). One instance is shared across an entire
/// CLI invocation; `runner` itself is shared and stateless across calls.
pub struct SyncDispatcher {
    config_store: Arc<MappingConfigStore>,
    state_store: Arc<MappingStateStore>,
    runner: Arc<SyncRunner>,
    max_workers: usize,
}

impl SyncDispatcher {
    pub fn new(args: SyncDispatcherArgs) -> Self {
        Self {
            config_store: args.config_store,
            state_store: args.state_store,
            runner: args.runner,
            max_workers: args.max_workers.max(1),
        }
    }

    pub fn with_default_workers(
        config_store: Arc<MappingConfigStore>,
        state_store: Arc<MappingStateStore>,
        runner: Arc<SyncRunner>,
    ) -> Self {
        Self::new(SyncDispatcherArgs { config_store, state_store, runner, max_workers: DEFAULT_MAX_WORKERS })
    }

    pub async fn sync_all(&self, opts: SyncOptions, parallel: bool, cancel: CancellationToken) -> DispatchOutcome {
        let names = self.config_store.list_names().await.unwrap_or_default();
        self.sync_many(&names, opts, parallel, cancel).await
    }

    pub async fn sync_one(&self, name: &str, opts: SyncOptions, cancel: CancellationToken) -> SyncResult {
        self.runner.sync_mapping(name, opts, cancel).await
    }

    /// Parallel mode bounds concurrency with a semaphore sized to
    /// `max_workers`; sequential mode runs strictly one at a time in input
    /// order, checking `cancel` between mappings so a SIGINT stops launching
    /// new runs without aborting one already in flight mid-step (§5's
    /// cooperative cancellation contract is honoured inside the runner itself).
    pub async fn sync_many(&self, names: &[String], opts: SyncOptions, parallel: bool, cancel: CancellationToken) -> DispatchOutcome {
        if parallel {
            self.sync_many_parallel(names, opts, cancel).await
        } else {
            self.sync_many_sequential(names, opts, cancel).await
        }
    }

    async fn sync_many_sequential(&self, names: &[String], opts: SyncOptions, cancel: CancellationToken) -> DispatchOutcome {
        let mut results = Vec::with_capacity(names.len());
        let mut canceled = false;
        for name in names {
            if cancel.is_cancelled() {
                canceled = true;
                break;
            }
            results.push(self.runner.sync_mapping(name, opts.clone(), cancel.clone()).await);
        }
        DispatchOutcome { results, canceled }
    }

    async fn sync_many_parallel(&self, names: &[String], opts: SyncOptions, cancel: CancellationToken) -> DispatchOutcome {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = Vec::with_capacity(names.len());

        for name in names {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let opts = opts.clone();
            let name = name.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                runner.sync_mapping(&name, opts, cancel).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            if let Ok(result) = task.await {
                results.push(result);
            }
        }
        DispatchOutcome { results, canceled: cancel.is_cancelled() }
    }

    pub async fn status(&self) -> HashMap<String, MappingState> {
        self.state_store.all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_api::ApiClient;
    use bridge_core::clock::{Clock, FixedClock};
    use bridge_core::model::{
        DeleteSafety, IncrementalMode, MappingConfig, Row, SchemaRef, SourceRef, SourceType, TransferConfig,
    };
    use bridge_config::paths::BridgePaths;
    use bridge_source::adapter::{PkValue, SourceAdapter, SourceError};
    use bridge_storage::TokenCache;
    use bridge_upload::{BatchUploader, FileUploader};
    use futures_util::stream::{self, BoxStream};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::runner::{AdapterFactory, ConnectionResolver, RunnerConfig, SyncRunnerArgs};
    use crate::running_set::RunningSet;
    use crate::telemetry::TelemetryEmitter;

    struct FakeResolver;
    #[async_trait::async_trait]
    impl ConnectionResolver for FakeResolver {
        async fn resolve(&self, _connection_ref: &str) -> Result<String, anyhow::Error> {
            Ok("fake-connection".to_string())
        }
    }

    #[derive(Clone, Default)]
    struct Counters {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    struct SlowFakeAdapter {
        counters: Counters,
        row: Row,
    }

    #[async_trait::async_trait]
    impl SourceAdapter for SlowFakeAdapter {
        async fn connect(&mut self) -> Result<(), SourceError> {
            let current = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.counters.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(())
        }
        async fn test_connection(&mut self) -> Result<(), SourceError> {
            Ok(())
        }
        fn extract<'a>(&'a mut self, _query: &'a str, _batch_size: u32) -> BoxStream<'a, Result<Vec<Row>, SourceError>> {
            Box::pin(stream::iter(vec![Ok(vec![self.row.clone()])]))
        }
        async fn delete_by_pk(&mut self, _table: &str, _pk_column: &str, _values: &[PkValue]) -> Result<u64, SourceError> {
            Ok(0)
        }
        async fn disconnect(&mut self) {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct SlowFakeAdapterFactory {
        counters: Counters,
    }
    impl AdapterFactory for SlowFakeAdapterFactory {
        fn create(&self, cfg: &MappingConfig, _connection_string: &str) -> Box<dyn SourceAdapter> {
            let id: i64 = cfg.mapping_name().len() as i64;
            Box::new(SlowFakeAdapter {
                counters: self.counters.clone(),
                row: vec![("id".to_string(), serde_json::Value::from(id))],
            })
        }
    }

    fn cfg(name: &str) -> MappingConfig {
        MappingConfig {
            source: SourceRef { name: name.to_string(), kind: SourceType::Mysql, connection_ref: name.to_string() },
            table: "t".into(),
            schema: SchemaRef { id: "1".into(), name: "s".into(), slug: "s".into(), token_ref: "s".into() },
            transfer: TransferConfig {
                incremental_mode: IncrementalMode::Full,
                pk_column: None,
                timestamp_column: None,
                initial_watermark: "0".into(),
                batch_size: 10,
                order_by: None,
                min_records_for_upload: 0,
                delete_after_upload: false,
                delete_safety: DeleteSafety { enabled: false, where_column: None },
            },
            query: None,
        }
    }

    async fn build_dispatcher(tmp: &std::path::Path, max_workers: usize) -> (SyncDispatcher, Counters) {
        let counters = Counters::default();
        let paths = BridgePaths::from_base(tmp.to_path_buf());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock { unix: 1_700_000_000 });
        let config_store = Arc::new(MappingConfigStore::new(paths.clone()));
        let state_store = Arc::new(MappingStateStore::load(paths.sync_state_file(), clock.clone()).await.unwrap());
        let api = Arc::new(ApiClient::new(url::Url::parse("https://api.datasnap.cloud").unwrap(), "key").unwrap());
        let tokens = Arc::new(TokenCache::load(paths.upload_tokens_file(), clock.clone()).await.unwrap());
        let file_uploader = Arc::new(FileUploader::new(api.clone(), tokens, clock.clone()));
        let uploader = Arc::new(BatchUploader::new(file_uploader, 3));
        let telemetry = Arc::new(TelemetryEmitter::new(api, clock.clone()));

        let runner = Arc::new(SyncRunner::new(SyncRunnerArgs {
            paths,
            config_store: config_store.clone(),
            state_store: state_store.clone(),
            connection_resolver: Arc::new(FakeResolver),
            adapter_factory: Arc::new(SlowFakeAdapterFactory { counters: counters.clone() }),
            uploader,
            clock,
            running: Arc::new(RunningSet::new()),
            telemetry,
            runner_config: RunnerConfig::default(),
        }));

        (
            SyncDispatcher::new(SyncDispatcherArgs { config_store, state_store, runner, max_workers }),
            counters,
        )
    }

    #[tokio::test]
    async fn parallel_sync_respects_max_workers() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let (dispatcher, counters) = build_dispatcher(tmp.path(), 2).await;
        for name in ["a", "b", "c", "d"] {
            dispatcher.config_store.save(&format!("{name}.t"), &cfg(name)).await?;
        }
        let names = vec!["a.t".to_string(), "b.t".to_string(), "c.t".to_string(), "d.t".to_string()];

        let outcome = dispatcher.sync_many(&names, SyncOptions::default(), true, CancellationToken::new()).await;
        assert_eq!(outcome.results.len(), 4);
        assert!(outcome.results.iter().all(|r| r.success), "{:?}", outcome.results);
        assert!(counters.max_in_flight.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn sequential_sync_preserves_input_order_and_both_mappings_finish_independently() -> Result<(), anyhow::Error> {
        let tmp = tempfile::TempDir::new()?;
        let (dispatcher, _counters) = build_dispatcher(tmp.path(), 4).await;
        dispatcher.config_store.save("a.t", &cfg("a")).await?;
        dispatcher.config_store.save("b.t", &cfg("b")).await?;
        let names = vec!["a.t".to_string(), "b.t".to_string()];

        let outcome = dispatcher.sync_many(&names, SyncOptions::default(), false, CancellationToken::new()).await;
        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.results[0].mapping_name, "a.t");
        assert_eq!(outcome.results[1].mapping_name, "b.t");

        let status = dispatcher.status().await;
        assert!(status.contains_key("a.t"));
        assert!(status.contains_key("b.t"));
        Ok(())
    }
}
