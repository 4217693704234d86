use std::sync::Arc;

use bridge_core::model::{JsonlFileInfo, UploadResult};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::uploader::{FileUploader, ProgressCallback};

/// Uploads a batch of files with bounded concurrency, mirroring the
/// `ThreadPoolExecutor(max_workers=...)` shape of
/// `original_source/sync/uploader.py::BatchUploader`, rebuilt on a
/// `tokio::sync::Semaphore` in the style of `WebdavRequestLimiter`'s
/// concurrency gate.
pub struct BatchUploader {
    uploader: Arc<FileUploader>,
    max_concurrent: usize,
}

impl BatchUploader {
    pub fn new(uploader: Arc<FileUploader>, max_concurrent: usize) -> Self {
        Self {
            uploader,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Uploads every file, preserving input order in the returned results
    /// regardless of completion order. `cancel` is raced against each
    /// in-flight upload so a cancelled run doesn't wait out the retry loop.
    pub async fn upload_files(
        &self,
        files: &[JsonlFileInfo],
        schema_slug: &str,
        mapping_name: &str,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Vec<UploadResult> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::with_capacity(files.len());

        for file_info in files {
            let uploader = self.uploader.clone();
            let semaphore = semaphore.clone();
            let schema_slug = schema_slug.to_string();
            let mapping_name = mapping_name.to_string();
            let progress = progress.clone();
            let file_info = file_info.clone();
            let cancel = cancel.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                uploader.upload_file(&file_info, &schema_slug, &mapping_name, progress, cancel).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(join_error) => results.push(UploadResult {
                    success: false,
                    file_info: JsonlFileInfo {
                        file_path: String::new(),
                        record_count: 0,
                        file_size: 0,
                        compressed: false,
                        checksum: String::new(),
                        created_at: String::new(),
                        mapping_name: mapping_name.to_string(),
                        schema_slug: schema_slug.to_string(),
                    },
                    upload_id: None,
                    error_message: Some(format!("upload task panicked: {join_error}")),
                    error_code: Some("panic".to_string()),
                    duration_ms: 0,
                    bytes_uploaded: 0,
                    retry_count: 0,
                }),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::{Multipart, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use bridge_api::ApiClient;
    use bridge_core::clock::{Clock, FixedClock};
    use bridge_storage::TokenCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct TestState {
        put_calls: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    }

    async fn spawn_server() -> (reqwest::Url, TestState) {
        let state = TestState::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upload_url = format!("http://{addr}/uploads/");

        let app = axum::Router::new()
            .route(
                "/v1/schemas/{slug}/generate-upload-token",
                post({
                    let upload_url = upload_url.clone();
                    move || {
                        let upload_url = upload_url.clone();
                        async move {
                            Json(serde_json::json!({
                                "upload_id": "up1",
                                "upload_url": upload_url,
                                "expires_at": 9_999_999_999i64,
                            }))
                        }
                    }
                }),
            )
            .route(
                "/uploads/{file_name}",
                post(
                    |State(state): State<TestState>, mut multipart: Multipart| async move {
                        let current = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        state.max_in_flight.fetch_max(current, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                        while let Ok(Some(field)) = multipart.next_field().await {
                            let _ = field.bytes().await;
                        }
                        state.put_calls.fetch_add(1, Ordering::SeqCst);
                        state.in_flight.fetch_sub(1, Ordering::SeqCst);
                        AxumStatus::OK.into_response()
                    },
                ),
            )
            .route(
                "/v1/schemas/{slug}/uploads/notify",
                post(|| async { Json(serde_json::json!({"success": true})) }),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (reqwest::Url::parse(&format!("http://{addr}/")).unwrap(), state)
    }

    async fn make_file(dir: &std::path::Path, name: &str) -> JsonlFileInfo {
        let path = dir.join(name);
        tokio::fs::write(&path, "{\"id\":1}\n").await.unwrap();
        JsonlFileInfo {
            file_path: path.to_string_lossy().to_string(),
            record_count: 1,
            file_size: 9,
            compressed: false,
            checksum: "deadbeef".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            mapping_name: "mydb.users".to_string(),
            schema_slug: "users".to_string(),
        }
    }

    #[tokio::test]
    async fn upload_files_respects_concurrency_cap_and_preserves_order() -> Result<(), anyhow::Error> {
        let (base, state) = spawn_server().await;
        let api = Arc::new(ApiClient::new(base, "key")?);
        let tmp = tempfile::TempDir::new()?;
        let clock: Arc<dyn Clock> = Arc::new(FixedClock { unix: 1_700_000_000 });
        let tokens = Arc::new(TokenCache::load(tmp.path().join("upload_tokens.json"), clock.clone()).await?);
        let uploader = Arc::new(FileUploader::new(api, tokens, clock));
        let batch = BatchUploader::new(uploader, 2);

        let file_dir = tempfile::TempDir::new()?;
        let files = vec![
            make_file(file_dir.path(), "f0.jsonl").await,
            make_file(file_dir.path(), "f1.jsonl").await,
            make_file(file_dir.path(), "f2.jsonl").await,
            make_file(file_dir.path(), "f3.jsonl").await,
        ];

        let results = batch.upload_files(&files, "users", "mydb.users", None, CancellationToken::new()).await;
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert!(result.success, "{:?}", result.error_message);
            assert_eq!(result.file_info.file_path, files[i].file_path);
        }
        assert_eq!(state.put_calls.load(Ordering::SeqCst), 4);
        assert!(state.max_in_flight.load(Ordering::SeqCst) <= 2);
        Ok(())
    }
}
