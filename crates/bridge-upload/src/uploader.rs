use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bridge_api::ApiClient;
use bridge_core::clock::Clock;
use bridge_core::model::{JsonlFileInfo, UploadProgress, UploadResult, UploadToken};
use bridge_storage::TokenCache;
use futures_util::TryStreamExt as _;
use reqwest::StatusCode;
use tokio::io::AsyncReadExt as _;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

/// `min_retries + 1` total attempts (§4.6: "up to 3 retries"), backoff
/// `2^attempt` seconds between attempts, same doubling shape as
/// `original_source/sync/uploader.py::FileUploader.upload_file`.
const MAX_RETRIES: u32 = 3;
const TOKEN_MINUTES: u32 = 30;

/// Invoked at most once per second with the current transfer state; must not
/// block the upload (§4.6). Plain `Fn`, not `FnMut` — callers close over an
/// `Arc<Mutex<_>>` or atomic if they need to accumulate state.
pub type ProgressCallback = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Uploads one JSONL file through the token → `PUT` → notify protocol of §4.6.
pub struct FileUploader {
    api: Arc<ApiClient>,
    tokens: Arc<TokenCache>,
    clock: Arc<dyn Clock>,
}

impl FileUploader {
    pub fn new(api: Arc<ApiClient>, tokens: Arc<TokenCache>, clock: Arc<dyn Clock>) -> Self {
        Self { api, tokens, clock }
    }

    async fn get_upload_token(&self, schema_slug: &str, mapping_name: &str) -> Result<UploadToken, anyhow::Error> {
        if let Some(token) = self.tokens.get(schema_slug, mapping_name).await? {
            return Ok(token);
        }
        let now = self.clock.now_unix();
        let response = self
            .api
            .generate_upload_token(schema_slug, mapping_name, now, TOKEN_MINUTES)
            .await?;
        let token = UploadToken {
            token_id: response.upload_id,
            upload_url: response.upload_url,
            schema_slug: schema_slug.to_string(),
            mapping_name: mapping_name.to_string(),
            expires_at: response.expires_at,
            created_at: now,
            metadata: serde_json::Value::Null,
        };
        self.tokens.store(token.clone()).await?;
        Ok(token)
    }

    /// Uploads `file_info` to `schema_slug` under `mapping_name`, retrying up
    /// to `MAX_RETRIES` times. `progress` fires at most once a second with
    /// bytes transferred so far. `cancel` is raced against each attempt and
    /// the backoff sleep between them, so a cancelled run doesn't block on
    /// either.
    pub async fn upload_file(
        &self,
        file_info: &JsonlFileInfo,
        schema_slug: &str,
        mapping_name: &str,
        progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> UploadResult {
        let started = Instant::now();
        let mut retry_count = 0u32;
        let mut last_error: Option<String> = None;
        let mut last_error_code: Option<String> = None;

        for attempt in 0..=MAX_RETRIES {
            if cancel.is_cancelled() {
                return Self::canceled_result(file_info, started, retry_count);
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Self::canceled_result(file_info, started, retry_count),
                outcome = self.attempt_once(file_info, schema_slug, mapping_name, progress.clone()) => outcome,
            };

            match outcome {
                Ok((upload_id, bytes_uploaded)) => {
                    return UploadResult {
                        success: true,
                        file_info: file_info.clone(),
                        upload_id: Some(upload_id),
                        error_message: None,
                        error_code: None,
                        duration_ms: started.elapsed().as_millis() as u64,
                        bytes_uploaded,
                        retry_count,
                    };
                }
                Err(AttemptError::Unauthorized(msg)) => {
                    let _ = self.tokens.invalidate(schema_slug, mapping_name).await;
                    last_error = Some(msg);
                    last_error_code = Some("unauthorized".to_string());
                }
                Err(AttemptError::Retryable(msg)) => {
                    last_error = Some(msg);
                    last_error_code = Some("retryable".to_string());
                }
                Err(AttemptError::Fatal(msg)) => {
                    return UploadResult {
                        success: false,
                        file_info: file_info.clone(),
                        upload_id: None,
                        error_message: Some(msg),
                        error_code: Some("fatal".to_string()),
                        duration_ms: started.elapsed().as_millis() as u64,
                        bytes_uploaded: 0,
                        retry_count,
                    };
                }
            }

            if attempt < MAX_RETRIES {
                retry_count += 1;
                let backoff = Duration::from_secs(2u64.pow(attempt));
                tracing::warn!(
                    mapping_name,
                    schema_slug,
                    attempt,
                    backoff_seconds = backoff.as_secs(),
                    error = last_error.as_deref().unwrap_or(""),
                    "upload attempt failed; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Self::canceled_result(file_info, started, retry_count),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }

        UploadResult {
            success: false,
            file_info: file_info.clone(),
            upload_id: None,
            error_message: last_error,
            error_code: last_error_code,
            duration_ms: started.elapsed().as_millis() as u64,
            bytes_uploaded: 0,
            retry_count,
        }
    }

    fn canceled_result(file_info: &JsonlFileInfo, started: Instant, retry_count: u32) -> UploadResult {
        UploadResult {
            success: false,
            file_info: file_info.clone(),
            upload_id: None,
            error_message: Some("upload canceled".to_string()),
            error_code: Some("canceled".to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
            bytes_uploaded: 0,
            retry_count,
        }
    }

    async fn attempt_once(
        &self,
        file_info: &JsonlFileInfo,
        schema_slug: &str,
        mapping_name: &str,
        progress: Option<ProgressCallback>,
    ) -> Result<(String, u64), AttemptError> {
        let token = self
            .get_upload_token(schema_slug, mapping_name)
            .await
            .map_err(|e| classify_anyhow(e))?;

        let uploaded = self
            .put_file(&token, file_info, progress)
            .await
            .map_err(classify_anyhow)?;

        let notify = self
            .api
            .notify_upload_completion(
                schema_slug,
                &token.token_id,
                file_info.file_size,
                file_info.record_count,
                &file_info.checksum,
            )
            .await
            .map_err(|e| AttemptError::Retryable(e.to_string()))?;

        if !notify.success {
            return Err(AttemptError::Retryable("server rejected upload completion".to_string()));
        }

        Ok((token.token_id, uploaded))
    }

    /// `upload_url` is a directory-style URL (§4.6): trailing slash ensured,
    /// then the file's own name appended, matching
    /// `original_source/sync/uploader.py::_perform_upload`.
    async fn put_file(
        &self,
        token: &UploadToken,
        file_info: &JsonlFileInfo,
        progress: Option<ProgressCallback>,
    ) -> Result<u64, anyhow::Error> {
        let path = Path::new(&file_info.file_path);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow::anyhow!(Fatal("upload path has no file name".to_string())))?
            .to_string();

        let mut base = token.upload_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let url = format!("{base}{file_name}");

        let std_file = std::fs::File::open(path)?;
        let total_bytes = file_info.file_size;
        let file = tokio::fs::File::from_std(std_file);

        let sent = Arc::new(AtomicU64::new(0));
        let sent_for_stream = sent.clone();
        let last_tick = Arc::new(std::sync::Mutex::new(Instant::now()));
        let start = Instant::now();

        let stream = ReaderStream::new(file.take(total_bytes)).inspect_ok(move |chunk| {
            let now = sent_for_stream.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
            if let Some(cb) = &progress {
                let mut guard = last_tick.lock().unwrap_or_else(|p| p.into_inner());
                if guard.elapsed() >= Duration::from_secs(1) || now >= total_bytes {
                    *guard = Instant::now();
                    let elapsed = start.elapsed().as_secs_f64().max(0.001);
                    let speed_bps = now as f64 / elapsed;
                    let remaining = total_bytes.saturating_sub(now);
                    let eta_seconds = if speed_bps > 0.0 { Some(remaining as f64 / speed_bps) } else { None };
                    cb(UploadProgress {
                        bytes_uploaded: now,
                        total_bytes,
                        percentage: if total_bytes > 0 { now as f64 / total_bytes as f64 * 100.0 } else { 100.0 },
                        speed_bps,
                        eta_seconds,
                    });
                }
            }
        });

        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::stream(reqwest::Body::wrap_stream(stream))
                    .file_name(file_name)
                    .mime_str("application/octet-stream")?,
            )
            .text("upload_id", token.token_id.clone())
            .text("checksum", file_info.checksum.clone());

        let response = self.api.http().put(&url).multipart(form).send().await?;
        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                let message = response.text().await.unwrap_or_default();
                return Err(Unauthorized(message).into());
            }
            s => {
                let message = response.text().await.unwrap_or_default();
                anyhow::bail!("upload PUT failed with status {s}: {message}");
            }
        }

        Ok(sent.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct Unauthorized(String);

impl std::fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unauthorized: {}", self.0)
    }
}

impl std::error::Error for Unauthorized {}

#[derive(Debug)]
struct Fatal(String);

impl std::fmt::Display for Fatal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Fatal {}

enum AttemptError {
    Unauthorized(String),
    Retryable(String),
    Fatal(String),
}

fn classify_anyhow(e: anyhow::Error) -> AttemptError {
    if let Some(unauthorized) = e.downcast_ref::<Unauthorized>() {
        return AttemptError::Unauthorized(unauthorized.0.clone());
    }
    if let Some(fatal) = e.downcast_ref::<Fatal>() {
        return AttemptError::Fatal(fatal.0.clone());
    }
    if let Some(api_err) = e.downcast_ref::<bridge_api::ApiError>() {
        if api_err.is_unauthorized() {
            return AttemptError::Unauthorized(api_err.to_string());
        }
        return AttemptError::Retryable(api_err.to_string());
    }
    AttemptError::Retryable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::{Multipart, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use bridge_core::clock::FixedClock;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct TestState {
        token_calls: Arc<AtomicUsize>,
        put_calls: Arc<AtomicUsize>,
        notify_calls: Arc<AtomicUsize>,
        fail_put_times: Arc<AtomicUsize>,
    }

    async fn spawn_server(upload_path: &'static str) -> (reqwest::Url, TestState) {
        let state = TestState::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let upload_url = format!("http://{addr}{upload_path}/");

        let app = axum::Router::new()
            .route(
                "/v1/schemas/{slug}/generate-upload-token",
                post({
                    let state = state.clone();
                    move || {
                        let state = state.clone();
                        let upload_url = upload_url.clone();
                        async move {
                            state.token_calls.fetch_add(1, Ordering::SeqCst);
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
                &format!("{upload_path}/{{file_name}}"),
                post(
                    |State(state): State<TestState>, mut multipart: Multipart| async move {
                        while let Ok(Some(field)) = multipart.next_field().await {
                            let _ = field.bytes().await;
                        }
                        let remaining = state.fail_put_times.load(Ordering::SeqCst);
                        state.put_calls.fetch_add(1, Ordering::SeqCst);
                        if remaining > 0 {
                            state.fail_put_times.fetch_sub(1, Ordering::SeqCst);
                            return AxumStatus::SERVICE_UNAVAILABLE.into_response();
                        }
                        AxumStatus::OK.into_response()
                    },
                ),
            )
            .route(
                "/v1/schemas/{slug}/uploads/notify",
                post(|State(state): State<TestState>| async move {
                    state.notify_calls.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({"success": true}))
                }),
            )
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (reqwest::Url::parse(&format!("http://{addr}/")).unwrap(), state)
    }

    fn clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock { unix: 1_700_000_000 })
    }

    async fn make_file(dir: &Path, contents: &str) -> JsonlFileInfo {
        let path = dir.join("mydb.users_users_1700000000.jsonl");
        tokio::fs::write(&path, contents).await.unwrap();
        JsonlFileInfo {
            file_path: path.to_string_lossy().to_string(),
            record_count: 1,
            file_size: contents.len() as u64,
            compressed: false,
            checksum: "deadbeef".to_string(),
            created_at: "2024-01-01T00:00:00Z".to_string(),
            mapping_name: "mydb.users".to_string(),
            schema_slug: "users".to_string(),
        }
    }

    #[tokio::test]
    async fn upload_succeeds_first_try_and_calls_notify() -> Result<(), anyhow::Error> {
        let (base, state) = spawn_server("/uploads/abc").await;

        let api = Arc::new(ApiClient::new(base, "key")?);
        let tmp = tempfile::TempDir::new()?;
        let tokens = Arc::new(TokenCache::load(tmp.path().join("upload_tokens.json"), clock()).await?);
        let uploader = FileUploader::new(api, tokens, clock());

        let file_dir = tempfile::TempDir::new()?;
        let file_info = make_file(file_dir.path(), "{\"id\":1}\n").await;

        let result = uploader.upload_file(&file_info, "users", "mydb.users", None, tokio_util::sync::CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(state.notify_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn upload_retries_then_succeeds_and_reports_retry_count() -> Result<(), anyhow::Error> {
        let (base, state) = spawn_server("/uploads/def").await;
        state.fail_put_times.store(1, Ordering::SeqCst);

        let api = Arc::new(ApiClient::new(base, "key")?);
        let tmp = tempfile::TempDir::new()?;
        let tokens = Arc::new(TokenCache::load(tmp.path().join("upload_tokens.json"), clock()).await?);
        let uploader = FileUploader::new(api, tokens, clock());

        let file_dir = tempfile::TempDir::new()?;
        let file_info = make_file(file_dir.path(), "{\"id\":1}\n").await;

        let result = uploader.upload_file(&file_info, "users", "mydb.users", None, tokio_util::sync::CancellationToken::new()).await;
        assert!(result.success, "{:?}", result.error_message);
        assert_eq!(result.retry_count, 1);
        Ok(())
    }
}
