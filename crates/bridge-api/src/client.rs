use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};

use bridge_core::model::TelemetryEvent;

/// Statuses the client retries on its own, independent of the uploader's
/// retry loop (§6.1: "in addition to the uploader's own retry loop").
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const BACKOFF_FACTOR_SECS: f64 = 0.1;
const MAX_RETRIES: u32 = 1;

#[derive(Debug)]
pub enum ApiError {
    Http { status: StatusCode, message: String },
    Transport(String),
    Decode(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            ApiError::Http { status, .. } if *status == StatusCode::UNAUTHORIZED || *status == StatusCode::FORBIDDEN
        )
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::Http { status, message } => write!(f, "HTTP {status}: {message}"),
            ApiError::Transport(msg) => write!(f, "transport error: {msg}"),
            ApiError::Decode(msg) => write!(f, "response decode error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        ApiError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    #[serde(flatten)]
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaInfo {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SchemasResponse {
    data: Vec<SchemaInfo>,
}

#[derive(Debug, Serialize)]
struct GenerateUploadTokenRequest<'a> {
    mapping_name: &'a str,
    timestamp: i64,
    minutes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadTokenResponse {
    pub upload_id: String,
    pub upload_url: String,
    pub expires_at: i64,
}

#[derive(Debug, Serialize)]
struct NotifyUploadCompletionRequest<'a> {
    upload_id: &'a str,
    file_size: u64,
    record_count: u64,
    checksum: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyUploadCompletionResponse {
    pub success: bool,
}

/// HTTP client for the four remote endpoints of §6.1. Owns one pooled
/// `reqwest::Client`, shared with the uploader for its raw `PUT` calls
/// (§9's "shared HTTP session" note) via [`ApiClient::http`].
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl ApiClient {
    pub fn new(base_url: Url, api_key: impl Into<String>) -> Result<Self, anyhow::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: api_key.into(),
        })
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        let base = std::env::var("DATASNAP_API_BASE_URL").unwrap_or_else(|_| "https://api.datasnap.cloud".to_string());
        let api_key = std::env::var("DATASNAP_API_KEY")
            .map_err(|_| anyhow::anyhow!("DATASNAP_API_KEY is not set"))?;
        Self::new(Url::parse(&base)?, api_key)
    }

    /// The shared pooled client; the uploader issues its own `PUT`s through this
    /// so token endpoint, notify, and upload all share one connection pool.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.bearer_auth(&self.api_key).header("Accept", "application/json")
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::Transport(e.to_string()))
    }

    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        read_timeout: Duration,
    ) -> Result<reqwest::Response, ApiError> {
        let mut attempt = 0u32;
        loop {
            let res = build().timeout(read_timeout).send().await;
            match res {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if RETRY_STATUSES.contains(&status) && attempt < MAX_RETRIES {
                        let delay = Duration::from_secs_f64(BACKOFF_FACTOR_SECS * 2f64.powi(attempt as i32));
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    let message = response.text().await.unwrap_or_default();
                    return Err(ApiError::Http { status, message });
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let delay = Duration::from_secs_f64(BACKOFF_FACTOR_SECS * 2f64.powi(attempt as i32));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    let _ = e;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// `GET /auth/me` — used for both token validation and the heartbeat probe.
    pub async fn auth_me(&self) -> Result<UserInfo, ApiError> {
        let url = self.url("/auth/me")?;
        let res = self
            .send_with_retry(|| self.authed(self.http.get(url.clone())), Duration::from_secs(10))
            .await?;
        res.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `GET /v1/schemas`.
    pub async fn list_schemas(&self) -> Result<Vec<SchemaInfo>, ApiError> {
        let url = self.url("/v1/schemas")?;
        let res = self
            .send_with_retry(|| self.authed(self.http.get(url.clone())), Duration::from_secs(20))
            .await?;
        let body: SchemasResponse = res.json().await.map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(body.data)
    }

    /// `POST /v1/schemas/{slug}/generate-upload-token`.
    pub async fn generate_upload_token(
        &self,
        schema_slug: &str,
        mapping_name: &str,
        timestamp: i64,
        minutes: u32,
    ) -> Result<UploadTokenResponse, ApiError> {
        let url = self.url(&format!("/v1/schemas/{schema_slug}/generate-upload-token"))?;
        let body = GenerateUploadTokenRequest {
            mapping_name,
            timestamp,
            minutes,
        };
        let res = self
            .send_with_retry(
                || self.authed(self.http.post(url.clone())).json(&body),
                Duration::from_secs(20),
            )
            .await?;
        res.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `POST /v1/schemas/{slug}/uploads/notify` — confirms a completed `PUT`.
    /// Not itemised separately in the endpoint table (§6.1) but required by
    /// §4.6 step 3; `original_source/sync/uploader.py::_notify_upload_completion`
    /// resolves both its existence and its `{success: bool}` response shape.
    pub async fn notify_upload_completion(
        &self,
        schema_slug: &str,
        upload_id: &str,
        file_size: u64,
        record_count: u64,
        checksum: &str,
    ) -> Result<NotifyUploadCompletionResponse, ApiError> {
        let url = self.url(&format!("/v1/schemas/{schema_slug}/uploads/notify"))?;
        let body = NotifyUploadCompletionRequest {
            upload_id,
            file_size,
            record_count,
            checksum,
        };
        let res = self
            .send_with_retry(
                || self.authed(self.http.post(url.clone())).json(&body),
                Duration::from_secs(20),
            )
            .await?;
        res.json().await.map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// `POST /v1/bridge/healthcheck`. Errors here are the caller's problem to
    /// swallow (§6.3: "logged and swallowed — never propagate").
    pub async fn send_healthcheck(&self, event: &TelemetryEvent) -> Result<(), ApiError> {
        let url = self.url("/v1/bridge/healthcheck")?;
        self.send_with_retry(
            || self.authed(self.http.post(url.clone())).json(event),
            Duration::from_secs(10),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct TestState {
        auth_me_calls: Arc<AtomicUsize>,
    }

    async fn spawn_server() -> (Url, TestState) {
        let state = TestState::default();
        let app = axum::Router::new()
            .route(
                "/auth/me",
                get(|State(state): State<TestState>| async move {
                    let n = state.auth_me_calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n == 1 {
                        return AxumStatus::SERVICE_UNAVAILABLE.into_response();
                    }
                    Json(serde_json::json!({"id": "u1", "email": "a@b.com"})).into_response()
                }),
            )
            .route(
                "/v1/schemas",
                get(|| async { Json(serde_json::json!({"data": [{"id":"1","slug":"users","name":"Users"}]})) }),
            )
            .route(
                "/v1/schemas/{slug}/generate-upload-token",
                post(|| async {
                    Json(serde_json::json!({
                        "upload_id": "up1",
                        "upload_url": "https://upload.example/u1",
                        "expires_at": 9_999_999_999i64,
                    }))
                }),
            )
            .route(
                "/v1/schemas/{slug}/uploads/notify",
                post(|| async { Json(serde_json::json!({"success": true})) }),
            )
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), state)
    }

    #[tokio::test]
    async fn auth_me_retries_once_on_503() {
        let (base, state) = spawn_server().await;
        let client = ApiClient::new(base, "key").unwrap();
        let user = client.auth_me().await.unwrap();
        assert_eq!(state.auth_me_calls.load(Ordering::SeqCst), 2);
        assert_eq!(user.fields["id"], "u1");
    }

    #[tokio::test]
    async fn list_schemas_parses_data_array() {
        let (base, _state) = spawn_server().await;
        let client = ApiClient::new(base, "key").unwrap();
        let schemas = client.list_schemas().await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].slug, "users");
    }

    #[tokio::test]
    async fn generate_upload_token_parses_response() {
        let (base, _state) = spawn_server().await;
        let client = ApiClient::new(base, "key").unwrap();
        let token = client
            .generate_upload_token("users", "mydb.users", 1_704_067_200, 30)
            .await
            .unwrap();
        assert_eq!(token.upload_id, "up1");
        assert_eq!(token.upload_url, "https://upload.example/u1");
    }

    #[tokio::test]
    async fn notify_upload_completion_parses_success_flag() {
        let (base, _state) = spawn_server().await;
        let client = ApiClient::new(base, "key").unwrap();
        let result = client
            .notify_upload_completion("users", "up1", 1024, 10, "deadbeef")
            .await
            .unwrap();
        assert!(result.success);
    }
}
