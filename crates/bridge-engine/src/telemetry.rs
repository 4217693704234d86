use std::sync::Arc;

use bridge_api::ApiClient;
use bridge_core::clock::{BRIDGE_VERSION, Clock, new_run_id};
use bridge_core::model::{TelemetryEvent, TelemetryEventType, TelemetryStatus};

/// Fire-and-forget lifecycle event emitter (§6.3). `run_id` is generated once
/// per process and reused across every event this emitter sends, matching
/// §6.3's "stable per process" requirement.
pub struct TelemetryEmitter {
    api: Arc<ApiClient>,
    clock: Arc<dyn Clock>,
    run_id: String,
    host_hostname: String,
    host_os: &'static str,
}

impl TelemetryEmitter {
    pub fn new(api: Arc<ApiClient>, clock: Arc<dyn Clock>) -> Self {
        let host_hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            api,
            clock,
            run_id: new_run_id(),
            host_hostname,
            host_os: std::env::consts::OS,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn base_event(&self, event_type: TelemetryEventType, status: TelemetryStatus, source: &str, destination: &str) -> TelemetryEvent {
        TelemetryEvent {
            event_type,
            status,
            bridge_version: BRIDGE_VERSION.to_string(),
            sent_at: self.clock.now_rfc3339(),
            idempotency_key: new_run_id(),
            host_hostname: self.host_hostname.clone(),
            host_os: self.host_os.to_string(),
            run_id: self.run_id.clone(),
            source: source.to_string(),
            destination: destination.to_string(),
            duration_ms: None,
            items_processed: None,
            bytes_uploaded: None,
            retry_count: None,
            error_message: None,
            error_code: None,
            error_stack: None,
            error_context: None,
        }
    }

    /// Errors here are logged and swallowed (§6.3) — telemetry never fails a run.
    async fn send(&self, event: TelemetryEvent) {
        if let Err(error) = self.api.send_healthcheck(&event).await {
            tracing::debug!(error = %error, event_type = ?event.event_type, "telemetry emission failed");
        }
    }

    pub async fn run_start(&self, mapping_name: &str, destination: &str) {
        self.send(self.base_event(TelemetryEventType::RunStart, TelemetryStatus::Success, mapping_name, destination))
            .await;
    }

    pub async fn run_end(
        &self,
        mapping_name: &str,
        destination: &str,
        success: bool,
        duration_ms: u64,
        items_processed: u64,
        bytes_uploaded: u64,
        retry_count: u32,
        error_message: Option<String>,
        error_code: Option<String>,
    ) {
        let mut event = self.base_event(
            TelemetryEventType::RunEnd,
            if success { TelemetryStatus::Success } else { TelemetryStatus::Error },
            mapping_name,
            destination,
        );
        event.duration_ms = Some(duration_ms);
        event.items_processed = Some(items_processed);
        event.bytes_uploaded = Some(bytes_uploaded);
        event.retry_count = Some(retry_count);
        event.error_message = error_message;
        event.error_code = error_code;
        self.send(event).await;
    }

    pub async fn error(&self, mapping_name: &str, destination: &str, error_code: &str, error_message: &str) {
        let mut event = self.base_event(TelemetryEventType::Error, TelemetryStatus::Error, mapping_name, destination);
        event.error_code = Some(error_code.to_string());
        event.error_message = Some(error_message.to_string());
        self.send(event).await;
    }

    pub async fn heartbeat(&self, source: &str, destination: &str) {
        self.send(self.base_event(TelemetryEventType::Heartbeat, TelemetryStatus::Success, source, destination))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::clock::FixedClock;
    use url::Url;

    #[test]
    fn run_id_is_stable_across_events() {
        let api = Arc::new(ApiClient::new(Url::parse("https://api.datasnap.cloud").unwrap(), "key").unwrap());
        let clock: Arc<dyn Clock> = Arc::new(FixedClock { unix: 1_700_000_000 });
        let emitter = TelemetryEmitter::new(api, clock);
        let a = emitter.base_event(TelemetryEventType::RunStart, TelemetryStatus::Success, "mydb.users", "users");
        let b = emitter.base_event(TelemetryEventType::RunEnd, TelemetryStatus::Success, "mydb.users", "users");
        assert_eq!(a.run_id, b.run_id);
        assert_ne!(a.idempotency_key, b.idempotency_key);
    }
}
