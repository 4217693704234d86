use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Abstracts wall-clock access so runner/state-store tests don't depend on real time.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
    fn now_rfc3339(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    fn now_rfc3339(&self) -> String {
        OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
    }
}

/// Fixed-time double for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    pub unix: i64,
}

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.unix
    }

    fn now_rfc3339(&self) -> String {
        OffsetDateTime::from_unix_timestamp(self.unix)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| "1970-01-01T00:00:00Z".to_string())
    }
}

pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
